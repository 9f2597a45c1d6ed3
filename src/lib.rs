// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # stamps-data
//!
//! Resilient data-access core for a Bitcoin Stamps explorer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DataAccess                           │
//! │  • execute_query / execute_query_with_cache                │
//! │  • category and pattern invalidation                       │
//! │  • connection, breaker and cache introspection             │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────────┐  ┌──────────────────────────┐
//! │          CacheTier            │  │      CircuitBreaker      │
//! │  • Redis (distributed)        │  │  • closed / open /       │
//! │  • DashMap (local fallback)   │  │    half-open             │
//! │  • supervised reconnect       │  └──────────────────────────┘
//! │  • CacheKeyRegistry           │               │
//! └───────────────────────────────┘               ▼
//!                                   ┌──────────────────────────┐
//!                                   │      QueryExecutor       │
//!                                   │  • liveness probe        │
//!                                   │  • backoff retry         │
//!                                   └──────────────────────────┘
//!                                                 │
//!                                                 ▼
//!                                   ┌──────────────────────────┐
//!                                   │     ConnectionPool       │
//!                                   │  • LIFO, fail fast       │
//!                                   │  • health-check eviction │
//!                                   └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stamps_data::{sql_params, DataAccess, DataAccessConfig, Ttl};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Balance {
//!     tick: String,
//!     amt: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stamps_data::DataError> {
//!     let service = DataAccess::connect(DataAccessConfig::from_env()?).await?;
//!
//!     let balances: Vec<Balance> = service
//!         .query_as_cached(
//!             "SELECT tick, amt FROM balances WHERE address = ?",
//!             &sql_params!["bc1qexample"],
//!             Ttl::secs(30),
//!         )
//!         .await?;
//!     println!("{} balances", balances.len());
//!
//!     // After a write, drop every cached balance lookup
//!     service.invalidate_cache_by_category("balance").await;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`DataAccess`] service
//! - [`pool`]: bounded session pool with health checks
//! - [`query`]: parameters, results and the retrying executor
//! - [`cache`]: two-tier cache, key registry and invalidation
//! - [`resilience`]: retry policy and circuit breaker
//! - [`storage`]: MySQL, Redis and in-memory backends
//! - [`metrics`]: metric recording helpers

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod resilience;
pub mod storage;

#[cfg(test)]
mod testing;

pub use cache::{
    CacheCategory, CacheKey, CacheKeyRegistry, CacheStatus, CacheTier, InvalidationReport, ReconnectState, Ttl,
};
pub use config::{DataAccessConfig, Environment};
pub use coordinator::{DataAccess, HealthSnapshot, ServiceState, DATABASE_CIRCUIT};
pub use error::DataError;
pub use metrics::LatencyTimer;
pub use pool::{ConnectionPool, ConnectionStats, HealthReport, Lease, PoolConfig};
pub use query::{QueryExecutor, QueryOutput, Row, SqlParam, WriteSummary};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitMetrics, CircuitState};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{CacheError, Connector, RemoteCache, RemoteCacheConnector, Session, TierRead};
