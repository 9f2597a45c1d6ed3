// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data-access service.
//!
//! [`DataAccess`] ties the components together:
//! - a bounded [`ConnectionPool`] of MySQL sessions with health checks
//! - a [`QueryExecutor`] that probes, retries and disposes sessions
//! - a [`CircuitBreaker`] in front of every backend round trip
//! - a two-tier [`CacheTier`] with category and pattern invalidation
//!
//! ```text
//!   execute_query_with_cache
//!        │
//!        ▼
//!   CacheTier ──hit──► result
//!        │ miss
//!        ▼
//!   CircuitBreaker ──open──► CircuitOpen
//!        │
//!        ▼
//!   QueryExecutor ──► ConnectionPool ──► MySQL
//! ```
//!
//! Cache hits never touch the breaker, so cached reads keep working while
//! the circuit is open.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use stamps_data::{DataAccess, DataAccessConfig, ServiceState, Ttl, sql_params};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), stamps_data::DataError> {
//! let service = DataAccess::connect(DataAccessConfig::from_env()?).await?;
//! assert_eq!(service.state(), ServiceState::Ready);
//!
//! let rows = service
//!     .execute_query_with_cache(
//!         "SELECT cpid, stamp FROM stamps WHERE block_index > ?",
//!         &sql_params![840_000],
//!         Ttl::secs(60),
//!     )
//!     .await?;
//! println!("{} stamps", rows.rows().len());
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{HealthSnapshot, ServiceState};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::cache::CacheTier;
use crate::config::DataAccessConfig;
use crate::error::DataError;
use crate::pool::ConnectionPool;
use crate::query::QueryExecutor;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::storage::redis::RedisConnector;
use crate::storage::sql::MySqlConnector;
use crate::storage::traits::{Connector, RemoteCacheConnector};

/// Name of the breaker guarding database round trips.
pub const DATABASE_CIRCUIT: &str = "database";

/// The data-access service. Build one at process start and share it by
/// reference or `Arc`.
///
/// # Thread Safety
///
/// `DataAccess` is `Send + Sync`; every method takes `&self`.
pub struct DataAccess {
    pub(super) config: DataAccessConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<ServiceState>,
    pub(super) state_rx: watch::Receiver<ServiceState>,

    pub(super) pool: Arc<ConnectionPool>,
    pub(super) executor: QueryExecutor,
    pub(super) breaker: CircuitBreaker,
    pub(super) cache: CacheTier,

    /// Resolved once at construction from environment and `CACHE`
    pub(super) caching: bool,
}

impl DataAccess {
    /// Build the service against MySQL and, when configured, Redis.
    ///
    /// No connection is made until [`start`](Self::start).
    pub fn new(config: DataAccessConfig) -> Result<Self, DataError> {
        config.validate()?;
        let connector: Arc<dyn Connector> = Arc::new(MySqlConnector::from_config(&config));
        let remote = RedisConnector::from_config(&config)
            .map(|c| Arc::new(c) as Arc<dyn RemoteCacheConnector>);
        Ok(Self::with_backends(config, connector, remote))
    }

    /// Build and start in one step.
    pub async fn connect(config: DataAccessConfig) -> Result<Self, DataError> {
        let service = Self::new(config)?;
        service.start().await?;
        Ok(service)
    }

    /// Build the service over arbitrary backends.
    ///
    /// `remote` is ignored when caching is disabled for the environment.
    pub fn with_backends(
        config: DataAccessConfig,
        connector: Arc<dyn Connector>,
        remote: Option<Arc<dyn RemoteCacheConnector>>,
    ) -> Self {
        let caching = config.caching_enabled();
        let pool = Arc::new(ConnectionPool::new(connector, config.pool_config()));
        let executor = QueryExecutor::new(pool.clone(), config.retry_config(), config.query_timeout());
        let breaker = CircuitBreaker::new(DATABASE_CIRCUIT, config.circuit_config());
        let cache = CacheTier::new(
            remote.filter(|_| caching),
            config.reconnect_config(),
            config.local_cache_max_entries,
        );
        let (state, state_rx) = watch::channel(ServiceState::Created);

        info!(
            environment = ?config.environment,
            caching,
            max_pool_size = config.pool_max_size,
            "Data access service created"
        );
        crate::metrics::set_service_state(ServiceState::Created.as_str());

        Self {
            config,
            state,
            state_rx,
            pool,
            executor,
            breaker,
            cache,
            caching,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DataAccessConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Whether reads go through the cache tiers.
    #[must_use]
    pub fn caching_enabled(&self) -> bool {
        self.caching
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn cache(&self) -> &CacheTier {
        &self.cache
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(super) fn set_state(&self, next: ServiceState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Service state changed");
            crate::metrics::set_service_state(next.as_str());
        }
    }
}
