// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the data-access service.
//!
//! # Example
//!
//! ```
//! use stamps_data::DataAccessConfig;
//!
//! // Minimal config (uses defaults)
//! let config = DataAccessConfig::default();
//! assert_eq!(config.db_port, 3306);
//! assert_eq!(config.db_max_retries, 5);
//!
//! // Full config
//! let config = DataAccessConfig {
//!     db_host: "db.internal".into(),
//!     db_user: "stamps".into(),
//!     db_name: "btc_stamps".into(),
//!     elasticache_endpoint: Some("cache.internal".into()),
//!     pool_max_size: 20,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! In deployments the config is read from the process environment with
//! [`DataAccessConfig::from_env`]: `DB_HOST`, `DB_PORT`, `DB_USER`,
//! `DB_PASSWORD`, `DB_NAME`, `DB_MAX_RETRIES`, `ELASTICACHE_ENDPOINT`,
//! `ELASTICACHE_PORT`, `ELASTICACHE_TLS`, `ENVIRONMENT` (or its older name
//! `DENO_ENV`), `CACHE` and the tuning keys named after the fields below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::pool::PoolConfig;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

/// Configuration for [`crate::DataAccess`].
///
/// All fields have defaults. At minimum, set the `db_*` credentials for
/// production use; leave `elasticache_endpoint` empty to run local-only.
#[derive(Debug, Clone, Deserialize)]
pub struct DataAccessConfig {
    #[serde(default = "default_db_host")]
    pub db_host: String,
    #[serde(default)]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    #[serde(default)]
    pub db_name: String,

    /// Total attempts per query, also the reconnect budget for the cache tier
    #[serde(default = "default_db_max_retries")]
    pub db_max_retries: usize,

    /// Distributed cache host. Empty or unset runs the local tier only.
    #[serde(default)]
    pub elasticache_endpoint: Option<String>,
    #[serde(default = "default_elasticache_port")]
    pub elasticache_port: u16,
    #[serde(default = "default_true")]
    pub elasticache_tls: bool,
    /// Optional namespace prepended to every distributed-tier key
    #[serde(default)]
    pub cache_key_prefix: Option<String>,

    #[serde(default)]
    pub environment: Environment,
    /// `false` bypasses both cache tiers
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Pool sizing
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,
    #[serde(default = "default_pool_min_connections")]
    pub pool_min_connections: usize,

    /// Backoff: first delay and cap, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_cache_op_timeout_ms")]
    pub cache_op_timeout_ms: u64,
    /// Per-query deadline; unset means no deadline
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,

    #[serde(default = "default_local_cache_max_entries")]
    pub local_cache_max_entries: usize,

    /// Circuit breaker tuning; unset fields fall back to the environment preset
    #[serde(default)]
    pub breaker_failure_threshold: Option<u32>,
    #[serde(default)]
    pub breaker_recovery_timeout_ms: Option<u64>,
}

fn default_db_host() -> String { "localhost".into() }
fn default_db_port() -> u16 { 3306 }
fn default_db_max_retries() -> usize { 5 }
fn default_elasticache_port() -> u16 { 6379 }
fn default_true() -> bool { true }
fn default_pool_max_size() -> usize { 10 }
fn default_pool_min_connections() -> usize { 2 }
fn default_retry_interval_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 5_000 }
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_cache_op_timeout_ms() -> u64 { 2_000 }
fn default_local_cache_max_entries() -> usize { 100_000 }

impl Default for DataAccessConfig {
    fn default() -> Self {
        Self {
            db_host: default_db_host(),
            db_user: String::new(),
            db_password: String::new(),
            db_port: default_db_port(),
            db_name: String::new(),
            db_max_retries: default_db_max_retries(),
            elasticache_endpoint: None,
            elasticache_port: default_elasticache_port(),
            elasticache_tls: true,
            cache_key_prefix: None,
            environment: Environment::default(),
            cache: true,
            pool_max_size: default_pool_max_size(),
            pool_min_connections: default_pool_min_connections(),
            retry_interval_ms: default_retry_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            cache_op_timeout_ms: default_cache_op_timeout_ms(),
            query_timeout_ms: None,
            local_cache_max_entries: default_local_cache_max_entries(),
            breaker_failure_threshold: None,
            breaker_recovery_timeout_ms: None,
        }
    }
}

impl DataAccessConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, DataError> {
        Self::from_source(config::Environment::default())
    }

    /// Load from an explicit environment source (tests inject a map here).
    pub fn from_source(source: config::Environment) -> Result<Self, DataError> {
        let raw = config::Config::builder()
            .add_source(source.try_parsing(true))
            .build()
            .map_err(|e| DataError::Config(e.to_string()))?;
        let mut config: Self = raw
            .clone()
            .try_deserialize()
            .map_err(|e| DataError::Config(e.to_string()))?;
        // DENO_ENV is the legacy name; ENVIRONMENT wins when both are set
        if raw.get_string("environment").is_err() {
            match raw.get::<Environment>("deno_env") {
                Ok(legacy) => config.environment = legacy,
                Err(config::ConfigError::NotFound(_)) => {}
                Err(e) => return Err(DataError::Config(e.to_string())),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.pool_max_size == 0 {
            return Err(DataError::Config("pool_max_size must be at least 1".into()));
        }
        if self.pool_min_connections > self.pool_max_size {
            return Err(DataError::Config(format!(
                "pool_min_connections ({}) exceeds pool_max_size ({})",
                self.pool_min_connections, self.pool_max_size
            )));
        }
        if self.db_max_retries == 0 {
            return Err(DataError::Config("db_max_retries must be at least 1".into()));
        }
        if self.max_backoff_ms < self.retry_interval_ms {
            return Err(DataError::Config("max_backoff_ms is below retry_interval_ms".into()));
        }
        Ok(())
    }

    /// Caching is off in development and when `CACHE=false`.
    #[must_use]
    pub fn caching_enabled(&self) -> bool {
        self.cache && self.environment != Environment::Development
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn cache_op_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_op_timeout_ms)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max_size,
            min_connections: self.pool_min_connections,
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            ..PoolConfig::default()
        }
    }

    /// Backoff for query retries.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_interval_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            max_attempts: self.db_max_retries,
            ..RetryConfig::query()
        }
    }

    /// Backoff for distributed-tier reconnects. Shares the query budget.
    #[must_use]
    pub fn reconnect_config(&self) -> RetryConfig {
        self.retry_config()
    }

    /// Breaker preset for the environment, with any explicit overrides.
    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        let mut config = match self.environment {
            Environment::Development => CircuitConfig::lenient(),
            Environment::Test | Environment::Production => CircuitConfig::default(),
        };
        if let Some(threshold) = self.breaker_failure_threshold {
            config.failure_threshold = threshold.max(1);
        }
        if let Some(ms) = self.breaker_recovery_timeout_ms {
            config.recovery_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// `redis://` or `rediss://` URL for the distributed tier, if configured.
    #[must_use]
    pub fn redis_url(&self) -> Option<String> {
        let host = self.elasticache_endpoint.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
        let scheme = if self.elasticache_tls { "rediss" } else { "redis" };
        Some(format!("{scheme}://{host}:{}", self.elasticache_port))
    }
}
