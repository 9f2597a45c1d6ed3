// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query, cache and introspection API for [`DataAccess`].

use serde::de::DeserializeOwned;
use tracing::debug;

use super::{DataAccess, HealthSnapshot};
use crate::cache::{CacheCategory, CacheKey, CacheStatus, InvalidationReport, Ttl};
use crate::error::DataError;
use crate::pool::ConnectionStats;
use crate::query::{QueryOutput, SqlParam};
use crate::resilience::circuit_breaker::CircuitMetrics;

impl DataAccess {
    /// Run `sql` against the database through the circuit breaker.
    ///
    /// Connection-class failures are retried inside one breaker call, so the
    /// breaker sees a failure only once the retry budget is spent.
    #[tracing::instrument(skip(self, params), fields(params = params.len()))]
    pub async fn execute_query(&self, sql: &str, params: &[SqlParam]) -> Result<QueryOutput, DataError> {
        self.breaker
            .execute_classified(|| self.executor.execute_query(sql, params), DataError::is_backend_failure)
            .await
            .map_err(DataError::from)
    }

    /// Run `sql` and decode every row into `T`.
    pub async fn query_as<T: DeserializeOwned>(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<T>, DataError> {
        self.execute_query(sql, params).await?.decode()
    }

    /// Read-through variant of [`execute_query`](Self::execute_query).
    ///
    /// The cache key is the digest of `sql` and `params`; on a miss the
    /// result is cached for `ttl` and the key is registered under the
    /// query's category. With caching disabled this is a plain query.
    #[tracing::instrument(skip(self, params, ttl), fields(params = params.len()))]
    pub async fn execute_query_with_cache(
        &self,
        sql: &str,
        params: &[SqlParam],
        ttl: Ttl,
    ) -> Result<QueryOutput, DataError> {
        if !self.caching {
            return self.execute_query(sql, params).await;
        }
        let key = CacheKey::for_query(sql, params)?;
        self.cache
            .handle_query(&key, sql, || self.execute_query(sql, params), ttl)
            .await
    }

    /// Cached [`query_as`](Self::query_as).
    pub async fn query_as_cached<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[SqlParam],
        ttl: Ttl,
    ) -> Result<Vec<T>, DataError> {
        self.execute_query_with_cache(sql, params, ttl).await?.decode()
    }

    /// Delete every cached key matching the glob `pattern` (`*`, `?`) from
    /// both tiers.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_cache_by_pattern(&self, pattern: &str) -> Result<InvalidationReport, DataError> {
        self.cache.invalidate_pattern(pattern).await
    }

    /// Delete every key registered under `category` (case-insensitive name)
    /// from both tiers. Returns the number of keys dropped from the registry.
    ///
    /// A name no query is ever classified under has nothing registered, so
    /// it is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate_cache_by_category(&self, category: &str) -> usize {
        match category.parse::<CacheCategory>() {
            Ok(category) => self.cache.invalidate_category(category).await,
            Err(_) => {
                debug!(category, "No cached keys registered for unknown category");
                0
            }
        }
    }

    /// Keys currently registered under `category`, sorted. Empty for an
    /// unknown name.
    #[must_use]
    pub fn cache_keys_by_category(&self, category: &str) -> Vec<CacheKey> {
        category
            .parse::<CacheCategory>()
            .map(|category| self.cache.registry().keys_for(category))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        self.pool.stats()
    }

    #[must_use]
    pub fn circuit_breaker_metrics(&self) -> CircuitMetrics {
        self.breaker.metrics()
    }

    #[must_use]
    pub fn cache_status(&self) -> CacheStatus {
        self.cache.status()
    }

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let snapshot = HealthSnapshot {
            state: self.state(),
            caching_enabled: self.caching,
            pool: self.connection_stats(),
            circuit: self.circuit_breaker_metrics(),
            cache: self.cache_status(),
        };
        debug!(healthy = snapshot.is_healthy(), "Health snapshot taken");
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::super::ServiceState;
    use super::*;
    use crate::config::{DataAccessConfig, Environment};
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::sql_params;
    use crate::storage::traits::RemoteCacheConnector;
    use crate::testing::{ScriptedConnector, ScriptedRemoteConnector, Step};
    use serde::Deserialize;
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> DataAccessConfig {
        DataAccessConfig {
            environment: Environment::Production,
            db_max_retries: 1,
            retry_interval_ms: 1,
            max_backoff_ms: 10,
            breaker_failure_threshold: Some(2),
            ..DataAccessConfig::default()
        }
    }

    fn service(connector: &Arc<ScriptedConnector>, config: DataAccessConfig) -> DataAccess {
        DataAccess::with_backends(config, connector.clone(), None)
    }

    #[tokio::test]
    async fn test_execute_query_returns_rows() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());

        let out = svc.execute_query("SELECT 1", &[]).await.unwrap();
        assert_eq!(out.rows().len(), 1);
        assert_eq!(svc.circuit_breaker_metrics().calls_total, 1);
        assert_eq!(svc.connection_stats().idle, 1);
    }

    #[tokio::test]
    async fn test_query_as_decodes_rows() {
        #[derive(Deserialize)]
        struct Echo {
            session: u64,
            sql: String,
        }

        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());

        let rows: Vec<Echo> = svc.query_as("SELECT * FROM stamps", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session, 1);
        assert_eq!(rows[0].sql, "SELECT * FROM stamps");
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_skips_backend() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.push_steps([Step::ConnectionLost, Step::ConnectionLost]);
        let svc = service(&connector, config());

        for _ in 0..2 {
            let err = svc.execute_query("SELECT 1", &[]).await.unwrap_err();
            assert!(err.is_connection_class());
        }
        assert_eq!(svc.circuit_breaker_metrics().state, CircuitState::Open);

        let err = svc.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DataError::CircuitOpen { .. }));
        assert_eq!(connector.executes(), 2, "open circuit never reaches the backend");

        tokio::time::advance(Duration::from_secs(31)).await;
        svc.execute_query("SELECT 1", &[]).await.unwrap();
        let metrics = svc.circuit_breaker_metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_query_errors_do_not_trip_breaker() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.push_steps([Step::Syntax, Step::Syntax, Step::Syntax]);
        let svc = service(&connector, config());

        for _ in 0..3 {
            let err = svc.execute_query("SELEC 1", &[]).await.unwrap_err();
            assert!(matches!(err, DataError::Query(_)));
        }
        assert_eq!(svc.circuit_breaker_metrics().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cached_query_fetches_once() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());
        let params = sql_params!["bc1qxyz"];

        let first = svc
            .execute_query_with_cache("SELECT * FROM balances WHERE address = ?", &params, Ttl::secs(60))
            .await
            .unwrap();
        let second = svc
            .execute_query_with_cache("SELECT * FROM balances WHERE address = ?", &params, Ttl::secs(60))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(connector.executes(), 1);
        assert_eq!(svc.cache_keys_by_category("balance").len(), 1);
    }

    #[tokio::test]
    async fn test_development_bypasses_cache() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(
            &connector,
            DataAccessConfig {
                environment: Environment::Development,
                ..config()
            },
        );
        assert!(!svc.caching_enabled());

        for _ in 0..2 {
            svc.execute_query_with_cache("SELECT * FROM stamps", &[], Ttl::Never)
                .await
                .unwrap();
        }
        assert_eq!(connector.executes(), 2);
        assert_eq!(svc.cache_status().local_entries, 0);
    }

    #[tokio::test]
    async fn test_category_invalidation_is_targeted() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());
        let balance_sql = "SELECT amt FROM balances WHERE address = ?";
        let stamp_sql = "SELECT * FROM stamps WHERE cpid = ?";

        svc.execute_query_with_cache(balance_sql, &sql_params!["bc1q"], Ttl::Never).await.unwrap();
        svc.execute_query_with_cache(stamp_sql, &sql_params!["A123"], Ttl::Never).await.unwrap();
        assert_eq!(connector.executes(), 2);

        assert_eq!(svc.invalidate_cache_by_category("BALANCE").await, 1);

        svc.execute_query_with_cache(balance_sql, &sql_params!["bc1q"], Ttl::Never).await.unwrap();
        svc.execute_query_with_cache(stamp_sql, &sql_params!["A123"], Ttl::Never).await.unwrap();
        assert_eq!(connector.executes(), 3, "only the balance query is refetched");
    }

    #[tokio::test]
    async fn test_unknown_category_is_a_noop() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());
        svc.execute_query_with_cache("SELECT * FROM balances", &[], Ttl::Never).await.unwrap();

        assert_eq!(svc.invalidate_cache_by_category("creator").await, 0);
        assert!(svc.cache_keys_by_category("creator").is_empty());
        assert_eq!(svc.cache_keys_by_category("balance").len(), 1, "other categories untouched");
        assert_eq!(svc.cache_status().local_entries, 1);
    }

    #[tokio::test]
    async fn test_pattern_invalidation_clears_local_tier() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());
        svc.execute_query_with_cache("SELECT * FROM blocks", &[], Ttl::Never).await.unwrap();

        let report = svc.invalidate_cache_by_pattern("*").await.unwrap();
        assert_eq!(report.local, 1);
        assert!(report.remote_complete);
        assert_eq!(svc.cache_status().local_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hits_served_while_circuit_open() {
        let connector = Arc::new(ScriptedConnector::new());
        let svc = service(&connector, config());
        let sql = "SELECT * FROM dispensers";

        svc.execute_query_with_cache(sql, &[], Ttl::Never).await.unwrap();
        connector.push_steps([Step::ConnectionLost, Step::ConnectionLost]);
        let _ = svc.execute_query("SELECT 1", &[]).await;
        let _ = svc.execute_query("SELECT 1", &[]).await;
        assert_eq!(svc.circuit_breaker_metrics().state, CircuitState::Open);

        let cached = svc.execute_query_with_cache(sql, &[], Ttl::Never).await.unwrap();
        assert_eq!(cached.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let connector = Arc::new(ScriptedConnector::new());
        let remote = Arc::new(ScriptedRemoteConnector::healthy());
        let svc = DataAccess::with_backends(
            config(),
            connector.clone(),
            Some(remote as Arc<dyn RemoteCacheConnector>),
        );
        assert_eq!(svc.state(), ServiceState::Created);

        svc.start().await.unwrap();
        assert!(svc.is_ready());
        assert_eq!(connector.created(), 2, "warm-up opens min_connections");
        assert!(svc.cache_status().remote_available);
        assert!(svc.health().is_healthy());

        svc.shutdown().await;
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(connector.live(), 0);
        assert!(matches!(svc.execute_query("SELECT 1", &[]).await, Err(DataError::PoolClosed)));
        assert!(matches!(svc.start().await, Err(DataError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_start_tolerates_unreachable_database() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_connect_failing(true);
        let svc = service(&connector, config());

        svc.start().await.unwrap();
        assert!(svc.is_ready());
        assert_eq!(svc.connection_stats().total, 0);
        svc.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rearms_exhausted_reconnect() {
        let connector = Arc::new(ScriptedConnector::new());
        let remote = Arc::new(ScriptedRemoteConnector::failing());
        let svc = DataAccess::with_backends(
            DataAccessConfig {
                db_max_retries: 2,
                retry_interval_ms: 100,
                max_backoff_ms: 1_000,
                ..config()
            },
            connector,
            Some(remote.clone() as Arc<dyn RemoteCacheConnector>),
        );

        svc.start().await.unwrap();
        assert!(!svc.cache_status().remote_available);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(svc.cache_status().reconnect, crate::cache::ReconnectState::Exhausted);

        remote.set_failing(false);
        assert_eq!(svc.reset(), crate::cache::ReconnectState::Armed);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = svc.cache_status();
        assert!(status.remote_available);
        assert_eq!(status.reconnect, crate::cache::ReconnectState::Idle);
        svc.shutdown().await;
    }
}
