// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier read-through cache.
//!
//! ```text
//!   get ──► distributed tier ──Hit──► value
//!              │       └──Miss──► miss
//!              │ Unavailable
//!              ▼
//!         mark down, arm reconnect ──► local tier ──► value | miss
//!
//!   set ──► local tier (always)
//!       └─► distributed tier (when available and ttl > 0)
//! ```
//!
//! The local tier is always written, so it keeps serving whatever was cached
//! while the distributed tier is away. Concurrent misses for the same key
//! each run their fetch; there is no request coalescing.

pub mod invalidation;
pub mod key;
pub(crate) mod reconnect;
pub mod registry;

pub use invalidation::{glob_to_regex, InvalidationReport};
use invalidation::PendingDeletes;
pub use key::CacheKey;
pub use reconnect::ReconnectState;
pub use registry::{CacheCategory, CacheKeyRegistry};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DataError;
use crate::resilience::retry::RetryConfig;
use crate::storage::memory::LocalCache;
use crate::storage::traits::{CacheError, RemoteCacheConnector, TierRead};
use reconnect::{ReconnectSupervisor, RemoteSlot};

/// Lifetime of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Expire after this many milliseconds. Non-positive values are kept out
    /// of the distributed tier and are already stale locally.
    Millis(i64),
    /// Never expire.
    Never,
}

impl Ttl {
    #[must_use]
    pub fn secs(secs: u64) -> Self {
        Ttl::Millis(i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX))
    }

    fn local_duration(self) -> Option<Duration> {
        match self {
            Ttl::Never => None,
            Ttl::Millis(ms) => Some(Duration::from_millis(ms.max(0) as u64)),
        }
    }

    /// `None` means the write must not reach the distributed tier.
    fn remote_duration(self) -> Option<Option<Duration>> {
        match self {
            Ttl::Never => Some(None),
            Ttl::Millis(ms) if ms <= 0 => None,
            Ttl::Millis(ms) => Some(Some(Duration::from_millis(ms as u64))),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::Millis(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

/// Snapshot of the cache tier for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub remote_configured: bool,
    pub remote_available: bool,
    pub reconnect: ReconnectState,
    pub reconnect_attempts: u64,
    pub local_entries: usize,
    /// Deletes waiting for the distributed tier to come back
    pub pending_deletes: usize,
    pub categories: BTreeMap<CacheCategory, usize>,
}

pub struct CacheTier {
    local: LocalCache,
    remote: Arc<RemoteSlot>,
    reconnect: ReconnectSupervisor,
    registry: CacheKeyRegistry,
    pending: Arc<PendingDeletes>,
}

impl CacheTier {
    /// Build a tier. Without a connector the tier is local-only.
    pub fn new(
        connector: Option<Arc<dyn RemoteCacheConnector>>,
        reconnect_policy: RetryConfig,
        local_max_entries: usize,
    ) -> Self {
        let remote = Arc::new(RemoteSlot::new());
        let pending = Arc::new(PendingDeletes::default());
        Self {
            local: LocalCache::with_capacity_limit(local_max_entries),
            reconnect: ReconnectSupervisor::new(connector, remote.clone(), pending.clone(), reconnect_policy),
            remote,
            registry: CacheKeyRegistry::new(),
            pending,
        }
    }

    /// Local-only tier with no capacity limit.
    #[must_use]
    pub fn local_only() -> Self {
        Self::new(None, RetryConfig::default(), usize::MAX)
    }

    /// Connect the distributed tier. On failure the tier runs local-only and
    /// a background reconnect is armed.
    pub async fn connect_remote(&self) -> bool {
        if !self.reconnect.has_connector() {
            debug!("No distributed cache configured, using local tier only");
            return false;
        }
        match self.reconnect.connect_once().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Distributed cache unavailable at startup, falling back to local tier");
                crate::metrics::set_remote_available(false);
                self.reconnect.arm();
                false
            }
        }
    }

    #[must_use]
    pub fn is_remote_available(&self) -> bool {
        self.remote.is_available()
    }

    #[must_use]
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    #[must_use]
    pub fn registry(&self) -> &CacheKeyRegistry {
        &self.registry
    }

    /// Read the raw serialized value for `key`.
    pub async fn get_raw(&self, key: &CacheKey) -> Option<String> {
        if let Some(remote) = self.remote.current() {
            let replayed = if self.pending.is_empty() {
                Ok(0)
            } else {
                self.pending.replay(remote.as_ref()).await
            };
            let read = match replayed {
                Ok(_) => remote.get(key.as_str()).await,
                Err(e) => TierRead::Unavailable(e),
            };
            match read {
                TierRead::Hit(value) => {
                    crate::metrics::record_cache_lookup("remote", "hit");
                    return Some(value);
                }
                TierRead::Miss => {
                    crate::metrics::record_cache_lookup("remote", "miss");
                    return None;
                }
                TierRead::Unavailable(e) => self.degrade("get", &e),
            }
        }

        let value = self.local.get(key.as_str());
        crate::metrics::record_cache_lookup("local", if value.is_some() { "hit" } else { "miss" });
        value
    }

    /// Read and decode `key`. An entry that no longer decodes is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Store a raw serialized value in both tiers per the TTL rules.
    pub async fn set_raw(&self, key: &CacheKey, value: String, ttl: Ttl) {
        self.local.set(key.as_str(), value.clone(), ttl.local_duration());
        crate::metrics::record_cache_write("local");

        let Some(remote_ttl) = ttl.remote_duration() else {
            return;
        };
        if let Some(remote) = self.remote.current() {
            match remote.set(key.as_str(), &value, remote_ttl).await {
                Ok(()) => crate::metrics::record_cache_write("remote"),
                Err(e) => self.degrade("set", &e),
            }
        }
    }

    /// Serialize and store `value`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T, ttl: Ttl) -> Result<(), DataError> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw, ttl).await;
        Ok(())
    }

    /// Read-through: return the cached value or run `fetch` and cache its result.
    pub async fn handle_cache<T, F, Fut>(&self, key: &CacheKey, fetch: F, ttl: Ttl) -> Result<T, DataError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        self.read_through(key, None, fetch, ttl).await
    }

    /// Read-through for a query result; the key is registered under the
    /// query's category once the result is cached.
    pub async fn handle_query<T, F, Fut>(&self, key: &CacheKey, sql: &str, fetch: F, ttl: Ttl) -> Result<T, DataError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        self.read_through(key, Some(sql), fetch, ttl).await
    }

    async fn read_through<T, F, Fut>(&self, key: &CacheKey, sql: Option<&str>, fetch: F, ttl: Ttl) -> Result<T, DataError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let value = fetch().await?;
        match serde_json::to_string(&value) {
            Ok(raw) => {
                self.set_raw(key, raw, ttl).await;
                if let Some(sql) = sql {
                    self.registry.register_key(key, sql);
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Result not cacheable, returning uncached"),
        }
        Ok(value)
    }

    /// Leave the exhausted reconnect state and retry if the tier is down.
    pub fn reset_reconnect(&self) -> ReconnectState {
        self.reconnect.reset()
    }

    #[must_use]
    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            remote_configured: self.reconnect.has_connector(),
            remote_available: self.remote.is_available(),
            reconnect: self.reconnect.state(),
            reconnect_attempts: self.reconnect.attempts(),
            local_entries: self.local.len(),
            pending_deletes: self.pending.len(),
            categories: self.registry.stats(),
        }
    }

    /// Stop background reconnects.
    pub fn shutdown(&self) {
        self.reconnect.stop();
    }

    pub(crate) fn degrade(&self, operation: &str, error: &CacheError) {
        if self.remote.mark_unavailable() {
            warn!(operation, error = %error, "Distributed cache unavailable, falling back to local tier");
        }
        self.reconnect.arm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyRemote, ScriptedRemoteConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn tier_with(remote: Arc<FlakyRemote>) -> CacheTier {
        let connector = Arc::new(ScriptedRemoteConnector::serving(remote));
        let tier = CacheTier::new(
            Some(connector as Arc<dyn RemoteCacheConnector>),
            RetryConfig::test(),
            1000,
        );
        assert!(tier.connect_remote().await);
        tier
    }

    #[tokio::test]
    async fn test_set_writes_both_tiers() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = tier_with(remote.clone()).await;
        let key = CacheKey::new("k");

        tier.set(&key, &42_u32, Ttl::Millis(5000)).await.unwrap();

        assert_eq!(remote.raw("k").as_deref(), Some("42"));
        assert_eq!(tier.local().get("k").as_deref(), Some("42"));
        assert_eq!(tier.get::<u32>(&key).await, Some(42));
    }

    #[tokio::test]
    async fn test_non_positive_ttl_stays_local() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = tier_with(remote.clone()).await;

        tier.set(&CacheKey::new("zero"), &1, Ttl::Millis(0)).await.unwrap();
        tier.set(&CacheKey::new("neg"), &1, Ttl::Millis(-5)).await.unwrap();

        assert!(remote.raw("zero").is_none());
        assert!(remote.raw("neg").is_none());
        assert!(tier.local().contains_key("zero"));
        assert_eq!(remote.set_calls(), 0);
    }

    #[tokio::test]
    async fn test_never_ttl_reaches_remote_without_expiry() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = tier_with(remote.clone()).await;

        tier.set(&CacheKey::new("forever"), "v", Ttl::Never).await.unwrap();
        assert_eq!(remote.last_ttl("forever"), Some(None));
    }

    #[tokio::test]
    async fn test_remote_miss_is_authoritative() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = tier_with(remote.clone()).await;
        tier.local().set("k", "\"local\"".into(), None);

        assert_eq!(tier.get::<String>(&CacheKey::new("k")).await, None);
    }

    #[tokio::test]
    async fn test_remote_error_degrades_to_local() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = tier_with(remote.clone()).await;
        let key = CacheKey::new("k");
        tier.set(&key, "cached", Ttl::Never).await.unwrap();

        remote.set_failing(true);

        assert_eq!(tier.get::<String>(&key).await.as_deref(), Some("cached"));
        assert!(!tier.is_remote_available());

        let gets_before = remote.get_calls();
        assert_eq!(tier.get::<String>(&key).await.as_deref(), Some("cached"));
        assert_eq!(remote.get_calls(), gets_before, "unavailable tier is not consulted");
    }

    #[tokio::test]
    async fn test_handle_cache_fetches_once_for_sequential_reads() {
        let tier = CacheTier::local_only();
        let key = CacheKey::new("k");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Vec<u32> = tier
                .handle_cache(
                    &key,
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(vec![1, 2, 3])
                    },
                    Ttl::Millis(60_000),
                )
                .await
                .unwrap();
            assert_eq!(value, vec![1, 2, 3]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_cache_does_not_cache_errors() {
        let tier = CacheTier::local_only();
        let key = CacheKey::new("k");

        let first: Result<u32, DataError> = tier
            .handle_cache(&key, || async { Err(DataError::Query("boom".into())) }, Ttl::Never)
            .await;
        assert!(first.is_err());

        let second: u32 = tier.handle_cache(&key, || async { Ok(7) }, Ttl::Never).await.unwrap();
        assert_eq!(second, 7);
    }

    #[tokio::test]
    async fn test_handle_query_registers_category() {
        let tier = CacheTier::local_only();
        let key = CacheKey::new("k");
        let _: u32 = tier
            .handle_query(&key, "SELECT amt FROM balances", || async { Ok(1) }, Ttl::Never)
            .await
            .unwrap();

        assert_eq!(tier.registry().keys_for(CacheCategory::Balance), vec![key]);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let tier = CacheTier::local_only();
        tier.local().set("k", "not json".into(), None);
        assert_eq!(tier.get::<u32>(&CacheKey::new("k")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_in_local_tier() {
        let tier = CacheTier::local_only();
        let key = CacheKey::new("k");
        tier.set(&key, &1, Ttl::Millis(5000)).await.unwrap();

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_eq!(tier.get::<u32>(&key).await, None);
    }

    #[test]
    fn test_ttl_conversions() {
        assert_eq!(Ttl::secs(2), Ttl::Millis(2000));
        assert_eq!(Ttl::from(Duration::from_millis(1500)), Ttl::Millis(1500));
        assert_eq!(Ttl::Millis(0).remote_duration(), None);
        assert_eq!(Ttl::Never.remote_duration(), Some(None));
        assert_eq!(Ttl::Never.local_duration(), None);
    }
}
