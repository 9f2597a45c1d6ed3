// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Targeted invalidation across both cache tiers.

use std::collections::HashSet;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::registry::CacheCategory;
use super::CacheTier;
use crate::error::DataError;
use crate::storage::traits::{CacheError, RemoteCache};

/// Keys per DEL round trip during a category sweep.
const DELETE_CHUNK: usize = 500;

/// What a pattern sweep removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub local: usize,
    pub remote: usize,
    /// False when the distributed tier was down or failed mid-sweep
    pub remote_complete: bool,
}

/// Deletes the distributed tier missed while it was down.
///
/// They are replayed before a reconnected client is installed, and again
/// ahead of the next remote read if any slipped in after that.
#[derive(Default)]
pub(crate) struct PendingDeletes {
    keys: Mutex<HashSet<String>>,
    patterns: Mutex<Vec<String>>,
}

impl PendingDeletes {
    pub(crate) fn add_keys(&self, keys: impl IntoIterator<Item = String>) {
        self.keys.lock().extend(keys);
    }

    pub(crate) fn add_pattern(&self, pattern: &str) {
        let mut patterns = self.patterns.lock();
        if !patterns.iter().any(|p| p == pattern) {
            patterns.push(pattern.to_string());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.lock().len() + self.patterns.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver every queued delete to `remote`. Work is dequeued only once
    /// delivered, so a failure leaves the rest queued for the next replay.
    pub(crate) async fn replay(&self, remote: &dyn RemoteCache) -> Result<usize, CacheError> {
        let keys: Vec<String> = self.keys.lock().iter().cloned().collect();
        for chunk in keys.chunks(DELETE_CHUNK) {
            remote.delete(chunk).await?;
            let mut queued = self.keys.lock();
            for key in chunk {
                queued.remove(key);
            }
        }

        let patterns = self.patterns.lock().clone();
        for pattern in &patterns {
            remote.scan_delete(pattern).await?;
            self.patterns.lock().retain(|p| p != pattern);
        }

        let delivered = keys.len() + patterns.len();
        if delivered > 0 {
            info!(keys = keys.len(), patterns = patterns.len(), "Replayed pending cache deletes");
        }
        Ok(delivered)
    }
}

/// Translate a glob (`*` any run, `?` one character) into an anchored regex.
/// Every other character matches itself.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 12);
    out.push_str("(?s)^");
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    Regex::new(&out)
}

impl CacheTier {
    /// Delete every registered key of `category` from both tiers and clear
    /// the category. Returns how many keys were registered.
    pub async fn invalidate_category(&self, category: CacheCategory) -> usize {
        let keys = self.registry.take_category(category);
        if keys.is_empty() {
            debug!(%category, "No cached keys registered for category");
            return 0;
        }

        for key in &keys {
            self.local.remove(key.as_str());
        }

        let raw: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let mut delivered = 0;
        if let Some(remote) = self.remote.current() {
            for chunk in raw.chunks(DELETE_CHUNK) {
                if let Err(e) = remote.delete(chunk).await {
                    self.degrade("invalidate_category", &e);
                    break;
                }
                delivered += chunk.len();
            }
        }
        if delivered < raw.len() && self.reconnect.has_connector() {
            warn!(%category, pending = raw.len() - delivered, "Distributed cache down, deferring deletes");
            self.pending.add_keys(raw.into_iter().skip(delivered));
        }

        crate::metrics::record_invalidation("category", keys.len());
        info!(%category, keys = keys.len(), "Cache category invalidated");
        keys.len()
    }

    /// Delete every key matching the glob `pattern` from the local tier and,
    /// best-effort, from the distributed tier.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<InvalidationReport, DataError> {
        let regex = glob_to_regex(pattern)?;

        let local = self.local.remove_matching(&regex);
        let (remote, remote_complete) = match self.remote.current() {
            Some(client) => match client.scan_delete(pattern).await {
                Ok(n) => (n, true),
                Err(e) => {
                    self.degrade("invalidate_pattern", &e);
                    (0, false)
                }
            },
            None => (0, !self.reconnect.has_connector()),
        };
        if !remote_complete {
            warn!(pattern, "Distributed cache down, deferring pattern delete");
            self.pending.add_pattern(pattern);
        }
        self.registry.forget_matching(&regex);

        crate::metrics::record_invalidation("pattern", local + remote);
        info!(pattern, local, remote, remote_complete, "Cache invalidated by pattern");
        Ok(InvalidationReport {
            local,
            remote,
            remote_complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, Ttl};
    use crate::resilience::retry::RetryConfig;
    use crate::storage::traits::RemoteCacheConnector;
    use crate::storage::traits::RemoteCache;
    use crate::testing::{FlakyRemote, ScriptedRemoteConnector};
    use std::sync::Arc;
    use std::time::Duration;

    async fn connected_tier(remote: Arc<FlakyRemote>) -> CacheTier {
        let connector = Arc::new(ScriptedRemoteConnector::serving(remote));
        let tier = CacheTier::new(
            Some(connector as Arc<dyn RemoteCacheConnector>),
            RetryConfig::test(),
            1000,
        );
        tier.connect_remote().await;
        tier
    }

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("stamp:*").unwrap();
        assert!(re.is_match("stamp:"));
        assert!(re.is_match("stamp:123"));
        assert!(!re.is_match("xstamp:123"));

        let re = glob_to_regex("blk-?").unwrap();
        assert!(re.is_match("blk-1"));
        assert!(!re.is_match("blk-12"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("a.b(c)+").unwrap();
        assert!(re.is_match("a.b(c)+"));
        assert!(!re.is_match("axb(c)+"));
    }

    #[tokio::test]
    async fn test_category_invalidation_hits_both_tiers_only_for_that_category() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = connected_tier(remote.clone()).await;

        let balance = CacheKey::new("bal");
        let stamp = CacheKey::new("stp");
        let _: u32 = tier
            .handle_query(&balance, "SELECT * FROM balances", || async { Ok(1) }, Ttl::Never)
            .await
            .unwrap();
        let _: u32 = tier
            .handle_query(&stamp, "SELECT * FROM stamps", || async { Ok(2) }, Ttl::Never)
            .await
            .unwrap();

        assert_eq!(tier.invalidate_category(CacheCategory::Balance).await, 1);

        assert!(remote.raw("bal").is_none());
        assert!(tier.local().get("bal").is_none());
        assert!(tier.get::<u32>(&balance).await.is_none());
        assert_eq!(tier.get::<u32>(&stamp).await, Some(2));
        assert!(tier.registry().keys_for(CacheCategory::Balance).is_empty());
    }

    #[tokio::test]
    async fn test_empty_category_is_noop() {
        let tier = CacheTier::local_only();
        assert_eq!(tier.invalidate_category(CacheCategory::Dispenser).await, 0);
    }

    #[tokio::test]
    async fn test_pattern_sweep_reports_both_tiers() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = connected_tier(remote.clone()).await;

        for key in ["src20:a", "src20:b", "block:1"] {
            tier.set(&CacheKey::new(key), &1, Ttl::Never).await.unwrap();
        }

        let report = tier.invalidate_pattern("src20:*").await.unwrap();
        assert_eq!(
            report,
            InvalidationReport {
                local: 2,
                remote: 2,
                remote_complete: true
            }
        );
        assert!(remote.raw("block:1").is_some());
    }

    #[tokio::test]
    async fn test_pattern_sweep_with_remote_down_is_partial() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = connected_tier(remote.clone()).await;
        tier.set(&CacheKey::new("x:1"), &1, Ttl::Never).await.unwrap();

        remote.set_failing(true);
        let report = tier.invalidate_pattern("x:*").await.unwrap();

        assert_eq!(report.local, 1);
        assert!(!report.remote_complete);
        assert!(!tier.is_remote_available());
        assert_eq!(tier.status().pending_deletes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_deletes_missed_during_outage_replay_on_reconnect() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = connected_tier(remote.clone()).await;
        let balance = CacheKey::new("bal");
        let _: u32 = tier
            .handle_query(&balance, "SELECT * FROM balances", || async { Ok(1) }, Ttl::Never)
            .await
            .unwrap();

        remote.set_failing(true);
        assert_eq!(tier.invalidate_category(CacheCategory::Balance).await, 1);
        assert_eq!(tier.status().pending_deletes, 1);
        assert!(remote.raw("bal").is_some());

        remote.set_failing(false);
        tier.reset_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(tier.is_remote_available());
        assert!(remote.raw("bal").is_none(), "stale copy deleted before the client was trusted");
        assert_eq!(tier.status().pending_deletes, 0);
        assert!(tier.get::<u32>(&balance).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_deletes_missed_during_outage_replay_on_reconnect() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = connected_tier(remote.clone()).await;
        tier.set(&CacheKey::new("x:1"), &1, Ttl::Never).await.unwrap();
        tier.set(&CacheKey::new("y:1"), &1, Ttl::Never).await.unwrap();

        remote.set_failing(true);
        tier.invalidate_pattern("x:*").await.unwrap();
        tier.invalidate_pattern("x:*").await.unwrap();
        assert_eq!(tier.status().pending_deletes, 1, "same pattern queued once");

        remote.set_failing(false);
        tier.reset_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(tier.is_remote_available());
        assert!(remote.raw("x:1").is_none());
        assert!(remote.raw("y:1").is_some());
        assert_eq!(tier.status().pending_deletes, 0);
    }

    #[tokio::test]
    async fn test_pending_deletes_flush_ahead_of_remote_read() {
        let remote = Arc::new(FlakyRemote::new());
        let tier = connected_tier(remote.clone()).await;
        RemoteCache::set(remote.as_ref(), "bal", "1", None).await.unwrap();
        tier.pending.add_keys(["bal".to_string()]);

        assert!(tier.get::<u32>(&CacheKey::new("bal")).await.is_none());
        assert!(remote.raw("bal").is_none());
        assert_eq!(tier.status().pending_deletes, 0);
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_work_queued() {
        let remote = Arc::new(FlakyRemote::new());
        let pending = PendingDeletes::default();
        pending.add_keys(["a".to_string(), "b".to_string()]);
        pending.add_pattern("c:*");

        remote.set_failing(true);
        assert!(pending.replay(remote.as_ref()).await.is_err());
        assert_eq!(pending.len(), 3);

        remote.set_failing(false);
        assert_eq!(pending.replay(remote.as_ref()).await.unwrap(), 3);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_local_only_sweep_is_complete() {
        let tier = CacheTier::local_only();
        tier.set(&CacheKey::new("x:1"), &1, Ttl::Never).await.unwrap();
        let report = tier.invalidate_pattern("x:*").await.unwrap();
        assert_eq!(report.local, 1);
        assert!(report.remote_complete);
        assert_eq!(tier.status().pending_deletes, 0);
    }
}
