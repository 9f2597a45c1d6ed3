// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process key-value store with per-entry expiry.
//!
//! Serves as the always-on local cache tier. It also implements
//! [`RemoteCache`] so development setups and tests can stand in a shared
//! in-memory store for the distributed tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tokio::time::Instant;

use super::traits::{CacheError, RemoteCache, RemoteCacheConnector, TierRead};
use crate::cache::invalidation::glob_to_regex;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

pub struct LocalCache {
    data: DashMap<String, LocalEntry>,
    max_entries: usize,
}

impl LocalCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_limit(usize::MAX)
    }

    /// Cap the number of entries. Expired entries are purged first when the
    /// cap is hit, then arbitrary entries are dropped.
    #[must_use]
    pub fn with_capacity_limit(max_entries: usize) -> Self {
        Self {
            data: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Read a live entry. Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.data.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.data.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store a value. `None` never expires; a zero TTL is stored already expired.
    pub fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        if !self.data.contains_key(key) && self.data.len() >= self.max_entries {
            self.make_room();
        }
        self.data.insert(key.to_string(), LocalEntry { value, expires_at });
    }

    pub fn remove(&self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    /// Raw presence, expired entries included.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove every key matching `pattern`, returning how many were removed.
    pub fn remove_matching(&self, pattern: &Regex) -> usize {
        let before = self.data.len();
        self.data.retain(|key, _| !pattern.is_match(key));
        before.saturating_sub(self.data.len())
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.data.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn make_room(&self) {
        self.purge_expired();
        let excess = (self.data.len() + 1).saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let victims: Vec<String> = self.data.iter().take(excess).map(|e| e.key().clone()).collect();
        for key in victims {
            self.data.remove(&key);
        }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCache for LocalCache {
    async fn get(&self, key: &str) -> TierRead {
        match LocalCache::get(self, key) {
            Some(value) => TierRead::Hit(value),
            None => TierRead::Miss,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        LocalCache::set(self, key, value.to_string(), ttl);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        Ok(keys.iter().filter(|k| self.remove(k)).count())
    }

    async fn scan_delete(&self, pattern: &str) -> Result<usize, CacheError> {
        let regex = glob_to_regex(pattern).map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(self.remove_matching(&regex))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Hands out one shared in-memory store as the distributed tier.
pub struct SharedMemoryConnector {
    store: Arc<LocalCache>,
}

impl SharedMemoryConnector {
    #[must_use]
    pub fn new(store: Arc<LocalCache>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RemoteCacheConnector for SharedMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteCache>, CacheError> {
        Ok(self.store.clone())
    }
}
