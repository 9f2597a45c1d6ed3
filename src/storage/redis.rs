// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the distributed cache tier.
//!
//! Values are plain strings (`SET` / `PSETEX`), keys optionally namespaced by
//! a prefix. Every command runs under the operation timeout; an elapsed
//! deadline surfaces as [`CacheError::Timeout`] so the tier degrades instead
//! of stalling callers.
//!
//! Pattern deletes walk the keyspace with `SCAN MATCH ... COUNT 500` and
//! delete each page, so they never block the server the way `KEYS` would.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::traits::{CacheError, RemoteCache, RemoteCacheConnector, TierRead};
use crate::config::DataAccessConfig;

const SCAN_COUNT: usize = 500;
const PROBE_TTL_MS: u64 = 10_000;

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "stamps:" → "stamps:<digest>")
    prefix: String,
    op_timeout: Duration,
}

impl RedisCache {
    /// Open a managed connection to `url`.
    pub async fn connect(
        url: &str,
        prefix: Option<&str>,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(connect_timeout))?
            .map_err(map_redis_error)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            op_timeout,
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(CacheError::Timeout(self.op_timeout)),
        }
    }

    /// Startup check: `PING`, then write and read back a short-lived probe key.
    pub async fn verify(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let pong: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        if pong != "PONG" {
            return Err(CacheError::Backend(format!("unexpected PING reply: {pong}")));
        }

        let stamp = chrono::Utc::now().timestamp_millis();
        let probe_key = self.prefixed_key(&format!("__probe__:{stamp}"));
        let probe_value = stamp.to_string();
        let _: () = self
            .bounded(conn.pset_ex(&probe_key, &probe_value, PROBE_TTL_MS))
            .await?;
        let read: Option<String> = self.bounded(conn.get(&probe_key)).await?;
        if read.as_deref() != Some(probe_value.as_str()) {
            return Err(CacheError::Backend("probe key read back mismatch".into()));
        }
        debug!("Redis startup verification passed");
        Ok(())
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn get(&self, key: &str) -> TierRead {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        match self.bounded(conn.get::<_, Option<String>>(&key)).await {
            Ok(Some(value)) => TierRead::Hit(value),
            Ok(None) => TierRead::Miss,
            Err(e) => TierRead::Unavailable(e),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        match ttl {
            Some(ttl) => {
                let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                self.bounded(conn.pset_ex::<_, _, ()>(&key, value, ms)).await
            }
            None => self.bounded(conn.set::<_, _, ()>(&key, value)).await,
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        self.bounded(conn.del::<_, usize>(keys)).await
    }

    async fn scan_delete(&self, pattern: &str) -> Result<usize, CacheError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}{}", escape_glob_literal(&self.prefix), escape_brackets(pattern));
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn),
                )
                .await?;
            if !keys.is_empty() {
                deleted += self.bounded(conn.del::<_, usize>(keys)).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, deleted, "Redis pattern sweep complete");
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}

/// Opens and verifies [`RedisCache`] connections.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
    prefix: Option<String>,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl RedisConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            prefix: None,
            connect_timeout,
            op_timeout,
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// `None` when no cache endpoint is configured.
    #[must_use]
    pub fn from_config(config: &DataAccessConfig) -> Option<Self> {
        let url = config.redis_url()?;
        let connector = Self::new(url, config.connect_timeout(), config.cache_op_timeout());
        Some(match config.cache_key_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => connector.with_prefix(prefix),
            _ => connector,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteCacheConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteCache>, CacheError> {
        let cache = RedisCache::connect(
            &self.url,
            self.prefix.as_deref(),
            self.connect_timeout,
            self.op_timeout,
        )
        .await?;
        cache.verify().await?;
        info!(url = %redact_url(&self.url), "Connected to Redis");
        Ok(Arc::new(cache))
    }
}

fn map_redis_error(err: redis::RedisError) -> CacheError {
    if err.is_timeout() {
        CacheError::Connection(format!("timed out: {err}"))
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        CacheError::Connection(err.to_string())
    } else {
        CacheError::Backend(err.to_string())
    }
}

/// Escape every Redis glob metacharacter.
fn escape_glob_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Keep `*` and `?` as wildcards, escape the rest of Redis glob syntax.
fn escape_brackets(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Strip credentials before logging.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***@{}", &url[..scheme], &url[at + 1..]),
        _ => url.to_string(),
    }
}
