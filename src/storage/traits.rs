// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend seams.
//!
//! The pool, executor and cache tier only talk to these traits. MySQL and
//! Redis implementations live in [`super::sql`] and [`super::redis`]; the
//! in-process store in [`super::memory`] doubles as the local cache tier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::DataError;
use crate::query::{QueryOutput, SqlParam};

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// A single live database session.
///
/// Sessions are owned by exactly one holder at a time: the pool while idle,
/// a [`crate::pool::Lease`] while in use.
#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryOutput, DataError>;

    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), DataError>;

    /// Close the underlying connection. Errors are swallowed by callers.
    async fn close(self: Box<Self>) -> Result<(), DataError>;
}

/// Opens new database sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Session>, DataError>;
}

/// Outcome of a distributed-tier read.
///
/// `Miss` and `Unavailable` are kept apart: a miss is authoritative, an
/// unavailable tier means the caller should degrade to the local tier.
#[derive(Debug, Clone)]
pub enum TierRead {
    Hit(String),
    Miss,
    Unavailable(CacheError),
}

/// Shared key-value store backing the distributed cache tier.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> TierRead;

    /// Store `value`. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Delete every key matching a glob pattern (`*`, `?`).
    async fn scan_delete(&self, pattern: &str) -> Result<usize, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Establishes (and re-establishes) the distributed cache client.
#[async_trait]
pub trait RemoteCacheConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteCache>, CacheError>;
}
