// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the data-access core.
//!
//! Errors are split by how the core reacts to them:
//!
//! | Variant            | Reaction                                         |
//! |--------------------|--------------------------------------------------|
//! | `Connection`       | dispose session, retry with backoff              |
//! | `PoolExhausted`    | fail fast, never queued                          |
//! | `CacheUnavailable` | fall back to the local tier, reconnect later     |
//! | `Query`            | release session, propagate immediately           |
//! | `CircuitOpen`      | fail fast while the breaker is open              |
//!
//! Only retry exhaustion and non-transient query errors normally reach callers.
//! HTTP layers should answer with [`DataError::public_message`] rather than
//! the `Display` output, which can contain backend details.

use std::time::Duration;
use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::CacheError;

#[derive(Error, Debug)]
pub enum DataError {
    /// Transient backend failure (timeouts, resets, lost connections)
    #[error("connection error: {0}")]
    Connection(String),

    #[error("no available connections in the pool (active={active}, idle={idle}, max={max})")]
    PoolExhausted {
        active: usize,
        idle: usize,
        max: usize,
    },

    #[error("connection pool is shut down")]
    PoolClosed,

    #[error("distributed cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Backend rejected the statement (syntax, constraint, ...). Never retried.
    #[error("query failed: {0}")]
    Query(String),

    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen {
        name: String,
        retry_after: Duration,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cache key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DataError {
    /// Whether the failure belongs to the session rather than the statement.
    ///
    /// Connection-class failures dispose the session and are retried.
    #[must_use]
    pub fn is_connection_class(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether the failure says something about backend health.
    ///
    /// Only these outcomes count against the circuit breaker. A rejected
    /// statement or an exhausted pool is the caller's problem, not the server's.
    #[must_use]
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::Query(_) => "query",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Serialization(_) => "serialization",
            Self::InvalidPattern(_) => "invalid_pattern",
            Self::Config(_) => "config",
        }
    }

    /// Message safe to hand to API clients. Never contains backend details.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::PoolExhausted { .. } | Self::CircuitOpen { .. } => "Service temporarily unavailable",
            _ => "Internal server error",
        }
    }
}

impl From<CacheError> for DataError {
    fn from(err: CacheError) -> Self {
        DataError::CacheUnavailable(err.to_string())
    }
}

impl From<CircuitError<DataError>> for DataError {
    fn from(err: CircuitError<DataError>) -> Self {
        match err {
            CircuitError::Rejected { name, retry_after } => DataError::CircuitOpen { name, retry_after },
            CircuitError::Inner(e) => e,
        }
    }
}

/// How a backend error message should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connection,
    Query,
}

/// Markers that identify a dead or dying session.
const CONNECTION_MARKERS: &[&str] = &[
    "disconnected by the server",
    "wait_timeout",
    "interactive_timeout",
    "connection lost",
    "lost connection",
    "connection reset",
    "connection refused",
    "connection closed",
    "connection aborted",
    "server has gone away",
    "broken pipe",
    "protocol_connection_lost",
    "econnreset",
    "etimedout",
    "econnrefused",
    "timed out",
];

/// Markers for statement errors that must never be retried, even when the
/// message also mentions the connection.
const STATEMENT_MARKERS: &[&str] = &[
    "syntax error",
    "error in your sql syntax",
    "constraint",
    "duplicate",
    "foreign key",
];

/// Classify a raw backend error message.
#[must_use]
pub fn classify_backend_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if STATEMENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Query;
    }
    if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Connection
    } else {
        ErrorClass::Query
    }
}

/// Build a [`DataError`] from a backend message using [`classify_backend_message`].
#[must_use]
pub fn backend_error(message: impl Into<String>) -> DataError {
    let message = message.into();
    match classify_backend_message(&message) {
        ErrorClass::Connection => DataError::Connection(message),
        ErrorClass::Query => DataError::Query(message),
    }
}
