// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query execution with liveness probing and bounded retry.
//!
//! One attempt:
//! 1. lease a session; a reused session is pinged first and replaced if dead
//! 2. run the statement (under `query_timeout` when set)
//! 3. connection-class failure: close the session and retry with backoff;
//!    anything else: return the session and propagate
//!
//! `PoolExhausted` and `PoolClosed` are never retried.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::types::{QueryOutput, SqlParam};
use crate::error::DataError;
use crate::pool::{ConnectionPool, Lease};
use crate::resilience::retry::{retry_if, RetryConfig};

/// Dead reused sessions replaced per attempt before giving up on the probe.
const MAX_PROBE_REPLACEMENTS: usize = 3;

pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    retry: RetryConfig,
    query_timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(pool: Arc<ConnectionPool>, retry: RetryConfig, query_timeout: Option<Duration>) -> Self {
        Self {
            pool,
            retry,
            query_timeout,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `sql` with `params`, retrying connection-class failures.
    pub async fn execute_query(&self, sql: &str, params: &[SqlParam]) -> Result<QueryOutput, DataError> {
        let _timer = crate::metrics::LatencyTimer::new("execute_query");

        let result = retry_if(
            "execute_query",
            &self.retry,
            |attempt| self.attempt(sql, params, attempt),
            DataError::is_connection_class,
        )
        .await;

        match &result {
            Ok(_) => crate::metrics::record_query("success"),
            Err(e) => {
                crate::metrics::record_query(e.kind());
                if e.is_connection_class() {
                    warn!(error = %e, attempts = self.retry.max_attempts, "Query failed after exhausting retries");
                }
            }
        }
        result
    }

    async fn attempt(&self, sql: &str, params: &[SqlParam], attempt: usize) -> Result<QueryOutput, DataError> {
        let mut lease = self.lease_live().await?;
        debug!(connection = lease.id(), attempt, "Executing query");

        let outcome = match self.query_timeout {
            Some(limit) => match tokio::time::timeout(limit, lease.execute(sql, params)).await {
                Ok(result) => result,
                Err(_) => Err(DataError::Connection(format!("query timed out after {limit:?}"))),
            },
            None => lease.execute(sql, params).await,
        };

        match outcome {
            Ok(output) => {
                self.pool.release_client(lease);
                Ok(output)
            }
            Err(e) if e.is_connection_class() => {
                self.pool.close_client(lease, "connection_error").await;
                Err(e)
            }
            Err(e) => {
                self.pool.release_client(lease);
                Err(e)
            }
        }
    }

    /// Lease a session, probing reused ones and replacing any that fail.
    async fn lease_live(&self) -> Result<Lease, DataError> {
        let mut replaced = 0;
        loop {
            let mut lease = self.pool.get_client().await?;
            if lease.is_fresh() {
                return Ok(lease);
            }
            match lease.ping().await {
                Ok(()) => return Ok(lease),
                Err(e) => {
                    warn!(connection = lease.id(), error = %e, "Leased session failed probe, replacing");
                    self.pool.close_client(lease, "probe_failed").await;
                    replaced += 1;
                    if replaced >= MAX_PROBE_REPLACEMENTS {
                        return Err(e);
                    }
                }
            }
        }
    }
}
