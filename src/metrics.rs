// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the data-access core.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host
//! process chooses the exporter (Prometheus, OTEL, etc.).
//!
//! # Metric Naming Convention
//! - `stamps_data_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: remote, local
//! - `outcome`: success, error, hit, miss, rejected, ...
//! - `reason`: why a connection was discarded

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a finished query attempt chain
pub fn record_query(outcome: &str) {
    counter!(
        "stamps_data_queries_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record query latency, retries and backoff included
pub fn record_query_latency(operation: &str, duration: Duration) {
    histogram!(
        "stamps_data_query_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry of a failed operation
pub fn record_retry(operation: &str) {
    counter!(
        "stamps_data_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_connection_created() {
    counter!("stamps_data_connections_created_total").increment(1);
}

/// Record a session removed from the pool for good
pub fn record_connection_discarded(reason: &str) {
    counter!(
        "stamps_data_connections_discarded_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set pool occupancy gauges
pub fn set_pool_gauges(active: usize, idle: usize, max: usize) {
    gauge!("stamps_data_pool_active").set(active as f64);
    gauge!("stamps_data_pool_idle").set(idle as f64);
    gauge!("stamps_data_pool_max").set(max as f64);
}

pub fn record_pool_exhausted() {
    counter!("stamps_data_pool_exhausted_total").increment(1);
}

/// Record idle connections evicted by a health check
pub fn record_health_evictions(count: usize) {
    counter!("stamps_data_health_check_evictions_total").increment(count as u64);
}

/// Record a cache lookup
pub fn record_cache_lookup(tier: &str, outcome: &str) {
    counter!(
        "stamps_data_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_cache_write(tier: &str) {
    counter!(
        "stamps_data_cache_writes_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// Set distributed tier availability (1 = available)
pub fn set_remote_available(available: bool) {
    gauge!("stamps_data_cache_remote_available").set(if available { 1.0 } else { 0.0 });
}

/// Record a background reconnect attempt
pub fn record_reconnect_attempt(outcome: &str) {
    counter!(
        "stamps_data_cache_reconnect_attempts_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record keys removed by an invalidation sweep
pub fn record_invalidation(kind: &str, keys: usize) {
    counter!(
        "stamps_data_cache_invalidations_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(
        "stamps_data_cache_invalidated_keys_total",
        "kind" => kind.to_string()
    )
    .increment(keys as u64);
}

/// Record circuit breaker state (0 = closed, 1 = half_open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "stamps_data_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(f64::from(state));
}

/// Record a call through the circuit breaker
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "stamps_data_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a lifecycle transition of the service
pub fn set_service_state(state: &str) {
    counter!(
        "stamps_data_service_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_query_latency(self.operation, self.start.elapsed());
    }
}
