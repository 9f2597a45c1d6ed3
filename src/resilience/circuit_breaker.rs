// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding the database backend.
//!
//! States:
//! - Closed: calls pass through; failures inside the sliding window are counted
//! - Open: calls are rejected without running until the cooldown elapses
//! - HalfOpen: a bounded number of probe calls run; one success closes the
//!   circuit, one failure reopens it and restarts the cooldown
//!
//! All bookkeeping happens under one short synchronous lock. The guarded
//! future itself runs outside the lock.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker refused the call without running it
    #[error("circuit breaker '{name}' open, retry in {retry_after:?}")]
    Rejected { name: String, retry_after: Duration },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failures inside `failure_window` that trip the circuit
    pub failure_threshold: u32,
    /// Probe successes in half-open needed to close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub recovery_timeout: Duration,
    /// Concurrent probes admitted while half-open
    pub half_open_max_calls: u32,
    /// Sliding window for counting failures. `None` counts until the next success.
    pub failure_window: Option<Duration>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            failure_window: Some(Duration::from_secs(60)),
        }
    }
}

impl CircuitConfig {
    /// Trips faster and stays open longer
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            failure_window: Some(Duration::from_secs(60)),
        }
    }

    /// Tolerates more failures and recovers quickly (development)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
            half_open_max_calls: 1,
            failure_window: Some(Duration::from_secs(30)),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
            failure_window: None,
        }
    }
}

/// Point-in-time view of a breaker, safe to serialize for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition_at: DateTime<Utc>,
    /// Milliseconds until an open circuit admits a probe
    pub open_remaining_ms: Option<u64>,
    pub calls_total: u64,
    pub successes_total: u64,
    pub failures_total: u64,
    pub rejections_total: u64,
}

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u32,
    half_open_in_flight: u32,
    open_until: Option<Instant>,
    last_transition_at: DateTime<Utc>,
    /// Bumped on every transition and reset; permits from an older epoch
    /// no longer speak for the current state.
    epoch: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            half_open_in_flight: 0,
            open_until: None,
            last_transition_at: Utc::now(),
            epoch: 0,
        }
    }

    fn prune(&mut self, window: Option<Duration>, now: Instant) {
        if let Some(window) = window {
            while let Some(&oldest) = self.failures.front() {
                if now.saturating_duration_since(oldest) > window {
                    self.failures.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

enum Outcome {
    Success,
    Failure,
    /// Error that says nothing about backend health
    Neutral,
}

/// Admission ticket for one call. Dropping an unfinished probe frees its
/// half-open slot so a cancelled caller cannot wedge the breaker.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    epoch: u64,
    finished: bool,
}

impl Permit<'_> {
    fn finish(mut self, outcome: Outcome) {
        self.finished = true;
        self.breaker.record(self.probe, self.epoch, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.finished && self.probe {
            let mut st = self.breaker.state.lock();
            if st.epoch == self.epoch {
                st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: Mutex<BreakerState>,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed as u8);
        Self {
            name,
            config,
            state: Mutex::new(BreakerState::new()),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `f` through the breaker. Every `Err` counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(f, |_| true).await
    }

    /// Run `f` through the breaker. Only errors for which `is_failure`
    /// returns true count against the circuit; others pass through untouched.
    pub async fn execute_classified<F, Fut, T, E, P>(&self, f: F, is_failure: P) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let permit = match self.admit() {
            Ok(permit) => permit,
            Err(retry_after) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, ?retry_after, "Circuit breaker rejected call");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                return Err(CircuitError::Rejected {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        match f().await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                permit.finish(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_circuit_call(&self.name, "failure");
                    permit.finish(Outcome::Failure);
                } else {
                    crate::metrics::record_circuit_call(&self.name, "ignored");
                    permit.finish(Outcome::Neutral);
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Force the circuit closed and zero its counters.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        let previous = st.state;
        let epoch = st.epoch + 1;
        *st = BreakerState::new();
        st.epoch = epoch;
        drop(st);
        crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        info!(circuit = %self.name, from = %previous, "Circuit breaker manually reset");
    }

    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        let now = Instant::now();
        let mut st = self.state.lock();
        if st.state == CircuitState::Closed {
            st.prune(self.config.failure_window, now);
        }
        let open_remaining_ms = match (st.state, st.open_until) {
            (CircuitState::Open, Some(until)) => Some(until.saturating_duration_since(now).as_millis() as u64),
            _ => None,
        };
        CircuitMetrics {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.failures.len() as u32,
            success_count: st.success_count,
            last_transition_at: st.last_transition_at,
            open_remaining_ms,
            calls_total: self.calls_total.load(Ordering::Relaxed),
            successes_total: self.successes.load(Ordering::Relaxed),
            failures_total: self.failures.load(Ordering::Relaxed),
            rejections_total: self.rejections.load(Ordering::Relaxed),
        }
    }

    fn admit(&self) -> Result<Permit<'_>, Duration> {
        let now = Instant::now();
        let mut st = self.state.lock();

        if st.state == CircuitState::Open {
            match st.open_until {
                Some(until) if now < until => return Err(until - now),
                _ => self.transition(&mut st, CircuitState::HalfOpen),
            }
        }

        if st.state == CircuitState::HalfOpen {
            if st.half_open_in_flight >= self.config.half_open_max_calls {
                return Err(Duration::ZERO);
            }
            st.half_open_in_flight += 1;
            return Ok(Permit {
                breaker: self,
                probe: true,
                epoch: st.epoch,
                finished: false,
            });
        }

        Ok(Permit {
            breaker: self,
            probe: false,
            epoch: st.epoch,
            finished: false,
        })
    }

    fn record(&self, probe: bool, epoch: u64, outcome: Outcome) {
        let now = Instant::now();
        let mut st = self.state.lock();

        // Admitted under a state that has since changed: only calls admitted
        // by the current state decide its transitions.
        if st.epoch != epoch {
            debug!(circuit = %self.name, state = %st.state, "Ignoring outcome of a call admitted before the last transition");
            return;
        }
        if probe {
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }

        match (st.state, outcome) {
            (_, Outcome::Neutral) => {}
            (CircuitState::Closed, Outcome::Success) => {
                st.failures.clear();
                st.success_count = st.success_count.saturating_add(1);
            }
            (CircuitState::Closed, Outcome::Failure) => {
                st.failures.push_back(now);
                st.prune(self.config.failure_window, now);
                if st.failures.len() as u32 >= self.config.failure_threshold {
                    st.open_until = Some(now + self.config.recovery_timeout);
                    self.transition(&mut st, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                st.success_count = st.success_count.saturating_add(1);
                if st.success_count >= self.config.success_threshold {
                    st.failures.clear();
                    st.success_count = 0;
                    st.open_until = None;
                    self.transition(&mut st, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                st.failures.push_back(now);
                st.open_until = Some(now + self.config.recovery_timeout);
                self.transition(&mut st, CircuitState::Open);
            }
            // Open admits nothing, so no current-epoch outcome lands here.
            (CircuitState::Open, _) => {}
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        st.epoch += 1;
        st.last_transition_at = Utc::now();
        if to == CircuitState::HalfOpen {
            st.half_open_in_flight = 0;
            st.success_count = 0;
        }
        crate::metrics::set_circuit_state(&self.name, to as u8);
        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                %from,
                failures = st.failures.len(),
                cooldown = ?self.config.recovery_timeout,
                "Circuit breaker opened"
            ),
            _ => info!(circuit = %self.name, %from, %to, "Circuit breaker state change"),
        }
    }
}
