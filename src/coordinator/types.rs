// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the data-access service.

use serde::Serialize;

use crate::cache::CacheStatus;
use crate::pool::ConnectionStats;
use crate::resilience::circuit_breaker::CircuitMetrics;

/// Service lifecycle state.
///
/// Use [`super::DataAccess::state()`] to check the current state or
/// [`super::DataAccess::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Built, backends not contacted yet
    Created,
    /// Warming the pool and connecting the distributed cache
    Starting,
    /// Serving queries
    Ready,
    /// Draining: background tasks stopping, idle sessions closing
    ShuttingDown,
    /// All sessions closed; further queries fail with `PoolClosed`
    Stopped,
}

impl ServiceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the service will no longer accept work.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a health endpoint needs in one serializable snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: ServiceState,
    pub caching_enabled: bool,
    pub pool: ConnectionStats,
    pub circuit: CircuitMetrics,
    pub cache: CacheStatus,
}

impl HealthSnapshot {
    /// Ready, circuit not open and at least one session obtainable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == ServiceState::Ready
            && self.circuit.state != crate::resilience::circuit_breaker::CircuitState::Open
            && (self.pool.idle > 0 || self.pool.total < self.pool.max_pool_size)
    }
}
