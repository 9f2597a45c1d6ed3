// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic liveness checks for idle sessions.
//!
//! A check takes the whole idle set out of circulation (into the `checking`
//! bucket), pings each session and returns only the ones that answered. A
//! session that fails its ping is closed and never leased again.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{close_session, Bucket, PoolShared, SlotGuard};

/// Outcome of one pass over the idle set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub evicted: usize,
}

pub(super) async fn check_idle(shared: &Arc<PoolShared>) -> HealthReport {
    let batch = {
        let mut st = shared.state.lock();
        if st.closed {
            return HealthReport::default();
        }
        let batch = std::mem::take(&mut st.idle);
        st.checking += batch.len();
        batch
    };

    let mut report = HealthReport {
        checked: batch.len(),
        ..HealthReport::default()
    };

    for mut conn in batch {
        let guard = SlotGuard::new(shared.clone(), Bucket::Checking);
        let ping = tokio::time::timeout(shared.config.ping_timeout, conn.session.ping()).await;

        match ping {
            Ok(Ok(())) => {
                conn.last_checked_at = Instant::now();
                let mut st = shared.state.lock();
                st.checking = st.checking.saturating_sub(1);
                guard.disarm();
                if st.closed {
                    st.closing += 1;
                    drop(st);
                    shared.close_in_background(conn, "pool_closed");
                } else {
                    st.idle.push(conn);
                    shared.publish(&st);
                }
                report.healthy += 1;
            }
            Ok(Err(e)) => {
                warn!(connection = conn.id, error = %e, "Idle session failed health check, evicting");
                crate::metrics::record_connection_discarded("health_check");
                close_session(conn, "health_check").await;
                drop(guard);
                report.evicted += 1;
            }
            Err(_) => {
                warn!(connection = conn.id, timeout = ?shared.config.ping_timeout, "Health check ping timed out, evicting");
                crate::metrics::record_connection_discarded("health_check_timeout");
                close_session(conn, "health_check_timeout").await;
                drop(guard);
                report.evicted += 1;
            }
        }
    }

    if report.evicted > 0 {
        crate::metrics::record_health_evictions(report.evicted);
        info!(checked = report.checked, evicted = report.evicted, "Pool health check evicted sessions");
    } else {
        debug!(checked = report.checked, "Pool health check passed");
    }
    report
}

pub(super) async fn run_health_loop(shared: Arc<PoolShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = shared.config.health_check_interval.max(Duration::from_millis(10));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(interval = ?period, "Pool health checks started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_idle(&shared).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Pool health checks stopped");
}
