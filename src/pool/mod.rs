// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded pool of database sessions.
//!
//! # Accounting
//!
//! Every physical session is counted in exactly one bucket:
//!
//! ```text
//!   creating ──► leased ◄──► idle ──► checking ──► idle
//!                  │                      │
//!                  └──────► closing ◄─────┘
//! ```
//!
//! The sum of all buckets never exceeds `max_size`. Buckets only change under
//! the pool mutex, and every bucket entered outside the lock is guarded so a
//! cancelled future still gives its slot back.
//!
//! # Behaviour
//!
//! - `get_client` pops the most recently returned idle session (LIFO), else
//!   opens a new one if a slot is free, else fails with `PoolExhausted`.
//!   Callers are never queued.
//! - A [`Lease`] dropped without `release_client`/`close_client` is treated
//!   as broken: its session is closed and the slot freed.
//! - After `shutdown`, returned leases are closed instead of pooled.

mod health;

pub use health::HealthReport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::DataError;
use crate::query::{QueryOutput, SqlParam};
use crate::storage::traits::{Connector, Session};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Idle sessions opened by `warm_up` and `reset_pool`
    pub min_connections: usize,
    pub health_check_interval: Duration,
    /// Deadline for a single liveness ping
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_connections: 2,
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Pool occupancy as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Sessions not sitting idle (leased, opening, being checked or closed)
    pub active: usize,
    pub idle: usize,
    pub max_pool_size: usize,
    pub total: usize,
}

/// A physical session owned by the pool.
pub struct PooledConnection {
    id: u64,
    session: Box<dyn Session>,
    created_at: Instant,
    last_checked_at: Instant,
}

impl PooledConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_checked_at(&self) -> Instant {
        self.last_checked_at
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<PooledConnection>,
    leased: usize,
    creating: usize,
    checking: usize,
    closing: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.leased + self.creating + self.checking + self.closing
    }

    fn stats(&self, max: usize) -> ConnectionStats {
        let total = self.total();
        ConnectionStats {
            active: total - self.idle.len(),
            idle: self.idle.len(),
            max_pool_size: max,
            total,
        }
    }
}

#[derive(Clone, Copy)]
enum Bucket {
    Creating,
    Checking,
    Closing,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    next_id: AtomicU64,
}

impl PoolShared {
    fn publish(&self, st: &PoolState) {
        let stats = st.stats(self.config.max_size);
        crate::metrics::set_pool_gauges(stats.active, stats.idle, stats.max_pool_size);
    }

    fn leave(&self, bucket: Bucket) {
        let mut st = self.state.lock();
        match bucket {
            Bucket::Creating => st.creating = st.creating.saturating_sub(1),
            Bucket::Checking => st.checking = st.checking.saturating_sub(1),
            Bucket::Closing => st.closing = st.closing.saturating_sub(1),
        }
        self.publish(&st);
    }

    /// Move a session out of the leased bucket into `closing` and close it,
    /// in the background when called from a synchronous context.
    fn discard_leased(self: &Arc<Self>, conn: PooledConnection, reason: &'static str) {
        {
            let mut st = self.state.lock();
            st.leased = st.leased.saturating_sub(1);
            st.closing += 1;
        }
        self.close_in_background(conn, reason);
    }

    /// Close a session already counted in `closing`.
    fn close_in_background(self: &Arc<Self>, conn: PooledConnection, reason: &'static str) {
        let guard = SlotGuard::new(self.clone(), Bucket::Closing);
        crate::metrics::record_connection_discarded(reason);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _guard = guard;
                    close_session(conn, reason).await;
                });
            }
            Err(_) => {
                drop(conn);
                drop(guard);
            }
        }
    }
}

/// Holds one slot in a transient bucket and gives it back on drop.
struct SlotGuard {
    shared: Arc<PoolShared>,
    bucket: Bucket,
    armed: bool,
}

impl SlotGuard {
    fn new(shared: Arc<PoolShared>, bucket: Bucket) -> Self {
        Self {
            shared,
            bucket,
            armed: true,
        }
    }

    /// The caller moved the slot to another bucket under the lock.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.leave(self.bucket);
        }
    }
}

async fn close_session(conn: PooledConnection, reason: &str) {
    let id = conn.id;
    if let Err(e) = conn.session.close().await {
        debug!(connection = id, reason, error = %e, "Error while closing session");
    } else {
        debug!(connection = id, reason, "Session closed");
    }
}

/// Exclusive use of one pooled session.
///
/// Return it with [`ConnectionPool::release_client`] when healthy or
/// [`ConnectionPool::close_client`] when broken. Dropping it closes it.
pub struct Lease {
    conn: Option<PooledConnection>,
    shared: Arc<PoolShared>,
    fresh: bool,
}

impl Lease {
    /// Pool-assigned session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id)
    }

    /// True when the session was opened for this lease rather than reused.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryOutput, DataError> {
        self.session()?.execute(sql, params).await
    }

    pub async fn ping(&mut self) -> Result<(), DataError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DataError::Connection("lease already returned".into()))?;
        conn.session.ping().await?;
        conn.last_checked_at = Instant::now();
        Ok(())
    }

    fn session(&mut self) -> Result<&mut Box<dyn Session>, DataError> {
        self.conn
            .as_mut()
            .map(|c| &mut c.session)
            .ok_or_else(|| DataError::Connection("lease already returned".into()))
    }

    fn take(mut self) -> Option<PooledConnection> {
        self.conn.take()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(connection = conn.id, "Lease dropped without release, discarding session");
            self.shared.discard_leased(conn, "abandoned");
        }
    }
}

pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                connector,
                config,
                next_id: AtomicU64::new(1),
            }),
            shutdown_tx,
            health_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease a session: newest idle first, else a new one, else fail fast.
    pub async fn get_client(&self) -> Result<Lease, DataError> {
        let shared = &self.shared;
        {
            let mut st = shared.state.lock();
            if st.closed {
                return Err(DataError::PoolClosed);
            }
            if let Some(conn) = st.idle.pop() {
                st.leased += 1;
                shared.publish(&st);
                debug!(connection = conn.id, "Leased idle session");
                return Ok(Lease {
                    conn: Some(conn),
                    shared: shared.clone(),
                    fresh: false,
                });
            }
            if st.total() >= shared.config.max_size {
                crate::metrics::record_pool_exhausted();
                warn!(
                    active = st.total() - st.idle.len(),
                    max = shared.config.max_size,
                    "Connection pool exhausted"
                );
                return Err(DataError::PoolExhausted {
                    active: st.total() - st.idle.len(),
                    idle: st.idle.len(),
                    max: shared.config.max_size,
                });
            }
            st.creating += 1;
            shared.publish(&st);
        }

        let reservation = SlotGuard::new(shared.clone(), Bucket::Creating);
        let conn = self.open().await?;

        let mut st = shared.state.lock();
        if st.closed {
            st.closing += 1;
            drop(st);
            drop(reservation);
            shared.close_in_background(conn, "pool_closed");
            return Err(DataError::PoolClosed);
        }
        st.leased += 1;
        st.creating = st.creating.saturating_sub(1);
        reservation.disarm();
        shared.publish(&st);
        drop(st);

        debug!(connection = conn.id, "Leased new session");
        Ok(Lease {
            conn: Some(conn),
            shared: shared.clone(),
            fresh: true,
        })
    }

    /// Return a healthy session to the idle set.
    pub fn release_client(&self, lease: Lease) {
        let Some(conn) = lease.take() else {
            return;
        };
        let mut st = self.shared.state.lock();
        st.leased = st.leased.saturating_sub(1);
        if st.closed {
            st.closing += 1;
            drop(st);
            self.shared.close_in_background(conn, "pool_closed");
            return;
        }
        st.idle.push(conn);
        self.shared.publish(&st);
    }

    /// Close a session and remove it from the pool for good.
    pub async fn close_client(&self, lease: Lease, reason: &'static str) {
        let Some(conn) = lease.take() else {
            return;
        };
        {
            let mut st = self.shared.state.lock();
            st.leased = st.leased.saturating_sub(1);
            st.closing += 1;
        }
        let _guard = SlotGuard::new(self.shared.clone(), Bucket::Closing);
        crate::metrics::record_connection_discarded(reason);
        close_session(conn, reason).await;
    }

    /// Open up to `count` idle sessions. Stops at the first failure.
    pub async fn warm_up(&self, count: usize) -> usize {
        let mut opened = 0;
        for _ in 0..count {
            {
                let mut st = self.shared.state.lock();
                if st.closed || st.total() >= self.shared.config.max_size {
                    break;
                }
                st.creating += 1;
            }
            let reservation = SlotGuard::new(self.shared.clone(), Bucket::Creating);
            match self.open().await {
                Ok(conn) => {
                    let mut st = self.shared.state.lock();
                    if st.closed {
                        st.closing += 1;
                        drop(st);
                        drop(reservation);
                        self.shared.close_in_background(conn, "pool_closed");
                        break;
                    }
                    st.creating = st.creating.saturating_sub(1);
                    reservation.disarm();
                    st.idle.push(conn);
                    self.shared.publish(&st);
                    opened += 1;
                }
                Err(e) => {
                    warn!(error = %e, opened, "Pool warm-up connection failed");
                    break;
                }
            }
        }
        if opened > 0 {
            info!(opened, "Connection pool warmed up");
        }
        opened
    }

    /// Close every idle session and warm up again.
    pub async fn reset_pool(&self) -> usize {
        let closed = self.close_idle("reset").await;
        info!(closed, "Connection pool reset");
        self.warm_up(self.shared.config.min_connections).await;
        closed
    }

    /// Start the periodic health-check loop. Idempotent.
    pub fn start_health_checks(&self) {
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(health::run_health_loop(shared, shutdown_rx)));
    }

    /// Ping every idle session once and evict the ones that fail.
    pub async fn health_check(&self) -> HealthReport {
        health::check_idle(&self.shared).await
    }

    /// Refuse new leases, stop the health loop and close idle sessions.
    pub async fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        let _ = self.shutdown_tx.send(true);
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let closed = self.close_idle("shutdown").await;
        info!(closed, "Connection pool shut down");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.shared.state.lock().stats(self.shared.config.max_size)
    }

    async fn open(&self) -> Result<PooledConnection, DataError> {
        let session = self.shared.connector.connect().await?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        crate::metrics::record_connection_created();
        debug!(connection = id, "Opened new session");
        Ok(PooledConnection {
            id,
            session,
            created_at: now,
            last_checked_at: now,
        })
    }

    async fn close_idle(&self, reason: &'static str) -> usize {
        let batch = {
            let mut st = self.shared.state.lock();
            let batch = std::mem::take(&mut st.idle);
            st.closing += batch.len();
            self.shared.publish(&st);
            batch
        };
        let count = batch.len();
        for conn in batch {
            let _guard = SlotGuard::new(self.shared.clone(), Bucket::Closing);
            crate::metrics::record_connection_discarded(reason);
            close_session(conn, reason).await;
        }
        count
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }
}
