// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervision of the distributed cache connection.
//!
//! The live client sits in a [`RemoteSlot`]. When a read or write fails the
//! slot is marked unavailable and the [`ReconnectSupervisor`] is armed: one
//! background task retries the connector with growing delays. It either
//! installs a fresh client or gives up and parks in `Exhausted` until
//! [`ReconnectSupervisor::reset`] is called.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::invalidation::PendingDeletes;
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{CacheError, RemoteCache, RemoteCacheConnector};

/// Holder of the current distributed-tier client.
pub(crate) struct RemoteSlot {
    client: RwLock<Option<Arc<dyn RemoteCache>>>,
    available: AtomicBool,
}

impl RemoteSlot {
    pub(crate) fn new() -> Self {
        Self {
            client: RwLock::new(None),
            available: AtomicBool::new(false),
        }
    }

    /// The client, only while the tier is considered available.
    pub(crate) fn current(&self) -> Option<Arc<dyn RemoteCache>> {
        if !self.available.load(Ordering::Acquire) {
            return None;
        }
        self.client.read().clone()
    }

    pub(crate) fn install(&self, client: Arc<dyn RemoteCache>) {
        *self.client.write() = Some(client);
        self.available.store(true, Ordering::Release);
        crate::metrics::set_remote_available(true);
    }

    /// Returns true if this call flipped the slot from available.
    pub(crate) fn mark_unavailable(&self) -> bool {
        let was = self.available.swap(false, Ordering::AcqRel);
        if was {
            crate::metrics::set_remote_available(false);
        }
        was
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectState {
    /// No reconnect in progress
    Idle,
    /// A background task is retrying
    Armed,
    /// Gave up after the attempt budget; waits for a reset
    Exhausted,
}

struct SupervisorInner {
    connector: Option<Arc<dyn RemoteCacheConnector>>,
    slot: Arc<RemoteSlot>,
    pending: Arc<PendingDeletes>,
    policy: RetryConfig,
    state: Mutex<ReconnectState>,
    task: Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU64,
    stopped: AtomicBool,
}

pub(crate) struct ReconnectSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ReconnectSupervisor {
    pub(crate) fn new(
        connector: Option<Arc<dyn RemoteCacheConnector>>,
        slot: Arc<RemoteSlot>,
        pending: Arc<PendingDeletes>,
        policy: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                connector,
                slot,
                pending,
                policy,
                state: Mutex::new(ReconnectState::Idle),
                task: Mutex::new(None),
                attempts: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn has_connector(&self) -> bool {
        self.inner.connector.is_some()
    }

    pub(crate) fn state(&self) -> ReconnectState {
        *self.inner.state.lock()
    }

    /// Background attempts made since construction.
    pub(crate) fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Connect once in the foreground and install the client on success.
    pub(crate) async fn connect_once(&self) -> Result<(), CacheError> {
        let connector = self
            .inner
            .connector
            .as_ref()
            .ok_or_else(|| CacheError::Connection("no distributed cache configured".into()))?;
        let client = connector.connect().await?;
        self.inner.pending.replay(client.as_ref()).await?;
        self.inner.slot.install(client);
        Ok(())
    }

    /// Start a background reconnect unless one is running or the budget is
    /// spent. Returns true if a task was started.
    pub(crate) fn arm(&self) -> bool {
        let Some(connector) = self.inner.connector.clone() else {
            return false;
        };
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, distributed cache reconnect not scheduled");
            return false;
        };

        {
            let mut state = self.inner.state.lock();
            if *state != ReconnectState::Idle {
                return false;
            }
            *state = ReconnectState::Armed;
        }

        debug!(max_attempts = self.inner.policy.max_attempts, "Arming distributed cache reconnect");
        let inner = self.inner.clone();
        let task = handle.spawn(async move { run_reconnect(inner, connector).await });
        if let Some(previous) = self.inner.task.lock().replace(task) {
            previous.abort();
        }
        true
    }

    /// Leave `Exhausted` and re-arm if the tier is still down.
    pub(crate) fn reset(&self) -> ReconnectState {
        {
            let mut state = self.inner.state.lock();
            if *state == ReconnectState::Exhausted {
                info!("Distributed cache reconnect budget reset");
                *state = ReconnectState::Idle;
            }
        }
        if !self.inner.slot.is_available() {
            self.arm();
        }
        self.state()
    }

    /// Abort any running task and refuse further arming.
    pub(crate) fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        let mut state = self.inner.state.lock();
        if *state == ReconnectState::Armed {
            *state = ReconnectState::Idle;
        }
    }
}

async fn run_reconnect(inner: Arc<SupervisorInner>, connector: Arc<dyn RemoteCacheConnector>) {
    let max_attempts = inner.policy.max_attempts;

    for attempt in 1..=max_attempts {
        let delay = inner.policy.delay_for_attempt(attempt);
        tokio::time::sleep(delay).await;
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }

        inner.attempts.fetch_add(1, Ordering::Relaxed);
        let connected = match connector.connect().await {
            Ok(client) => inner.pending.replay(client.as_ref()).await.map(|_| client),
            Err(e) => Err(e),
        };
        match connected {
            Ok(client) => {
                inner.slot.install(client);
                *inner.state.lock() = ReconnectState::Idle;
                crate::metrics::record_reconnect_attempt("success");
                info!(attempt, "Distributed cache reconnected");
                return;
            }
            Err(e) => {
                crate::metrics::record_reconnect_attempt("failed");
                warn!(attempt, max_attempts, error = %e, "Distributed cache reconnect failed");
            }
        }
    }

    *inner.state.lock() = ReconnectState::Exhausted;
    error!(max_attempts, "Giving up on distributed cache reconnect, serving from local tier only");
}
