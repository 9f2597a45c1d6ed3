// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted backends for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use crate::error::DataError;
use crate::query::{QueryOutput, SqlParam, WriteSummary};
use crate::storage::memory::LocalCache;
use crate::storage::traits::{CacheError, Connector, RemoteCache, RemoteCacheConnector, Session, TierRead};

/// What the next `execute` on any scripted session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Ok,
    ConnectionLost,
    Syntax,
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    next_session: AtomicU64,
    created: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    pings: AtomicUsize,
    executes: AtomicUsize,
    connect_failing: AtomicBool,
    ping_hang: AtomicBool,
    connect_delay: Mutex<Duration>,
    dead: Mutex<HashSet<u64>>,
    script: Mutex<VecDeque<Step>>,
    connect_times: Mutex<Vec<Instant>>,
}

/// Connector whose sessions follow a shared script.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    state: Arc<ConnectorState>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    pub(crate) fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn executes(&self) -> usize {
        self.state.executes.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    pub(crate) fn set_connect_failing(&self, failing: bool) {
        self.state.connect_failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_ping_hang(&self, hang: bool) {
        self.state.ping_hang.store(hang, Ordering::SeqCst);
    }

    /// Make the session with this connector-assigned id fail pings and queries.
    pub(crate) fn kill_session(&self, id: u64) {
        self.state.dead.lock().insert(id);
    }

    pub(crate) fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.state.script.lock().extend(steps);
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        self.state.connect_times.lock().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, DataError> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.connect_times.lock().push(Instant::now());
        if self.state.connect_failing.load(Ordering::SeqCst) {
            return Err(DataError::Connection("connect ECONNREFUSED".into()));
        }
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.created.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            id,
            state: self.state.clone(),
        }))
    }
}

struct ScriptedSession {
    id: u64,
    state: Arc<ConnectorState>,
}

impl ScriptedSession {
    fn is_dead(&self) -> bool {
        self.state.dead.lock().contains(&self.id)
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(&mut self, sql: &str, _params: &[SqlParam]) -> Result<QueryOutput, DataError> {
        self.state.executes.fetch_add(1, Ordering::SeqCst);
        if self.is_dead() {
            return Err(DataError::Connection("Lost connection to MySQL server during query".into()));
        }
        let step = self.state.script.lock().pop_front().unwrap_or(Step::Ok);
        match step {
            Step::Ok if crate::query::returns_rows(sql) => {
                let row = json!({ "session": self.id, "sql": sql });
                Ok(QueryOutput::Rows(vec![row.as_object().cloned().unwrap_or_default()]))
            }
            Step::Ok => Ok(QueryOutput::Affected(WriteSummary {
                rows_affected: 1,
                last_insert_id: None,
            })),
            Step::ConnectionLost => Err(DataError::Connection("read ECONNRESET".into())),
            Step::Syntax => Err(DataError::Query("You have an error in your SQL syntax".into())),
            Step::Hang => std::future::pending::<Result<QueryOutput, DataError>>().await,
        }
    }

    async fn ping(&mut self) -> Result<(), DataError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.ping_hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_dead() {
            return Err(DataError::Connection("MySQL server has gone away".into()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DataError> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory distributed tier that can be switched into failure.
#[derive(Default)]
pub(crate) struct FlakyRemote {
    store: LocalCache,
    failing: AtomicBool,
    get_calls: AtomicUsize,
    set_calls: AtomicUsize,
    ttls: Mutex<HashMap<String, Option<Duration>>>,
}

impl FlakyRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    pub(crate) fn raw(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_ttl(&self, key: &str) -> Option<Option<Duration>> {
        self.ttls.lock().get(key).copied()
    }

    fn down(&self) -> CacheError {
        CacheError::Connection("connection refused".into())
    }
}

#[async_trait]
impl RemoteCache for FlakyRemote {
    async fn get(&self, key: &str) -> TierRead {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing() {
            return TierRead::Unavailable(self.down());
        }
        RemoteCache::get(&self.store, key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_failing() {
            return Err(self.down());
        }
        self.ttls.lock().insert(key.to_string(), ttl);
        RemoteCache::set(&self.store, key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        if self.is_failing() {
            return Err(self.down());
        }
        RemoteCache::delete(&self.store, keys).await
    }

    async fn scan_delete(&self, pattern: &str) -> Result<usize, CacheError> {
        if self.is_failing() {
            return Err(self.down());
        }
        RemoteCache::scan_delete(&self.store, pattern).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        if self.is_failing() {
            return Err(self.down());
        }
        Ok(())
    }
}

/// Connector for the distributed tier with a switchable failure mode.
pub(crate) struct ScriptedRemoteConnector {
    remote: Arc<FlakyRemote>,
    failing: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
}

impl ScriptedRemoteConnector {
    pub(crate) fn healthy() -> Self {
        Self::serving(Arc::new(FlakyRemote::new()))
    }

    pub(crate) fn failing() -> Self {
        let connector = Self::healthy();
        connector.set_failing(true);
        connector
    }

    /// Hands out `remote`; connecting fails while `remote` is failing.
    pub(crate) fn serving(remote: Arc<FlakyRemote>) -> Self {
        Self {
            remote,
            failing: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Time between consecutive connect attempts.
    pub(crate) fn attempt_gaps(&self) -> Vec<Duration> {
        self.attempts.lock().windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl RemoteCacheConnector for ScriptedRemoteConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteCache>, CacheError> {
        self.attempts.lock().push(Instant::now());
        if self.failing.load(Ordering::SeqCst) || self.remote.is_failing() {
            return Err(CacheError::Connection("connection refused".into()));
        }
        Ok(self.remote.clone())
    }
}
