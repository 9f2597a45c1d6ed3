// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Start, reset and shutdown.

use tracing::{info, warn};

use super::{DataAccess, ServiceState};
use crate::cache::ReconnectState;
use crate::error::DataError;

impl DataAccess {
    /// Warm the pool, start health checks and connect the distributed tier.
    ///
    /// Neither an unreachable database nor an unreachable cache fails startup:
    /// the pool opens sessions lazily and the cache runs local-only while a
    /// background reconnect is armed. Calling `start` on a ready service is a
    /// no-op; on a stopped one it fails with `PoolClosed`.
    #[tracing::instrument(skip(self), fields(caching = self.caching))]
    pub async fn start(&self) -> Result<(), DataError> {
        match self.state() {
            ServiceState::Ready | ServiceState::Starting => return Ok(()),
            state if state.is_terminal() => return Err(DataError::PoolClosed),
            _ => {}
        }
        self.set_state(ServiceState::Starting);

        let opened = self.pool.warm_up(self.config.pool_min_connections).await;
        if opened < self.config.pool_min_connections {
            warn!(
                opened,
                wanted = self.config.pool_min_connections,
                "Database warm-up incomplete, sessions will open on demand"
            );
        }
        self.pool.start_health_checks();

        if self.caching {
            let remote = self.cache.connect_remote().await;
            info!(remote, "Cache tiers ready");
        } else {
            info!(environment = ?self.config.environment, "Caching disabled, all reads hit the database");
        }

        self.set_state(ServiceState::Ready);
        Ok(())
    }

    /// Close the circuit and resume distributed-tier reconnects.
    ///
    /// This is the way out of an exhausted reconnect budget.
    #[tracing::instrument(skip(self))]
    pub fn reset(&self) -> ReconnectState {
        self.breaker.reset();
        let reconnect = self.cache.reset_reconnect();
        info!(?reconnect, "Data access service reset");
        reconnect
    }

    /// Close every idle session and open `pool_min_connections` fresh ones.
    ///
    /// Returns the number of idle sessions closed.
    #[tracing::instrument(skip(self))]
    pub async fn reset_connection_pool(&self) -> usize {
        self.pool.reset_pool().await
    }

    /// Stop background tasks and close every idle session.
    ///
    /// Leases still held are closed when returned; new queries fail with
    /// `PoolClosed`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() == ServiceState::Stopped {
            return;
        }
        self.set_state(ServiceState::ShuttingDown);
        self.cache.shutdown();
        self.pool.shutdown().await;
        self.set_state(ServiceState::Stopped);
    }
}
