//! Host boundary: the surface a hosting process drives the daemon through.
//!
//! A host enumerates the available projection databases, starts or rebuilds
//! shards on one of them, and blocks until a process-level stop signal
//! arrives. The host introduces no wire protocol; it is an in-process seam
//! for command-line shells and service harnesses.

use crate::daemon::{ProjectionDaemon, RebuildOutcome};
use crate::errors::{DaemonError, DaemonResult};
use crate::shard::ShardStatusReport;
use crate::types::{DatabaseName, ShardName};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Operations a hosting process uses to drive projection daemons.
#[async_trait]
pub trait ProjectionHost: Send + Sync {
    /// Enumerates the available projection databases.
    fn all_stores(&self) -> Vec<DatabaseName>;

    /// Begins continuous processing for the given shards on a database.
    async fn start_shards(
        &self,
        database: &DatabaseName,
        shards: &[ShardName],
    ) -> DaemonResult<()>;

    /// Performs a bounded, from-scratch rebuild of the given shards.
    ///
    /// Returns [`RebuildOutcome::NoData`] only when every requested shard
    /// had no matching events; otherwise [`RebuildOutcome::Complete`] once
    /// all shards reach the tail observed at rebuild start.
    async fn try_rebuild_shards(
        &self,
        database: &DatabaseName,
        shards: &[ShardName],
    ) -> DaemonResult<RebuildOutcome>;

    /// Blocks until a stop signal arrives.
    async fn wait_for_exit(&self);

    /// Cooperative stop: signals every daemon, waits for all agents to
    /// finish their current transaction, then releases `wait_for_exit`.
    async fn request_shutdown(&self);
}

/// In-process host over a set of named projection databases.
pub struct DaemonHost {
    stores: BTreeMap<DatabaseName, Arc<ProjectionDaemon>>,
    exit_tx: watch::Sender<bool>,
}

impl DaemonHost {
    /// Creates a host with no databases.
    pub fn new() -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            stores: BTreeMap::new(),
            exit_tx,
        }
    }

    /// Adds a projection database to the host.
    pub fn add_store(&mut self, name: DatabaseName, daemon: Arc<ProjectionDaemon>) {
        self.stores.insert(name, daemon);
    }

    /// Looks up a database's daemon.
    pub fn store(&self, name: &DatabaseName) -> DaemonResult<&Arc<ProjectionDaemon>> {
        self.stores
            .get(name)
            .ok_or_else(|| DaemonError::UnknownDatabase(name.clone()))
    }

    /// Aggregate status for one database.
    pub async fn status(&self, database: &DatabaseName) -> DaemonResult<Vec<ShardStatusReport>> {
        Ok(self.store(database)?.status().await)
    }
}

impl Default for DaemonHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectionHost for DaemonHost {
    fn all_stores(&self) -> Vec<DatabaseName> {
        self.stores.keys().cloned().collect()
    }

    async fn start_shards(
        &self,
        database: &DatabaseName,
        shards: &[ShardName],
    ) -> DaemonResult<()> {
        self.store(database)?.start_shards(shards).await
    }

    async fn try_rebuild_shards(
        &self,
        database: &DatabaseName,
        shards: &[ShardName],
    ) -> DaemonResult<RebuildOutcome> {
        let outcomes = self.store(database)?.rebuild_shards(shards).await?;
        let all_no_data = outcomes
            .iter()
            .all(|(_, outcome)| *outcome == RebuildOutcome::NoData);
        if all_no_data && !outcomes.is_empty() {
            Ok(RebuildOutcome::NoData)
        } else {
            Ok(RebuildOutcome::Complete)
        }
    }

    async fn wait_for_exit(&self) {
        let mut exit = self.exit_tx.subscribe();
        while !*exit.borrow() {
            if exit.changed().await.is_err() {
                return;
            }
        }
    }

    async fn request_shutdown(&self) {
        info!("host shutdown requested");
        for (name, daemon) in &self.stores {
            info!(database = %name, "stopping daemon");
            daemon.shutdown().await;
        }
        // send_replace stores the value even with no receivers alive, so a
        // waiter that subscribes afterwards still observes the stop signal.
        self.exit_tx.send_replace(true);
    }
}

impl std::fmt::Debug for DaemonHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHost")
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
