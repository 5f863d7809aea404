//! The projection daemon: coordinator for a database's shard agents.
//!
//! The daemon owns the set of shard agents for one projection database. It
//! is an explicit, constructed object with an explicit init (register
//! shards) and teardown (cooperative shutdown) — no ambient singletons.
//! Shards run concurrently and independently: a projection fault or a
//! rebuild in one shard never blocks or corrupts another's progress.

use crate::agent::{AgentControl, RunTarget, ShardAgent};
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::event::EventLog;
use crate::progress::{ProcessingMode, ProgressStore};
use crate::shard::{ShardDefinition, ShardState, ShardStatus, ShardStatusReport};
use crate::types::ShardName;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Outcome of a from-scratch rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The event log contained zero matching events at rebuild start;
    /// nothing was done and the progress record was left at zero.
    NoData,
    /// Every matching event up to the log's tail at rebuild start has been
    /// applied.
    Complete,
}

/// A running agent as tracked by the daemon.
struct AgentHandle {
    state: Arc<ShardState>,
    shutdown_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
    task: Option<JoinHandle<DaemonResult<()>>>,
}

impl AgentHandle {
    /// Whether the agent is still running. A finished agent (stopped or
    /// errored) may be replaced by a fresh start or rebuild. A handle whose
    /// task was taken belongs to an in-flight rebuild and counts as active.
    fn is_active(&self) -> bool {
        self.task.as_ref().map_or(true, |task| !task.is_finished())
    }
}

/// Coordinator owning the shard agents for one projection database.
pub struct ProjectionDaemon {
    log: Arc<dyn EventLog>,
    progress: Arc<dyn ProgressStore>,
    config: DaemonConfig,
    shards: BTreeMap<ShardName, ShardDefinition>,
    agents: Mutex<BTreeMap<ShardName, AgentHandle>>,
    shutting_down: AtomicBool,
}

impl ProjectionDaemon {
    /// Creates a daemon over the given stores with no shards registered.
    pub fn new(
        log: Arc<dyn EventLog>,
        progress: Arc<dyn ProgressStore>,
        config: DaemonConfig,
    ) -> Self {
        Self {
            log,
            progress,
            config,
            shards: BTreeMap::new(),
            agents: Mutex::new(BTreeMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Registers a shard. Definitions are static configuration and must all
    /// be registered before the daemon starts processing.
    pub fn register_shard(&mut self, definition: ShardDefinition) {
        debug!(shard = %definition.name, "registering shard");
        self.shards.insert(definition.name.clone(), definition);
    }

    /// The names of all registered shards, in stable order.
    pub fn shard_names(&self) -> Vec<ShardName> {
        self.shards.keys().cloned().collect()
    }

    /// Begins continuous processing for the given shards.
    ///
    /// The whole request is validated before any agent starts: an unknown
    /// or already-running shard fails the call without side effects.
    #[instrument(skip(self))]
    pub async fn start_shards(&self, names: &[ShardName]) -> DaemonResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DaemonError::ShuttingDown);
        }
        let definitions = self.resolve(names)?;

        let mut agents = self.agents.lock().await;
        for name in names {
            if agents.get(name).is_some_and(AgentHandle::is_active) {
                return Err(DaemonError::AlreadyRunning(name.clone()));
            }
        }

        for definition in definitions {
            let name = definition.name.clone();
            let handle = self.spawn_agent(definition, ProcessingMode::Continuous, RunTarget::Continuous);
            agents.insert(name.clone(), handle);
            info!(shard = %name, "started continuous shard agent");
        }
        Ok(())
    }

    /// Begins continuous processing for every registered shard.
    pub async fn start_all(&self) -> DaemonResult<()> {
        let names = self.shard_names();
        self.start_shards(&names).await
    }

    /// Performs a bounded, from-scratch rebuild of the given shards,
    /// concurrently and independently.
    ///
    /// Each shard either reports a definite [`RebuildOutcome`] or the call
    /// fails with an error naming the shard that could not be rebuilt. A
    /// shutdown arriving mid-rebuild fails the call with
    /// [`DaemonError::ShuttingDown`] rather than claiming completion.
    /// Shards not named in the request keep advancing undisturbed.
    #[instrument(skip(self))]
    pub async fn rebuild_shards(
        &self,
        names: &[ShardName],
    ) -> DaemonResult<Vec<(ShardName, RebuildOutcome)>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DaemonError::ShuttingDown);
        }
        let definitions = self.resolve(names)?;
        {
            let agents = self.agents.lock().await;
            for name in names {
                if agents.get(name).is_some_and(AgentHandle::is_active) {
                    return Err(DaemonError::AlreadyRunning(name.clone()));
                }
            }
        }

        let rebuilds = definitions
            .into_iter()
            .map(|definition| self.rebuild_one(definition));
        let results = join_all(rebuilds).await;

        let mut outcomes = Vec::with_capacity(names.len());
        for (name, result) in names.iter().zip(results) {
            outcomes.push((name.clone(), result?));
        }
        Ok(outcomes)
    }

    /// Rebuilds a single shard to the tail observed at rebuild start.
    async fn rebuild_one(&self, definition: ShardDefinition) -> DaemonResult<RebuildOutcome> {
        let name = definition.name.clone();

        if !self.log.any_matching(&definition.filter).await? {
            info!(shard = %name, "rebuild found no matching events");
            return Ok(RebuildOutcome::NoData);
        }

        // Fix the replay target before clearing anything, so the rebuild is
        // bounded even while writers keep appending.
        let target = self.log.tail_sequence().await?;
        let collections = definition.projection.collections();
        self.progress.reset(&name, &collections).await?;
        info!(shard = %name, target = %target, "rebuild starting from zero");

        let mut handle = self.spawn_agent(
            definition,
            ProcessingMode::Rebuilding,
            RunTarget::UpTo(target),
        );
        // Await the agent directly; the stored handle keeps the shard
        // visible to status queries and shutdown signalling meanwhile.
        let task = handle.task.take();
        self.agents.lock().await.insert(name.clone(), handle);

        let result = match task {
            Some(task) => task
                .await
                .map_err(|join_error| DaemonError::Internal(join_error.to_string()))?,
            None => Err(DaemonError::Internal(format!(
                "rebuild task for shard '{name}' was missing"
            ))),
        };

        self.agents.lock().await.remove(&name);
        result.map(|()| {
            info!(shard = %name, "rebuild complete");
            RebuildOutcome::Complete
        })
    }

    /// Pauses a running shard: the agent stops polling but retains state.
    pub async fn pause_shard(&self, name: &ShardName) -> DaemonResult<()> {
        let agents = self.agents.lock().await;
        let handle = agents
            .get(name)
            .ok_or_else(|| DaemonError::UnknownShard(name.clone()))?;
        let _ = handle.pause_tx.send(true);
        Ok(())
    }

    /// Resumes a paused shard; it re-enters catch-up.
    pub async fn resume_shard(&self, name: &ShardName) -> DaemonResult<()> {
        let agents = self.agents.lock().await;
        let handle = agents
            .get(name)
            .ok_or_else(|| DaemonError::UnknownShard(name.clone()))?;
        let _ = handle.pause_tx.send(false);
        Ok(())
    }

    /// Aggregate status: one report per registered shard.
    pub async fn status(&self) -> Vec<ShardStatusReport> {
        let agents = self.agents.lock().await;
        self.shards
            .keys()
            .map(|name| {
                agents.get(name).map_or_else(
                    || ShardStatusReport {
                        shard: name.clone(),
                        status: ShardStatus::Stopped,
                        high_water_mark: crate::types::Sequence::ZERO,
                        last_error: None,
                    },
                    |handle| handle.state.report(name.clone()),
                )
            })
            .collect()
    }

    /// Cooperative shutdown: signals every agent, lets in-flight
    /// transactions finish, and returns once all agents have stopped.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        info!("daemon shutting down");

        let mut agents = self.agents.lock().await;
        let mut tasks = Vec::new();
        for (name, handle) in agents.iter_mut() {
            let _ = handle.shutdown_tx.send(true);
            if let Some(task) = handle.task.take() {
                tasks.push((name.clone(), task));
            }
        }

        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => debug!(shard = %name, "agent stopped cleanly"),
                Ok(Err(error)) => warn!(shard = %name, %error, "agent stopped with error"),
                Err(join_error) => warn!(shard = %name, %join_error, "agent task panicked"),
            }
        }
        agents.clear();
        info!("daemon shutdown complete");
    }

    /// Resolves shard names to definitions, failing the whole request on
    /// the first unknown name.
    fn resolve(&self, names: &[ShardName]) -> DaemonResult<Vec<ShardDefinition>> {
        names
            .iter()
            .map(|name| {
                self.shards
                    .get(name)
                    .cloned()
                    .ok_or_else(|| DaemonError::UnknownShard(name.clone()))
            })
            .collect()
    }

    fn spawn_agent(
        &self,
        definition: ShardDefinition,
        mode: ProcessingMode,
        target: RunTarget,
    ) -> AgentHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        let state = Arc::new(ShardState::new());

        let agent = ShardAgent::new(
            definition,
            Arc::clone(&self.log),
            Arc::clone(&self.progress),
            self.config.clone(),
            Arc::clone(&state),
            AgentControl {
                shutdown: shutdown_rx,
                pause: pause_rx,
            },
        );
        let task = tokio::spawn(agent.run(mode, target));

        AgentHandle {
            state,
            shutdown_tx,
            pause_tx,
            task: Some(task),
        }
    }
}

impl std::fmt::Debug for ProjectionDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDaemon")
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}
