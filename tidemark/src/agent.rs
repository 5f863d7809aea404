//! The shard agent: drives one shard through its lifecycle.
//!
//! An agent repeatedly fetches batches from the event log, applies the
//! shard's projection in sequence order, and commits the batch's end
//! sequence to the progress store in the same transaction as the
//! projection's writes. The polling loop is explicit: every suspension point
//! (the poll wait, the store calls, the backoff sleeps) also observes the
//! shutdown and pause signals, so an in-flight transaction always completes
//! and no event is ever left half-applied.
//!
//! ## Gap handling
//!
//! Writers commit out of sequence-allocation order, so sequence `N+2` can be
//! visible while `N+1` is still pending. The agent never silently advances
//! past such a hole: it holds position at the last fully contiguous sequence
//! and remembers the frontier gap. Because it never passes an unresolved
//! hole, at most one gap is ever outstanding — a single record, not an
//! unbounded buffer. If the hole persists past the configured timeout the
//! agent logs the skipped range and moves on.

use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::event::{Event, EventLog};
use crate::progress::{CommitOutcome, MaterializationBatch, ProcessingMode, ProgressStore};
use crate::shard::{ShardDefinition, ShardState, ShardStatus};
use crate::types::Sequence;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How far an agent run should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTarget {
    /// Catch up, then tail the log until shutdown.
    Continuous,
    /// Replay up to a fixed sequence (the tail observed at rebuild start),
    /// then stop.
    UpTo(Sequence),
}

/// The frontier gap the agent is currently holding at.
#[derive(Debug, Clone, Copy)]
struct GapWatch {
    /// First missing sequence.
    missing: Sequence,
    /// When the hole was first observed.
    since: Instant,
}

/// Why a catch-up or live loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    CaughtUp,
    TargetReached,
    Shutdown,
    Paused,
}

/// Outcome of processing one fetched batch.
#[derive(Debug, Clone, Copy)]
struct BatchOutcome {
    /// How many events the fetch returned.
    fetched: usize,
    /// Whether the high-water mark advanced.
    advanced: bool,
    /// Whether the scan stopped at an unresolved sequence gap.
    blocked_on_gap: bool,
    /// Whether the commit lost an optimistic conflict and the mark was
    /// reloaded from the store.
    conflicted: bool,
}

/// Control signals shared between the coordinator and one agent.
#[derive(Debug, Clone)]
pub struct AgentControl {
    /// Becomes `true` when the daemon requests cooperative shutdown.
    pub shutdown: tokio::sync::watch::Receiver<bool>,
    /// `true` while the shard is paused.
    pub pause: tokio::sync::watch::Receiver<bool>,
}

/// A worker that drives one shard: `Stopped → CatchingUp → Live ⇄ Paused`,
/// with any state able to transition to `Errored` on unrecoverable failure.
pub struct ShardAgent {
    definition: ShardDefinition,
    log: Arc<dyn EventLog>,
    progress: Arc<dyn ProgressStore>,
    config: DaemonConfig,
    state: Arc<ShardState>,
    control: AgentControl,
    mark: Sequence,
    gap: Option<GapWatch>,
}

impl ShardAgent {
    /// Creates an agent for the given shard.
    pub fn new(
        definition: ShardDefinition,
        log: Arc<dyn EventLog>,
        progress: Arc<dyn ProgressStore>,
        config: DaemonConfig,
        state: Arc<ShardState>,
        control: AgentControl,
    ) -> Self {
        Self {
            definition,
            log,
            progress,
            config,
            state,
            control,
            mark: Sequence::ZERO,
            gap: None,
        }
    }

    /// Runs the agent to completion.
    ///
    /// For [`RunTarget::Continuous`] this returns only on shutdown; for
    /// [`RunTarget::UpTo`] it returns `Ok` only once the mark reaches the
    /// target — a shutdown that interrupts a bounded run before the target
    /// fails with [`DaemonError::ShuttingDown`], never a claimed completion.
    /// On unrecoverable failure the shard is left `Errored` with its last
    /// committed progress intact and the cause is returned.
    #[instrument(skip(self), fields(shard = %self.definition.name))]
    pub async fn run(mut self, mode: ProcessingMode, target: RunTarget) -> DaemonResult<()> {
        match self.drive(mode, target).await {
            Ok(exit) => {
                debug!(shard = %self.definition.name, ?exit, "shard agent stopped");
                self.state.set_status(ShardStatus::Stopped);
                if exit == LoopExit::Shutdown {
                    self.interrupted(target)
                } else {
                    Ok(())
                }
            }
            // A shutdown observed while waiting out a retry backoff is a
            // clean stop, not a shard failure.
            Err(DaemonError::ShuttingDown) => {
                debug!(shard = %self.definition.name, "shard agent stopped during shutdown");
                self.state.set_status(ShardStatus::Stopped);
                self.interrupted(target)
            }
            Err(error) => {
                warn!(shard = %self.definition.name, %error, "shard agent errored");
                self.state.set_errored(error.to_string());
                Err(error)
            }
        }
    }

    /// Whether a shutdown cut a bounded run short of its target. The caller
    /// of a rebuild must see the interruption, not a completed rebuild.
    fn interrupted(&self, target: RunTarget) -> DaemonResult<()> {
        match target {
            RunTarget::UpTo(goal) if self.mark < goal => Err(DaemonError::ShuttingDown),
            _ => Ok(()),
        }
    }

    async fn drive(&mut self, mode: ProcessingMode, target: RunTarget) -> DaemonResult<LoopExit> {
        // Recover the high-water mark from the durable progress record.
        self.mark = self.load_mark().await?;
        self.state.set_high_water_mark(self.mark);
        info!(
            shard = %self.definition.name,
            mark = %self.mark,
            ?target,
            "shard agent starting"
        );

        loop {
            self.state.set_status(ShardStatus::CatchingUp);
            match self.catch_up(mode, target).await? {
                LoopExit::Paused => {
                    self.wait_resumed().await;
                    if self.shutdown_requested() {
                        return Ok(LoopExit::Shutdown);
                    }
                    continue;
                }
                exit @ (LoopExit::TargetReached | LoopExit::Shutdown) => return Ok(exit),
                LoopExit::CaughtUp => {}
            }

            self.state.set_status(ShardStatus::Live);
            info!(shard = %self.definition.name, mark = %self.mark, "shard is live");
            match self.live(mode).await? {
                LoopExit::Paused => {
                    self.wait_resumed().await;
                    if self.shutdown_requested() {
                        return Ok(LoopExit::Shutdown);
                    }
                    // Resume goes back through catch-up.
                }
                exit => return Ok(exit),
            }
        }
    }

    /// Bulk replay toward the log's tail (or a fixed rebuild target).
    ///
    /// Caught up means a fetch returned fewer events than the batch size
    /// with no unresolved gap in front of the mark.
    async fn catch_up(&mut self, mode: ProcessingMode, target: RunTarget) -> DaemonResult<LoopExit> {
        loop {
            if self.shutdown_requested() {
                return Ok(LoopExit::Shutdown);
            }
            if self.pause_requested() {
                return Ok(LoopExit::Paused);
            }
            if let RunTarget::UpTo(goal) = target {
                if self.mark >= goal {
                    return Ok(LoopExit::TargetReached);
                }
            }

            let outcome = self.process_next_batch(mode, target).await?;

            if outcome.conflicted {
                // Refetch from the reloaded mark immediately.
                continue;
            }
            if outcome.blocked_on_gap {
                // Hold position; the writer may still commit, or the gap
                // timeout will let the next scan advance.
                self.sleep_observing_shutdown(self.config.poll_interval)
                    .await;
                continue;
            }
            if outcome.fetched < self.config.batch_size {
                if let RunTarget::UpTo(goal) = target {
                    if self.mark >= goal {
                        return Ok(LoopExit::TargetReached);
                    }
                    if !outcome.advanced {
                        // The remaining sequences up to the target were
                        // abandoned by their writers; nothing more will
                        // become visible below the goal.
                        debug!(
                            shard = %self.definition.name,
                            mark = %self.mark,
                            goal = %goal,
                            "rebuild target unreachable, tail sequences abandoned"
                        );
                        return Ok(LoopExit::TargetReached);
                    }
                    continue;
                }
                return Ok(LoopExit::CaughtUp);
            }
        }
    }

    /// Low-latency tailing of new events after catch-up.
    async fn live(&mut self, mode: ProcessingMode) -> DaemonResult<LoopExit> {
        loop {
            if self.shutdown_requested() {
                return Ok(LoopExit::Shutdown);
            }
            if self.pause_requested() {
                return Ok(LoopExit::Paused);
            }

            let outcome = self.process_next_batch(mode, RunTarget::Continuous).await?;

            // Only keep draining without a wait while full batches arrive.
            if outcome.fetched < self.config.batch_size || outcome.blocked_on_gap {
                self.sleep_observing_shutdown(self.config.poll_interval)
                    .await;
            }
        }
    }

    /// Fetches one batch past the mark, applies the contiguous prefix in
    /// sequence order, and commits the new mark atomically with the
    /// projection's writes.
    async fn process_next_batch(
        &mut self,
        mode: ProcessingMode,
        target: RunTarget,
    ) -> DaemonResult<BatchOutcome> {
        let events = self.fetch_batch().await?;
        let fetched = events.len();

        let (applicable, blocked_on_gap) = self.scan_contiguous(events, target);
        if applicable.is_empty() {
            return Ok(BatchOutcome {
                fetched,
                advanced: false,
                blocked_on_gap,
                conflicted: false,
            });
        }

        let new_mark = applicable
            .last()
            .map_or(self.mark, |event| event.sequence);

        let mut batch = MaterializationBatch::new();
        for event in &applicable {
            if self.definition.filter.matches(event) {
                self.definition
                    .projection
                    .apply(event, &mut batch)
                    .await
                    .map_err(DaemonError::Projection)?;
            }
        }

        match self.commit_batch(new_mark, mode, batch).await? {
            CommitOutcome::Committed => {
                self.mark = new_mark;
                self.state.set_high_water_mark(new_mark);
                debug!(
                    shard = %self.definition.name,
                    mark = %new_mark,
                    applied = applicable.len(),
                    "batch committed"
                );
                Ok(BatchOutcome {
                    fetched,
                    advanced: true,
                    blocked_on_gap,
                    conflicted: false,
                })
            }
            CommitOutcome::Conflict => {
                // Another writer owns this shard's progress row. Reload and
                // discard the in-flight batch instead of retrying blindly.
                let stored = self.load_mark().await?;
                info!(
                    shard = %self.definition.name,
                    offered = %new_mark,
                    stored = %stored,
                    "progress commit conflict, reloading"
                );
                self.mark = stored;
                self.state.set_high_water_mark(stored);
                self.gap = None;
                Ok(BatchOutcome {
                    fetched,
                    advanced: false,
                    blocked_on_gap: false,
                    conflicted: true,
                })
            }
        }
    }

    /// Splits a fetched batch into the prefix that may be applied now.
    ///
    /// The scan walks events in ascending sequence order and stops at the
    /// first hole that has not yet timed out. A hole that outlives the gap
    /// timeout is logged and skipped. For bounded runs, events past the
    /// target are dropped.
    fn scan_contiguous(&mut self, events: Vec<Event>, target: RunTarget) -> (Vec<Event>, bool) {
        let mut applicable = Vec::with_capacity(events.len());
        let mut expected = self.mark.next();

        for event in events {
            if let RunTarget::UpTo(goal) = target {
                if event.sequence > goal {
                    break;
                }
            }
            if event.sequence > expected {
                match self.gap {
                    Some(watch)
                        if watch.missing == expected
                            && watch.since.elapsed() >= self.config.gap_timeout =>
                    {
                        warn!(
                            shard = %self.definition.name,
                            from = %expected,
                            to = %event.sequence,
                            timeout = ?self.config.gap_timeout,
                            "sequence gap timed out, skipping"
                        );
                        self.gap = None;
                    }
                    Some(watch) if watch.missing == expected => {
                        // Still inside the gap window: hold position here.
                        return (applicable, true);
                    }
                    _ => {
                        debug!(
                            shard = %self.definition.name,
                            missing = %expected,
                            visible = %event.sequence,
                            "sequence gap observed, holding position"
                        );
                        self.gap = Some(GapWatch {
                            missing: expected,
                            since: Instant::now(),
                        });
                        return (applicable, true);
                    }
                }
            } else {
                self.gap = None;
            }
            expected = event.sequence.next();
            applicable.push(event);
        }

        (applicable, false)
    }

    /// Loads the durable mark, retrying transient failures.
    async fn load_mark(&mut self) -> DaemonResult<Sequence> {
        let mut attempt = 0;
        loop {
            match self.progress.load(&self.definition.name).await {
                Ok(record) => {
                    return Ok(record.map_or(Sequence::ZERO, |r| r.last_sequence_applied));
                }
                Err(error) => self.backoff_or_fail(&mut attempt, error.is_transient(), error).await?,
            }
        }
    }

    /// Fetches the next batch, retrying transient failures.
    async fn fetch_batch(&mut self) -> DaemonResult<Vec<Event>> {
        let mut attempt = 0;
        loop {
            match self
                .log
                .fetch_after(self.mark, self.config.batch_size)
                .await
            {
                Ok(events) => return Ok(events),
                Err(error) => self.backoff_or_fail(&mut attempt, error.is_transient(), error).await?,
            }
        }
    }

    /// Commits progress and writes, retrying transient failures.
    async fn commit_batch(
        &mut self,
        new_mark: Sequence,
        mode: ProcessingMode,
        batch: MaterializationBatch,
    ) -> DaemonResult<CommitOutcome> {
        let mut attempt = 0;
        loop {
            match self
                .progress
                .commit(&self.definition.name, new_mark, mode, batch.clone())
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(error) => self.backoff_or_fail(&mut attempt, error.is_transient(), error).await?,
            }
        }
    }

    /// Sleeps with exponential backoff for a transient failure, or converts
    /// it into the shard's terminal error.
    async fn backoff_or_fail<E>(
        &mut self,
        attempt: &mut u32,
        transient: bool,
        error: E,
    ) -> DaemonResult<()>
    where
        E: std::error::Error + Into<DaemonError>,
    {
        if !transient {
            return Err(error.into());
        }
        if *attempt >= self.config.retry.max_retries {
            return Err(DaemonError::RetriesExhausted {
                shard: self.definition.name.clone(),
                attempts: *attempt,
                cause: error.to_string(),
            });
        }
        let delay = retry_delay(&self.config.retry, *attempt);
        debug!(
            shard = %self.definition.name,
            attempt = *attempt,
            ?delay,
            %error,
            "transient store failure, backing off"
        );
        *attempt += 1;
        self.sleep_observing_shutdown(delay).await;
        if self.shutdown_requested() {
            return Err(DaemonError::ShuttingDown);
        }
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        *self.control.shutdown.borrow()
    }

    fn pause_requested(&self) -> bool {
        *self.control.pause.borrow()
    }

    /// Parks the agent until it is resumed or shut down.
    async fn wait_resumed(&mut self) {
        self.state.set_status(ShardStatus::Paused);
        info!(shard = %self.definition.name, "shard paused");
        let mut pause = self.control.pause.clone();
        let mut shutdown = self.control.shutdown.clone();
        loop {
            if *shutdown.borrow() || !*pause.borrow() {
                return;
            }
            tokio::select! {
                _ = pause.changed() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// The poll suspension point: wakes early on shutdown so the signal is
    /// observed at the next boundary rather than after a full interval.
    async fn sleep_observing_shutdown(&mut self, duration: Duration) {
        let mut shutdown = self.control.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Exponential backoff with ±25% jitter to avoid thundering herds when many
/// shards hit the same store failure.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
fn retry_delay(retry: &crate::config::RetryConfig, attempt: u32) -> Duration {
    use rand::Rng;

    let base_delay_ms = retry.base_delay.as_millis() as f64;
    let max_delay_ms = retry.max_delay.as_millis() as f64;

    let delay = base_delay_ms * retry.backoff_multiplier.powi(attempt as i32);
    let delay = delay.min(max_delay_ms);

    let mut rng = rand::rng();
    let jitter = delay * 0.25 * (rng.random::<f64>() - 0.5) * 2.0;
    let final_delay = (delay + jitter).max(0.0).min(max_delay_ms) as u64;

    Duration::from_millis(final_delay)
}
