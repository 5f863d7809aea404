//! Shard identity and observable state.
//!
//! A shard is one independently-progressing projection instance plus the
//! filter describing which events it consumes. Shard definitions are static
//! configuration, immutable after daemon start; the in-memory agent state is
//! ephemeral and recovered from the progress record on restart.

use crate::event::EventFilter;
use crate::projection::Projection;
use crate::types::{Sequence, ShardName};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Static configuration for one shard.
#[derive(Clone)]
pub struct ShardDefinition {
    /// The shard's unique name, also the key of its progress record.
    pub name: ShardName,
    /// The projection this shard drives.
    pub projection: Arc<dyn Projection>,
    /// Which events this shard consumes.
    pub filter: EventFilter,
}

impl ShardDefinition {
    /// Creates a shard definition.
    pub fn new(name: ShardName, projection: Arc<dyn Projection>, filter: EventFilter) -> Self {
        Self {
            name,
            projection,
            filter,
        }
    }
}

impl fmt::Debug for ShardDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardDefinition")
            .field("name", &self.name)
            .field("projection", &self.projection.name())
            .field("filter", &self.filter)
            .finish()
    }
}

/// Lifecycle state of a shard agent.
///
/// Transitions: `Stopped → CatchingUp → Live ⇄ Paused`, with any state able
/// to move to `Errored` on unrecoverable failure. `Errored` is terminal for
/// that agent instance until it is externally restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// No agent is running for this shard.
    Stopped,
    /// Bulk replay of historical events toward the log's tail.
    CatchingUp,
    /// Low-latency tailing of new events.
    Live,
    /// Agent retains state but is not polling.
    Paused,
    /// Unrecoverable failure; progress preserved, no further advancement.
    Errored,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::CatchingUp => "catching-up",
            Self::Live => "live",
            Self::Paused => "paused",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Snapshot of one shard's state, as returned by the status query.
#[derive(Debug, Clone)]
pub struct ShardStatusReport {
    /// The shard's name.
    pub shard: ShardName,
    /// Current lifecycle state.
    pub status: ShardStatus,
    /// The shard's in-memory high-water mark.
    pub high_water_mark: Sequence,
    /// The failure that moved the shard to `Errored`, if any.
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct ShardStateInner {
    status: ShardStatus,
    high_water_mark: Sequence,
    last_error: Option<String>,
}

/// Shared, ephemeral agent state: written by the agent, read by the
/// coordinator's status query.
#[derive(Debug)]
pub struct ShardState {
    inner: Mutex<ShardStateInner>,
}

impl ShardState {
    /// Creates state for a freshly constructed (stopped) agent.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ShardStateInner {
                status: ShardStatus::Stopped,
                high_water_mark: Sequence::ZERO,
                last_error: None,
            }),
        }
    }

    /// Records a lifecycle transition.
    pub fn set_status(&self, status: ShardStatus) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.status = status;
        }
    }

    /// Records an unrecoverable failure and moves the shard to `Errored`.
    pub fn set_errored(&self, error: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.status = ShardStatus::Errored;
            inner.last_error = Some(error.into());
        }
    }

    /// Records a newly committed high-water mark.
    pub fn set_high_water_mark(&self, mark: Sequence) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.high_water_mark = mark;
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ShardStatus {
        self.inner
            .lock()
            .map_or(ShardStatus::Errored, |inner| inner.status)
    }

    /// Current high-water mark.
    pub fn high_water_mark(&self) -> Sequence {
        self.inner
            .lock()
            .map_or(Sequence::ZERO, |inner| inner.high_water_mark)
    }

    /// Builds a status snapshot for the given shard name.
    pub fn report(&self, shard: ShardName) -> ShardStatusReport {
        match self.inner.lock() {
            Ok(inner) => ShardStatusReport {
                shard,
                status: inner.status,
                high_water_mark: inner.high_water_mark,
                last_error: inner.last_error.clone(),
            },
            Err(_) => ShardStatusReport {
                shard,
                status: ShardStatus::Errored,
                high_water_mark: Sequence::ZERO,
                last_error: Some("shard state lock poisoned".to_string()),
            },
        }
    }
}

impl Default for ShardState {
    fn default() -> Self {
        Self::new()
    }
}
