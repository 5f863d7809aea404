//! Error types for Tidemark.
//!
//! Errors are grouped by subsystem and classified by how the daemon reacts
//! to them:
//!
//! - **Transient** store failures (connectivity, timeouts) are retried with
//!   bounded exponential backoff and only escalate once retries exhaust.
//! - **Conflicts** on the progress record are not errors at all; they are a
//!   [`CommitOutcome`](crate::progress::CommitOutcome) variant that tells the
//!   agent to reload progress and discard its in-flight batch.
//! - **Projection faults** are fatal to the owning shard only; other shards
//!   keep advancing.
//! - **Configuration faults** (unknown shard or database) fail the request
//!   before any agent starts.

use crate::types::{DatabaseName, Sequence, ShardName};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the event log boundary.
#[derive(Debug, Clone, Error)]
pub enum EventLogError {
    /// The connection to the backing store failed.
    #[error("Event log connection failed: {0}")]
    ConnectionFailed(String),

    /// A fetch did not complete within its deadline.
    #[error("Event log fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected the request for a non-transient reason.
    #[error("Event log request failed: {0}")]
    Storage(String),
}

impl EventLogError {
    /// Whether the agent should retry this failure with backoff rather than
    /// transition to `Errored`.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Timeout(_))
    }
}

/// Errors raised by the progress store.
#[derive(Debug, Clone, Error)]
pub enum ProgressStoreError {
    /// The connection to the backing store failed.
    #[error("Progress store connection failed: {0}")]
    ConnectionFailed(String),

    /// A load or commit did not complete within its deadline.
    #[error("Progress store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transaction carrying the progress update was rolled back.
    #[error("Progress transaction rolled back: {0}")]
    TransactionRollback(String),

    /// The store rejected the request for a non-transient reason.
    #[error("Progress store request failed: {0}")]
    Storage(String),
}

impl ProgressStoreError {
    /// Whether the agent should retry this failure with backoff rather than
    /// transition to `Errored`.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Timeout(_))
    }
}

/// Errors raised while applying events to projection logic.
///
/// These are fatal to the shard that raised them: the agent stops advancing,
/// preserves its last committed progress and surfaces the error through the
/// coordinator's status query. They are never retried, since a deterministic
/// projection will fail the same way on every attempt.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// The projection failed to apply a specific event.
    #[error("Failed to apply event {sequence}: {reason}")]
    EventApplicationFailed {
        /// The global sequence of the offending event.
        sequence: Sequence,
        /// The reason reported by the projection.
        reason: String,
    },

    /// The event payload could not be interpreted by the projection.
    #[error("Malformed payload for event {sequence}: {reason}")]
    MalformedPayload {
        /// The global sequence of the offending event.
        sequence: Sequence,
        /// What went wrong while decoding.
        reason: String,
    },
}

/// Errors surfaced by the coordinator and host boundary.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The request named a shard that is not configured on this daemon.
    #[error("Unknown shard: '{0}'")]
    UnknownShard(ShardName),

    /// The request named a database the host does not serve.
    #[error("Unknown projection database: '{0}'")]
    UnknownDatabase(DatabaseName),

    /// The shard already has a running agent.
    #[error("Shard '{0}' is already running")]
    AlreadyRunning(ShardName),

    /// A shard's retry budget for transient store failures was exhausted.
    #[error("Shard '{shard}' exhausted {attempts} retries: {cause}")]
    RetriesExhausted {
        /// The shard that gave up.
        shard: ShardName,
        /// How many attempts were made.
        attempts: u32,
        /// The final transient failure.
        cause: String,
    },

    /// A projection fault stopped the shard.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// A non-transient event log failure stopped the shard.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// A non-transient progress store failure stopped the shard.
    #[error(transparent)]
    ProgressStore(#[from] ProgressStoreError),

    /// The daemon is shutting down and cannot accept the request.
    #[error("Daemon is shutting down")]
    ShuttingDown,

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result alias for event log operations.
pub type EventLogResult<T> = Result<T, EventLogError>;

/// Result alias for progress store operations.
pub type ProgressStoreResult<T> = Result<T, ProgressStoreError>;

/// Result alias for projection application.
pub type ProjectionResult<T> = Result<T, ProjectionError>;

/// Result alias for coordinator and host operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
