//! `Tidemark` - asynchronous projection daemon for event-sourced stores.
//!
//! Tidemark incrementally and continuously transforms an append-only,
//! globally-ordered event log into materialized read models, and supports
//! full, from-scratch rebuilds on demand. Each event is applied exactly once
//! per projection shard: progress is committed in the same transaction as
//! the projection's own writes, so a process restart never reprocesses or
//! skips events. Shards run concurrently and independently, and a failure in
//! one shard's logic never stops the others.
//!
//! The moving parts, leaves first:
//!
//! - [`event::EventLog`] — the append-only, globally-sequenced log.
//! - [`progress::ProgressStore`] — durable per-shard high-water marks,
//!   committed atomically with materialized writes.
//! - [`projection::Projection`] — pure, replay-safe fold of events into
//!   declared writes.
//! - [`agent::ShardAgent`] — one worker per shard: catch-up, live tailing,
//!   gap handling, bounded retry.
//! - [`daemon::ProjectionDaemon`] — starts, rebuilds, pauses and stops the
//!   agents of one database.
//! - [`host::ProjectionHost`] — the boundary a hosting process drives the
//!   daemon through.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod event;
pub mod host;
pub mod progress;
pub mod projection;
pub mod shard;
pub mod types;

pub use agent::{AgentControl, RunTarget, ShardAgent};
pub use config::{DaemonConfig, RetryConfig};
pub use daemon::{ProjectionDaemon, RebuildOutcome};
pub use errors::{
    DaemonError, DaemonResult, EventLogError, EventLogResult, ProgressStoreError,
    ProgressStoreResult, ProjectionError, ProjectionResult,
};
pub use event::{Event, EventFilter, EventLog};
pub use host::{DaemonHost, ProjectionHost};
pub use progress::{
    CommitOutcome, MaterializationBatch, MaterializationOp, ProcessingMode, ProgressRecord,
    ProgressStore,
};
pub use projection::Projection;
pub use shard::{ShardDefinition, ShardState, ShardStatus, ShardStatusReport};
pub use types::{
    CollectionName, DatabaseName, EventTypeName, ProjectionName, Sequence, ShardName, Timestamp,
};
