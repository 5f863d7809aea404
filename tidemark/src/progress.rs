//! Progress store protocol.
//!
//! Every shard owns one durable [`ProgressRecord`]: the high-water mark of
//! the most recently committed application, persisted *in the same
//! transaction* as the projection's own materialized writes. A crash can
//! therefore never leave progress and materialized state inconsistent with
//! each other, and restart recovery is a single `load`.
//!
//! The persisted fields (shard name, last sequence, mode) are the sole
//! recovery anchor after restart and must remain stable across versions.

use crate::errors::ProgressStoreResult;
use crate::types::{CollectionName, Sequence, ShardName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How a shard's agent is currently processing the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// Replaying from zero toward a fixed target tail.
    Rebuilding,
    /// Ongoing catch-up and live tailing.
    Continuous,
}

/// Durable per-shard high-water-mark record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// The shard this record belongs to.
    pub shard_name: ShardName,
    /// Sequence of the most recently fully committed application.
    pub last_sequence_applied: Sequence,
    /// The mode the shard was last committed under.
    pub mode: ProcessingMode,
}

impl ProgressRecord {
    /// The starting record for a shard with no persisted progress.
    pub const fn initial(shard_name: ShardName, mode: ProcessingMode) -> Self {
        Self {
            shard_name,
            last_sequence_applied: Sequence::ZERO,
            mode,
        }
    }
}

/// One materialized write declared by a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializationOp {
    /// Insert or replace a document.
    Upsert {
        /// Target collection.
        collection: CollectionName,
        /// Document identifier within the collection.
        id: String,
        /// The document body.
        body: serde_json::Value,
    },
    /// Remove a document if present.
    Delete {
        /// Target collection.
        collection: CollectionName,
        /// Document identifier within the collection.
        id: String,
    },
}

/// The set of materialized writes produced by applying a batch of events.
///
/// Projections append operations here instead of touching storage directly;
/// the progress store lands the whole batch atomically with the new
/// high-water mark. Replay safety follows: the batch is pure data, so
/// applying the same events twice from scratch produces the same batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationBatch {
    ops: Vec<MaterializationOp>,
}

impl MaterializationBatch {
    /// Creates an empty batch.
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Declares an upsert of `body` at `id` in `collection`.
    pub fn upsert(
        &mut self,
        collection: CollectionName,
        id: impl Into<String>,
        body: serde_json::Value,
    ) {
        self.ops.push(MaterializationOp::Upsert {
            collection,
            id: id.into(),
            body,
        });
    }

    /// Declares a delete of `id` in `collection`.
    pub fn delete(&mut self, collection: CollectionName, id: impl Into<String>) {
        self.ops.push(MaterializationOp::Delete {
            collection,
            id: id.into(),
        });
    }

    /// Returns the declared operations in declaration order.
    pub fn ops(&self) -> &[MaterializationOp] {
        &self.ops
    }

    /// Whether the batch declares no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of declared operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Result of attempting to commit progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The writes and the new high-water mark landed atomically.
    Committed,
    /// Another writer already advanced this shard past the offered
    /// sequence. The caller must reload progress and discard its in-flight
    /// batch rather than retry blindly.
    Conflict,
}

/// Port trait for the durable progress store.
///
/// The progress row for a given shard is exclusively mutated by that shard's
/// active agent; the optimistic conflict check guards against a stale or
/// duplicate agent left over from an ungraceful restart. The store, not
/// in-process locking, is the authority on the last committed sequence.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Loads the progress record for a shard, or `None` if the shard has
    /// never committed (it then starts at sequence 0).
    async fn load(&self, shard: &ShardName) -> ProgressStoreResult<Option<ProgressRecord>>;

    /// Atomically applies `batch` and advances the shard's high-water mark
    /// to `new_sequence` — either both land or neither does.
    ///
    /// Returns [`CommitOutcome::Conflict`] without applying anything when
    /// the stored mark is already at or past `new_sequence`.
    async fn commit(
        &self,
        shard: &ShardName,
        new_sequence: Sequence,
        mode: ProcessingMode,
        batch: MaterializationBatch,
    ) -> ProgressStoreResult<CommitOutcome>;

    /// Resets a shard for rebuild: zeroes its progress record and truncates
    /// the given collections, atomically.
    async fn reset(
        &self,
        shard: &ShardName,
        collections: &[CollectionName],
    ) -> ProgressStoreResult<()>;
}
