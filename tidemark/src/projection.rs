//! The projection application contract.
//!
//! A projection is pure logic: given one event and the batch being built,
//! declare the materialized writes that event implies. The shard agent
//! depends only on this capability, never on concrete projection types, and
//! guarantees ordered, at-most-once delivery per shard.
//!
//! Projections must be deterministic and side-effect-free beyond their
//! declared writes — replay safety is the basis for rebuild correctness:
//! applying the same event stream twice from scratch must produce identical
//! materialized state. Whether a projection is stateless-per-event or folds
//! over a stream's full history is invisible to the agent.

use crate::errors::ProjectionResult;
use crate::event::Event;
use crate::progress::MaterializationBatch;
use crate::types::{CollectionName, ProjectionName};
use async_trait::async_trait;

/// Object-safe capability implemented by every projection.
#[async_trait]
pub trait Projection: Send + Sync {
    /// The projection's stable identity.
    fn name(&self) -> &ProjectionName;

    /// The collections this projection materializes into. Rebuilds truncate
    /// exactly these before replaying from zero.
    fn collections(&self) -> Vec<CollectionName>;

    /// Applies one event, appending the implied writes to `batch`.
    ///
    /// # Errors
    ///
    /// Returning an error is fatal to the owning shard: the agent stops
    /// advancing and surfaces the fault to the coordinator. A projection
    /// that cannot interpret a payload should return
    /// [`ProjectionError::MalformedPayload`](crate::errors::ProjectionError::MalformedPayload).
    async fn apply(&self, event: &Event, batch: &mut MaterializationBatch)
        -> ProjectionResult<()>;
}
