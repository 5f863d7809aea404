//! Event log abstraction.
//!
//! The event log is an external collaborator: an append-only sequence of
//! events, each assigned a strictly increasing global sequence number at
//! commit time. This module defines the immutable [`Event`] record, the
//! [`EventFilter`] describing which events a shard consumes, and the
//! [`EventLog`] port trait that adapters implement.
//!
//! Fetches are deliberately *unfiltered*: concurrent writers can commit out
//! of sequence-allocation order, so a shard agent must see raw sequence
//! numbering to distinguish "this sequence is allocated but not yet visible"
//! from "this event simply does not match my filter". Filtering happens at
//! application time inside the agent.

use crate::errors::EventLogResult;
use crate::types::{EventTypeName, Sequence, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// An immutable event as committed to the log.
///
/// The global sequence is assigned once, is monotonic and is never reused;
/// it is the sole ordering key for projection purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Global, strictly increasing position in the log.
    pub sequence: Sequence,
    /// The stream this event belongs to.
    pub stream_id: Uuid,
    /// The version of this event within its stream.
    pub stream_version: u64,
    /// The event's type name, matched against shard filters.
    pub type_name: EventTypeName,
    /// The event payload.
    pub payload: serde_json::Value,
    /// When this event was committed.
    pub timestamp: Timestamp,
}

/// Describes which events a shard consumes.
///
/// A shard is often scoped to the whole event space, sometimes to a set of
/// event types. The filter never affects the shard's position in the log —
/// only which fetched events reach the projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    /// Consume every event in the log.
    All,
    /// Consume only events whose type name is in the set.
    EventTypes(BTreeSet<EventTypeName>),
}

impl EventFilter {
    /// Builds a filter over the given event type names.
    pub fn event_types<I>(types: I) -> Self
    where
        I: IntoIterator<Item = EventTypeName>,
    {
        Self::EventTypes(types.into_iter().collect())
    }

    /// Whether the given event passes this filter.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::EventTypes(types) => types.contains(&event.type_name),
        }
    }
}

/// Port trait for the append-only event log.
///
/// Implementations must return events in ascending sequence order and must
/// never return an event more than once for the same `after` argument. They
/// may expose gaps: a sequence visible in one fetch with its predecessor
/// missing means the predecessor's writer has not committed yet (or never
/// will). Gap policy belongs to the shard agent, not the log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Fetches up to `limit` events with sequence strictly greater than
    /// `after`, in ascending sequence order.
    async fn fetch_after(&self, after: Sequence, limit: usize) -> EventLogResult<Vec<Event>>;

    /// Returns the highest committed sequence, or [`Sequence::ZERO`] for an
    /// empty log. Used to fix the target of a rebuild at its start.
    async fn tail_sequence(&self) -> EventLogResult<Sequence>;

    /// Whether any committed event matches the filter. Used by rebuilds to
    /// report `NoData` without touching progress or materialized state.
    async fn any_matching(&self, filter: &EventFilter) -> EventLogResult<bool>;
}
