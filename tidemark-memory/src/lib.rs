//! In-memory adapters for the `tidemark` projection daemon.
//!
//! This crate provides in-memory implementations of the `EventLog` and
//! `ProgressStore` traits, useful for testing and development scenarios
//! where persistence is not required.
//!
//! The event log supports out-of-order commit visibility: a writer can
//! reserve a sequence number and commit the event later (or never), which
//! is how real transactional stores expose temporary gaps to tailing
//! readers. Tests use this to exercise the daemon's gap-timeout policy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tidemark::errors::{EventLogError, EventLogResult, ProgressStoreError, ProgressStoreResult};
use tidemark::event::{Event, EventFilter, EventLog};
use tidemark::progress::{
    CommitOutcome, MaterializationBatch, MaterializationOp, ProcessingMode, ProgressRecord,
    ProgressStore,
};
use tidemark::types::{CollectionName, EventTypeName, Sequence, ShardName, Timestamp};
use uuid::Uuid;

/// A planned run of injected failures, for exercising retry behaviour.
#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    remaining: usize,
    transient: bool,
}

#[derive(Debug, Default)]
struct LogInner {
    committed: BTreeMap<Sequence, Event>,
    stream_versions: HashMap<Uuid, u64>,
    next_sequence: u64,
    fetch_failures: Option<FailurePlan>,
}

impl LogInner {
    fn allocate(&mut self) -> Sequence {
        self.next_sequence += 1;
        Sequence::new(self.next_sequence)
    }

    fn commit(&mut self, sequence: Sequence, stream_id: Uuid, type_name: EventTypeName, payload: serde_json::Value) -> Event {
        let version = self.stream_versions.entry(stream_id).or_insert(0);
        *version += 1;
        let event = Event {
            sequence,
            stream_id,
            stream_version: *version,
            type_name,
            payload,
            timestamp: Timestamp::now(),
        };
        self.committed.insert(sequence, event.clone());
        event
    }
}

/// A sequence number allocated but not yet committed.
///
/// Committing it later makes the event visible out of allocation order;
/// dropping it without committing leaves a permanent gap in the log.
#[derive(Debug)]
pub struct SequenceReservation {
    sequence: Sequence,
}

impl SequenceReservation {
    /// The reserved sequence number.
    pub const fn sequence(&self) -> Sequence {
        self.sequence
    }
}

/// Thread-safe in-memory event log for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    inner: Arc<RwLock<LogInner>>,
}

impl InMemoryEventLog {
    /// Creates a new empty in-memory event log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event, allocating and committing its sequence at once.
    pub fn append(
        &self,
        stream_id: Uuid,
        type_name: EventTypeName,
        payload: serde_json::Value,
    ) -> Event {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        let sequence = inner.allocate();
        inner.commit(sequence, stream_id, type_name, payload)
    }

    /// Allocates a sequence without committing an event for it.
    pub fn reserve(&self) -> SequenceReservation {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        SequenceReservation {
            sequence: inner.allocate(),
        }
    }

    /// Commits an event under a previously reserved sequence.
    pub fn commit_reserved(
        &self,
        reservation: SequenceReservation,
        stream_id: Uuid,
        type_name: EventTypeName,
        payload: serde_json::Value,
    ) -> Event {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        inner.commit(reservation.sequence, stream_id, type_name, payload)
    }

    /// Makes the next `count` fetches fail; transient failures report as
    /// connection errors, non-transient ones as storage errors.
    pub fn inject_fetch_failures(&self, count: usize, transient: bool) {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        inner.fetch_failures = Some(FailurePlan {
            remaining: count,
            transient,
        });
    }

    /// Number of committed events.
    pub fn len(&self) -> usize {
        self.inner.read().expect("RwLock poisoned").committed.len()
    }

    /// Whether the log has no committed events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn fetch_after(&self, after: Sequence, limit: usize) -> EventLogResult<Vec<Event>> {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        if let Some(plan) = inner.fetch_failures.as_mut() {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                let transient = plan.transient;
                if plan.remaining == 0 {
                    inner.fetch_failures = None;
                }
                return Err(if transient {
                    EventLogError::ConnectionFailed("injected connection failure".to_string())
                } else {
                    EventLogError::Storage("injected storage failure".to_string())
                });
            }
        }
        Ok(inner
            .committed
            .range(after.next()..)
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn tail_sequence(&self) -> EventLogResult<Sequence> {
        let inner = self.inner.read().expect("RwLock poisoned");
        Ok(inner
            .committed
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Sequence::ZERO))
    }

    async fn any_matching(&self, filter: &EventFilter) -> EventLogResult<bool> {
        let inner = self.inner.read().expect("RwLock poisoned");
        Ok(inner.committed.values().any(|event| filter.matches(event)))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    progress: HashMap<ShardName, ProgressRecord>,
    collections: HashMap<CollectionName, BTreeMap<String, serde_json::Value>>,
    commit_failures: Option<FailurePlan>,
}

/// Thread-safe in-memory progress store for testing.
///
/// Progress records and materialized documents live under one lock, so a
/// commit lands the writes and the new high-water mark atomically, exactly
/// as a transactional store would.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgressStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryProgressStore {
    /// Creates a new empty in-memory progress store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a materialized document, if present.
    pub fn document(&self, collection: &CollectionName, id: &str) -> Option<serde_json::Value> {
        let inner = self.inner.read().expect("RwLock poisoned");
        inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    /// Returns a snapshot of a whole collection.
    pub fn collection(&self, collection: &CollectionName) -> BTreeMap<String, serde_json::Value> {
        let inner = self.inner.read().expect("RwLock poisoned");
        inner
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the stored progress record for a shard.
    pub fn record(&self, shard: &ShardName) -> Option<ProgressRecord> {
        let inner = self.inner.read().expect("RwLock poisoned");
        inner.progress.get(shard).cloned()
    }

    /// Overwrites a shard's progress record, simulating a competing agent
    /// advancing the shard behind this process's back.
    pub fn force_record(&self, record: ProgressRecord) {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        inner.progress.insert(record.shard_name.clone(), record);
    }

    /// Makes the next `count` commits fail; transient failures report as
    /// timeouts, non-transient ones as rollbacks.
    pub fn inject_commit_failures(&self, count: usize, transient: bool) {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        inner.commit_failures = Some(FailurePlan {
            remaining: count,
            transient,
        });
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn load(&self, shard: &ShardName) -> ProgressStoreResult<Option<ProgressRecord>> {
        let inner = self.inner.read().expect("RwLock poisoned");
        Ok(inner.progress.get(shard).cloned())
    }

    async fn commit(
        &self,
        shard: &ShardName,
        new_sequence: Sequence,
        mode: ProcessingMode,
        batch: MaterializationBatch,
    ) -> ProgressStoreResult<CommitOutcome> {
        let mut inner = self.inner.write().expect("RwLock poisoned");

        if let Some(plan) = inner.commit_failures.as_mut() {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                let transient = plan.transient;
                if plan.remaining == 0 {
                    inner.commit_failures = None;
                }
                return Err(if transient {
                    ProgressStoreError::Timeout(Duration::from_millis(1))
                } else {
                    ProgressStoreError::TransactionRollback(
                        "injected rollback".to_string(),
                    )
                });
            }
        }

        if let Some(existing) = inner.progress.get(shard) {
            if existing.last_sequence_applied >= new_sequence {
                return Ok(CommitOutcome::Conflict);
            }
        }

        for op in batch.ops() {
            match op {
                MaterializationOp::Upsert {
                    collection,
                    id,
                    body,
                } => {
                    inner
                        .collections
                        .entry(collection.clone())
                        .or_default()
                        .insert(id.clone(), body.clone());
                }
                MaterializationOp::Delete { collection, id } => {
                    if let Some(docs) = inner.collections.get_mut(collection) {
                        docs.remove(id);
                    }
                }
            }
        }

        inner.progress.insert(
            shard.clone(),
            ProgressRecord {
                shard_name: shard.clone(),
                last_sequence_applied: new_sequence,
                mode,
            },
        );
        Ok(CommitOutcome::Committed)
    }

    async fn reset(
        &self,
        shard: &ShardName,
        collections: &[CollectionName],
    ) -> ProgressStoreResult<()> {
        let mut inner = self.inner.write().expect("RwLock poisoned");
        inner.progress.insert(
            shard.clone(),
            ProgressRecord::initial(shard.clone(), ProcessingMode::Rebuilding),
        );
        for collection in collections {
            inner.collections.remove(collection);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn type_name(name: &str) -> EventTypeName {
        EventTypeName::try_new(name).unwrap()
    }

    #[tokio::test]
    async fn fetch_after_returns_events_in_sequence_order() {
        let log = InMemoryEventLog::new();
        for i in 0..5 {
            log.append(Uuid::now_v7(), type_name("Ping"), serde_json::json!({ "i": i }));
        }

        let events = tokio_test::assert_ok!(log.fetch_after(Sequence::new(2), 10).await);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence.get()).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn reserved_sequences_are_invisible_until_committed() {
        let log = InMemoryEventLog::new();
        log.append(Uuid::now_v7(), type_name("Ping"), serde_json::json!({}));
        let reservation = log.reserve();
        log.append(Uuid::now_v7(), type_name("Ping"), serde_json::json!({}));

        let visible = log.fetch_after(Sequence::ZERO, 10).await.unwrap();
        let sequences: Vec<u64> = visible.iter().map(|e| e.sequence.get()).collect();
        assert_eq!(sequences, vec![1, 3]);

        log.commit_reserved(reservation, Uuid::now_v7(), type_name("Ping"), serde_json::json!({}));
        let visible = log.fetch_after(Sequence::ZERO, 10).await.unwrap();
        assert_eq!(visible.len(), 3);
    }

    #[tokio::test]
    async fn commit_is_atomic_and_conflicts_on_stale_sequence() {
        let store = InMemoryProgressStore::new();
        let shard = ShardName::try_new("s").unwrap();
        let accounts = CollectionName::try_new("accounts").unwrap();

        let mut batch = MaterializationBatch::new();
        batch.upsert(accounts.clone(), "a-1", serde_json::json!({ "balance": 5 }));
        let outcome = store
            .commit(&shard, Sequence::new(3), ProcessingMode::Continuous, batch)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);

        // A stale writer offering an older sequence must not land anything.
        let mut stale = MaterializationBatch::new();
        stale.upsert(accounts.clone(), "a-1", serde_json::json!({ "balance": 1 }));
        let outcome = store
            .commit(&shard, Sequence::new(2), ProcessingMode::Continuous, stale)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
        assert_eq!(
            store.document(&accounts, "a-1"),
            Some(serde_json::json!({ "balance": 5 }))
        );
    }

    #[tokio::test]
    async fn reset_zeroes_progress_and_truncates_collections() {
        let store = InMemoryProgressStore::new();
        let shard = ShardName::try_new("s").unwrap();
        let accounts = CollectionName::try_new("accounts").unwrap();

        let mut batch = MaterializationBatch::new();
        batch.upsert(accounts.clone(), "a-1", serde_json::json!({}));
        store
            .commit(&shard, Sequence::new(1), ProcessingMode::Continuous, batch)
            .await
            .unwrap();

        tokio_test::assert_ok!(store.reset(&shard, &[accounts.clone()]).await);
        assert!(store.collection(&accounts).is_empty());
        let record = store.record(&shard).unwrap();
        assert_eq!(record.last_sequence_applied, Sequence::ZERO);
        assert_eq!(record.mode, ProcessingMode::Rebuilding);
    }
}
