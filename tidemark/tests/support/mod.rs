//! Shared fixtures for the daemon integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark::errors::{ProjectionError, ProjectionResult};
use tidemark::event::Event;
use tidemark::progress::MaterializationBatch;
use tidemark::projection::Projection;
use tidemark::types::{CollectionName, EventTypeName, ProjectionName, ShardName};

/// A projection that records every applied sequence and materializes one
/// document per event (id = global sequence, body = payload).
///
/// Optionally poisoned: applying an event of `fail_on` type raises a fault,
/// which must stop only the owning shard.
pub struct RecordingProjection {
    name: ProjectionName,
    collection: CollectionName,
    observed: Arc<Mutex<Vec<u64>>>,
    fail_on: Option<EventTypeName>,
}

impl RecordingProjection {
    pub fn new(name: &str, collection: &str) -> Self {
        Self {
            name: ProjectionName::try_new(name).unwrap(),
            collection: CollectionName::try_new(collection).unwrap(),
            observed: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
        }
    }

    pub fn failing_on(mut self, type_name: &str) -> Self {
        self.fail_on = Some(EventTypeName::try_new(type_name).unwrap());
        self
    }

    /// Handle to the sequences applied so far, shared across restarts.
    pub fn observed(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.observed)
    }

    /// Reuses an observation log from a previous agent incarnation.
    pub fn with_observed(mut self, observed: Arc<Mutex<Vec<u64>>>) -> Self {
        self.observed = observed;
        self
    }

    pub fn collection_name(&self) -> CollectionName {
        self.collection.clone()
    }
}

#[async_trait]
impl Projection for RecordingProjection {
    fn name(&self) -> &ProjectionName {
        &self.name
    }

    fn collections(&self) -> Vec<CollectionName> {
        vec![self.collection.clone()]
    }

    async fn apply(
        &self,
        event: &Event,
        batch: &mut MaterializationBatch,
    ) -> ProjectionResult<()> {
        if self.fail_on.as_ref() == Some(&event.type_name) {
            return Err(ProjectionError::EventApplicationFailed {
                sequence: event.sequence,
                reason: format!("cannot apply '{}'", event.type_name),
            });
        }
        self.observed
            .lock()
            .expect("observer lock poisoned")
            .push(event.sequence.get());
        batch.upsert(
            self.collection.clone(),
            event.sequence.to_string(),
            event.payload.clone(),
        );
        Ok(())
    }
}

/// Installs a tracing subscriber for debugging test runs. Respects
/// `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn shard_name(name: &str) -> ShardName {
    ShardName::try_new(name).unwrap()
}

pub fn event_type(name: &str) -> EventTypeName {
    EventTypeName::try_new(name).unwrap()
}

/// Polls `condition` every 10ms until it holds or ~2s elapse.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Snapshot of the observed sequence list.
pub fn observed_snapshot(observed: &Arc<Mutex<Vec<u64>>>) -> Vec<u64> {
    observed.lock().expect("observer lock poisoned").clone()
}
