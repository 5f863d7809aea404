//! Out-of-order commit visibility: the agent holds at sequence holes until
//! the writer lands, and only skips after the configured gap timeout.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{eventually, event_type, observed_snapshot, shard_name, RecordingProjection};
use tidemark::config::DaemonConfig;
use tidemark::daemon::ProjectionDaemon;
use tidemark::event::EventFilter;
use tidemark::shard::ShardDefinition;
use tidemark::types::Sequence;
use tidemark_memory::{InMemoryEventLog, InMemoryProgressStore};
use uuid::Uuid;

fn gap_config(gap_timeout: Duration) -> DaemonConfig {
    support::init_tracing();
    DaemonConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_batch_size(10)
        .with_gap_timeout(gap_timeout)
}

fn setup(
    log: &Arc<InMemoryEventLog>,
    store: &Arc<InMemoryProgressStore>,
    config: DaemonConfig,
) -> (ProjectionDaemon, Arc<std::sync::Mutex<Vec<u64>>>) {
    let projection = Arc::new(RecordingProjection::new("ledger", "ledger_docs"));
    let observed = projection.observed();
    let mut daemon = ProjectionDaemon::new(log.clone(), store.clone(), config);
    daemon.register_shard(ShardDefinition::new(
        shard_name("ledger:all"),
        projection,
        EventFilter::All,
    ));
    (daemon, observed)
}

#[tokio::test]
async fn agent_holds_at_gap_until_pending_writer_commits() {
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryProgressStore::new());
    let shard = shard_name("ledger:all");

    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    // Sequence 3 is allocated but its writer has not committed yet.
    let pending = log.reserve();
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));

    // Generous timeout: the gap must not be skipped in this test.
    let (daemon, observed) = setup(&log, &store, gap_config(Duration::from_secs(30)));
    daemon.start_shards(&[shard.clone()]).await.unwrap();

    assert!(eventually(|| observed_snapshot(&observed) == vec![1, 2]).await);
    // The agent holds position: 4 and 5 are visible but must not apply.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(observed_snapshot(&observed), vec![1, 2]);
    assert_eq!(
        store.record(&shard).unwrap().last_sequence_applied,
        Sequence::new(2)
    );

    // The slow writer lands within the timeout.
    log.commit_reserved(
        pending,
        Uuid::now_v7(),
        event_type("Deposited"),
        serde_json::json!({}),
    );

    assert!(eventually(|| observed_snapshot(&observed) == vec![1, 2, 3, 4, 5]).await);
    assert_eq!(
        store.record(&shard).unwrap().last_sequence_applied,
        Sequence::new(5)
    );
    daemon.shutdown().await;
}

#[tokio::test]
async fn persistent_gap_is_skipped_after_timeout() {
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryProgressStore::new());
    let shard = shard_name("ledger:all");

    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    // Sequence 3's writer rolled back; the reservation is abandoned.
    drop(log.reserve());
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));

    let (daemon, observed) = setup(&log, &store, gap_config(Duration::from_millis(100)));
    daemon.start_shards(&[shard.clone()]).await.unwrap();

    // After the timeout the agent records the skip and moves on.
    assert!(eventually(|| observed_snapshot(&observed) == vec![1, 2, 4, 5]).await);
    assert_eq!(
        store.record(&shard).unwrap().last_sequence_applied,
        Sequence::new(5)
    );
    daemon.shutdown().await;
}

#[tokio::test]
async fn gap_in_live_mode_resolves_in_order() {
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryProgressStore::new());
    let shard = shard_name("ledger:all");

    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));

    let (daemon, observed) = setup(&log, &store, gap_config(Duration::from_secs(30)));
    daemon.start_shards(&[shard.clone()]).await.unwrap();
    assert!(eventually(|| observed_snapshot(&observed) == vec![1]).await);

    // While live: 2 is reserved, 3 commits first.
    let pending = log.reserve();
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(observed_snapshot(&observed), vec![1]);

    log.commit_reserved(
        pending,
        Uuid::now_v7(),
        event_type("Deposited"),
        serde_json::json!({}),
    );
    assert!(eventually(|| observed_snapshot(&observed) == vec![1, 2, 3]).await);
    daemon.shutdown().await;
}
