//! Host boundary: store enumeration, routing to the right daemon, rebuild
//! outcome aggregation and process-level exit signalling.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{eventually, event_type, observed_snapshot, shard_name, RecordingProjection};
use tidemark::config::DaemonConfig;
use tidemark::daemon::{ProjectionDaemon, RebuildOutcome};
use tidemark::errors::DaemonError;
use tidemark::event::EventFilter;
use tidemark::host::{DaemonHost, ProjectionHost};
use tidemark::shard::{ShardDefinition, ShardStatus};
use tidemark::types::DatabaseName;
use tidemark_memory::{InMemoryEventLog, InMemoryProgressStore};
use uuid::Uuid;

fn database(name: &str) -> DatabaseName {
    DatabaseName::try_new(name).unwrap()
}

fn fast_config() -> DaemonConfig {
    support::init_tracing();
    DaemonConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_batch_size(5)
}

struct Fixture {
    log: Arc<InMemoryEventLog>,
    daemon: Arc<ProjectionDaemon>,
    observed: Arc<std::sync::Mutex<Vec<u64>>>,
}

fn fixture(shard: &str, filter: EventFilter) -> Fixture {
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryProgressStore::new());
    let projection = Arc::new(RecordingProjection::new("ledger", "ledger_docs"));
    let observed = projection.observed();
    let mut daemon = ProjectionDaemon::new(log.clone(), store, fast_config());
    daemon.register_shard(ShardDefinition::new(shard_name(shard), projection, filter));
    Fixture {
        log,
        daemon: Arc::new(daemon),
        observed,
    }
}

#[tokio::test]
async fn all_stores_enumerates_registered_databases_in_order() {
    let mut host = DaemonHost::new();
    host.add_store(database("tenant-b"), fixture("ledger:all", EventFilter::All).daemon);
    host.add_store(database("tenant-a"), fixture("ledger:all", EventFilter::All).daemon);

    assert_eq!(
        host.all_stores(),
        vec![database("tenant-a"), database("tenant-b")]
    );
}

#[tokio::test]
async fn start_shards_routes_to_the_named_database_only() {
    let tenant_a = fixture("ledger:all", EventFilter::All);
    let tenant_b = fixture("ledger:all", EventFilter::All);
    tenant_a.log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    tenant_b.log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));

    let mut host = DaemonHost::new();
    host.add_store(database("tenant-a"), tenant_a.daemon.clone());
    host.add_store(database("tenant-b"), tenant_b.daemon.clone());

    host.start_shards(&database("tenant-a"), &[shard_name("ledger:all")])
        .await
        .unwrap();

    assert!(eventually(|| observed_snapshot(&tenant_a.observed) == vec![1]).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(observed_snapshot(&tenant_b.observed).is_empty());

    host.request_shutdown().await;
}

#[tokio::test]
async fn unknown_database_is_a_configuration_fault() {
    let host = DaemonHost::new();
    let result = host
        .start_shards(&database("missing"), &[shard_name("ledger:all")])
        .await;
    assert!(matches!(
        result,
        Err(DaemonError::UnknownDatabase(name)) if name == database("missing")
    ));
}

#[tokio::test]
async fn try_rebuild_reports_no_data_only_when_every_shard_is_empty() {
    let db = database("tenant-a");

    // All shards empty: the aggregate is NoData.
    let empty = fixture("ledger:all", EventFilter::All);
    let mut host = DaemonHost::new();
    host.add_store(db.clone(), empty.daemon.clone());
    let outcome = host
        .try_rebuild_shards(&db, &[shard_name("ledger:all")])
        .await
        .unwrap();
    assert_eq!(outcome, RebuildOutcome::NoData);

    // Mixed: one shard has data, one matches nothing. Aggregate is Complete.
    let log = Arc::new(InMemoryEventLog::new());
    let store = Arc::new(InMemoryProgressStore::new());
    log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));

    let mut daemon = ProjectionDaemon::new(log.clone(), store, fast_config());
    daemon.register_shard(ShardDefinition::new(
        shard_name("deposits:all"),
        Arc::new(RecordingProjection::new("deposits", "deposit_docs")),
        EventFilter::All,
    ));
    daemon.register_shard(ShardDefinition::new(
        shard_name("withdrawals:all"),
        Arc::new(RecordingProjection::new("withdrawals", "withdrawal_docs")),
        EventFilter::event_types(vec![event_type("Withdrawn")]),
    ));

    let db_mixed = database("tenant-b");
    host.add_store(db_mixed.clone(), Arc::new(daemon));
    let outcome = host
        .try_rebuild_shards(
            &db_mixed,
            &[shard_name("deposits:all"), shard_name("withdrawals:all")],
        )
        .await
        .unwrap();
    assert_eq!(outcome, RebuildOutcome::Complete);
}

#[tokio::test]
async fn request_shutdown_stops_every_daemon_and_releases_waiters() {
    let tenant_a = fixture("ledger:all", EventFilter::All);
    let tenant_b = fixture("ledger:all", EventFilter::All);
    tenant_a.log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));
    tenant_b.log.append(Uuid::now_v7(), event_type("Deposited"), serde_json::json!({}));

    let mut host = DaemonHost::new();
    host.add_store(database("tenant-a"), tenant_a.daemon.clone());
    host.add_store(database("tenant-b"), tenant_b.daemon.clone());
    let host = Arc::new(host);

    host.start_shards(&database("tenant-a"), &[shard_name("ledger:all")])
        .await
        .unwrap();
    host.start_shards(&database("tenant-b"), &[shard_name("ledger:all")])
        .await
        .unwrap();
    assert!(eventually(|| observed_snapshot(&tenant_a.observed) == vec![1]).await);
    assert!(eventually(|| observed_snapshot(&tenant_b.observed) == vec![1]).await);

    let waiter = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.wait_for_exit().await })
    };

    host.request_shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait_for_exit did not release after shutdown")
        .unwrap();

    for db in [database("tenant-a"), database("tenant-b")] {
        let reports = host.status(&db).await.unwrap();
        assert!(reports.iter().all(|r| r.status == ShardStatus::Stopped));
    }
}

#[tokio::test]
async fn wait_for_exit_returns_immediately_after_shutdown() {
    let host = DaemonHost::new();
    host.request_shutdown().await;
    // Subscribing after the signal still observes it.
    tokio::time::timeout(Duration::from_secs(1), host.wait_for_exit())
        .await
        .expect("wait_for_exit should observe a prior shutdown");
}
