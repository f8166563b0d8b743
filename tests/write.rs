//! Integration tests for single event writes.

mod common;

use common::{Account, AccountEvent, account_id, builder, deposit, memory, withdraw};
use strata::{
    Options, StorageError, WriteError,
    publish::{PublishOptions, PublishRoutes},
    shard::SingleShard,
    snapshot::{SnapshotPolicy, SnapshotStore, inmemory::Store as SnapshotMemory},
    store::{EventLog, inmemory},
};
use strata_core::test::{
    CountingLog, FailingLog, FailingPublisher, RecordingPublisher, SnapshotFault,
    UnreliableSnapshots, by_topic,
};

// ============================================================================
// Versioning
// ============================================================================

#[tokio::test]
async fn version_counts_applied_events() {
    let (log, snapshots) = memory();
    let entity = builder(log.clone(), snapshots)
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    for amount in [10, 20, 30] {
        assert!(entity.write(deposit(amount), false).await.unwrap());
    }

    let state = entity.state().await;
    assert_eq!(state.version(), 3);
    assert_eq!(state.state().balance, 60);

    let location = entity.coordinator().event_location().clone();
    let stored = log.load_after(&location, &account_id(), 0).await.unwrap();
    let versions: Vec<_> = stored.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn sequential_writes_on_fresh_entity_end_at_version_two() {
    let (log, snapshots) = memory();
    let entity = builder(log, snapshots)
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    assert!(entity.write(deposit(5), false).await.unwrap());
    assert!(entity.write(withdraw(2), false).await.unwrap());

    let state = entity.state().await;
    assert_eq!(state.version(), 2);
    assert_eq!(state.state().balance, 3);
}

#[tokio::test]
async fn taken_version_returns_false_and_keeps_state() {
    let (log, snapshots) = memory();
    let first = builder(log.clone(), snapshots.clone())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();
    // Activated before `first` writes, so it still believes version 0.
    let stale = builder(log.clone(), snapshots)
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    assert!(first.write(deposit(10), false).await.unwrap());
    assert!(!stale.write(deposit(99), false).await.unwrap());

    let state = stale.state().await;
    assert_eq!(state.version(), 0);
    assert_eq!(state.state().balance, 0);

    let location = first.coordinator().event_location().clone();
    assert_eq!(
        log.latest_version(&location, &account_id()).await.unwrap(),
        Some(1)
    );
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn untyped_event_is_rejected_before_io() {
    let log = CountingLog::new(inmemory::Log::new());
    let entity = builder(log.clone(), SnapshotMemory::new())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();
    let before = log.total();

    let err = entity
        .write(AccountEvent::Untyped, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::InvalidArgument(_)));
    assert_eq!(log.total(), before);
}

#[tokio::test]
async fn storage_failure_propagates_without_applying() {
    let log = FailingLog::new(inmemory::Log::new());
    let entity = builder(log.clone(), SnapshotMemory::new())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    log.set_failing(true);
    let err = entity.write(deposit(1), false).await.unwrap_err();
    assert!(matches!(err, WriteError::Storage(_)));
    assert_eq!(entity.version().await, 0);
    assert!(!entity.is_blocked());

    log.set_failing(false);
    assert!(entity.write(deposit(1), false).await.unwrap());
    assert_eq!(entity.version().await, 1);
}

#[tokio::test]
async fn blocked_entity_fails_fast_without_io() {
    let log = CountingLog::new(inmemory::Log::new());
    let entity = builder(log.clone(), SnapshotMemory::new())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    // Stored, then refused by `apply`: log and state now disagree.
    let err = entity.write(withdraw(50), false).await.unwrap_err();
    assert!(matches!(err, WriteError::Apply { version: 1, .. }));
    assert!(entity.is_blocked());
    assert_eq!(log.appends(), 1);

    let io_before = log.total();
    let err = entity.write(deposit(100), false).await.unwrap_err();
    assert!(matches!(
        err,
        WriteError::Blocked {
            requested: 1,
            stored: 0,
            ..
        }
    ));
    let err = entity.concurrent_write(deposit(100), false).await.unwrap_err();
    assert!(err.is_blocked());
    assert_eq!(log.total(), io_before);
    assert_eq!(entity.version().await, 0);
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn publish_uses_override_or_default_route() {
    let (log, snapshots) = memory();
    let bus = RecordingPublisher::new();
    let routes = PublishRoutes::to(PublishOptions::new("accounts", "nats"))
        .with_override("account.withdrawn", PublishOptions::new("withdrawals", "kafka"));
    let entity = builder(log, snapshots)
        .with_publisher(bus.clone(), routes)
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    entity.write(deposit(10), true).await.unwrap();
    entity.write(withdraw(4), true).await.unwrap();
    entity.write(deposit(1), false).await.unwrap();

    let published = bus.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].provider, "kafka");
    let topics = by_topic(&published);
    assert_eq!(topics["accounts"], vec![1]);
    assert_eq!(topics["withdrawals"], vec![2]);
}

#[tokio::test]
async fn publish_failure_does_not_fail_write() {
    let (log, snapshots) = memory();
    let bus = FailingPublisher::new();
    let entity = builder(log, snapshots)
        .with_publisher(bus.clone(), PublishRoutes::to(PublishOptions::new("accounts", "nats")))
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    assert!(entity.write(deposit(10), true).await.unwrap());
    assert_eq!(bus.attempts(), 1);
    assert_eq!(entity.version().await, 1);
}

#[tokio::test]
async fn conflicting_write_publishes_nothing() {
    let (log, snapshots) = memory();
    let bus = RecordingPublisher::new();
    let routes = PublishRoutes::to(PublishOptions::new("accounts", "nats"));
    let first = builder(log.clone(), snapshots.clone())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();
    let stale = builder(log, snapshots)
        .with_publisher(bus.clone(), routes)
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    first.write(deposit(1), false).await.unwrap();
    assert!(!stale.write(deposit(1), true).await.unwrap());
    assert!(bus.published().is_empty());
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn synchronous_policy_snapshots_every_write() {
    let (log, snapshots) = memory();
    let entity = builder(log, snapshots.clone())
        .with_options(common::synchronous())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    entity.write(deposit(7), false).await.unwrap();
    let location = entity.coordinator().snapshot_location().clone();
    let snapshot = snapshots
        .load(&location, &account_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 1);

    entity.write(deposit(7), false).await.unwrap();
    let snapshot = snapshots
        .load(&location, &account_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 2);
}

#[tokio::test]
async fn synchronous_snapshot_failure_fails_write_but_keeps_event() {
    let log = inmemory::Log::new();
    let snapshots = UnreliableSnapshots::new(SnapshotFault::Fail);
    let entity = builder(log.clone(), snapshots.clone())
        .with_options(common::synchronous())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    let err = entity.write(deposit(1), false).await.unwrap_err();
    assert!(matches!(err, WriteError::Storage(StorageError::Snapshot(_))));
    assert_eq!(snapshots.attempts(), 1);

    // The event was committed before the snapshot was attempted.
    assert_eq!(entity.version().await, 1);
    assert!(!entity.is_blocked());
    let location = entity.coordinator().event_location().clone();
    assert_eq!(
        log.latest_version(&location, &account_id()).await.unwrap(),
        Some(1)
    );

    // Still unsnapshotted, so the next write retries the checkpoint.
    entity.write(deposit(1), false).await.unwrap_err();
    assert_eq!(snapshots.attempts(), 2);
}

#[tokio::test]
async fn periodic_policy_waits_for_threshold() {
    let (log, snapshots) = memory();
    let entity = builder(log, snapshots.clone())
        .with_options(Options::default().with_snapshot(SnapshotPolicy::Periodic { every: 3 }))
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();
    let location = entity.coordinator().snapshot_location().clone();

    entity.write(deposit(1), false).await.unwrap();
    entity.write(deposit(1), false).await.unwrap();
    assert!(snapshots.load(&location, &account_id()).await.unwrap().is_none());

    entity.write(deposit(1), false).await.unwrap();
    let snapshot = snapshots.load(&location, &account_id()).await.unwrap();
    assert_eq!(snapshot.map(|s| s.version), Some(3));
}

#[tokio::test]
async fn deactivation_policy_does_not_snapshot_on_write() {
    let (log, snapshots) = memory();
    let entity = builder(log, snapshots.clone())
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();

    entity.write(deposit(1), false).await.unwrap();
    assert!(snapshots.is_empty());

    entity.deactivate().await.unwrap();
    assert_eq!(snapshots.len(), 1);
}

#[tokio::test]
async fn state_is_account_projection() {
    let (log, snapshots) = memory();
    let entity = builder(log, snapshots)
        .activate(account_id(), &SingleShard)
        .await
        .unwrap();
    entity.write(deposit(3), false).await.unwrap();
    entity.write(AccountEvent::Closed, false).await.unwrap();

    let state = entity.state().await;
    assert_eq!(
        state.state(),
        &Account {
            balance: 3,
            closed: true
        }
    );
}
