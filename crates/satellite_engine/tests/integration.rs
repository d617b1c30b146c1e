//! Integration tests for the satellite against the reference service.

use satellite_engine::{
    BackoffConfig, ChangeOrigin, ConnectionState, Satellite, SatelliteError, SatelliteStatus,
    StaticMigrator,
};
use satellite_protocol::{
    Change, ChangeOp, CausalityTag, HelloAck, Message, MigrationRecord, ProtocolVersion,
    ReplicaId, WireTransaction,
};
use satellite_storage::{
    row, ColumnType, InMemoryAdapter, Row, SqlValue, Statement, TableDescriptor,
};
use satellite_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// A service that already published the `items` migration.
fn service() -> ReferenceService {
    init_tracing();
    let service = ReferenceService::new();
    service.publish_migration(items_migration());
    service
}

fn notes_migration(version: u64) -> MigrationRecord {
    MigrationRecord::new(
        version,
        vec![Statement::create_table(
            TableDescriptor::builder(format!("notes_v{version}"))
                .column("id", ColumnType::Integer)
                .column("body", ColumnType::Text)
                .primary_key(["id"])
                .build()
                .unwrap(),
        )],
    )
}

fn remote_txn(
    replica: &str,
    counter: u64,
    timestamp: u64,
    seq: u64,
    (op, id, values): (ChangeOp, i64, Row),
) -> WireTransaction {
    WireTransaction {
        tag: CausalityTag::new(replica, counter),
        timestamp,
        observed: 0,
        commit_seq: None,
        changes: vec![Change {
            seq,
            table: "items".into(),
            op,
            pk: item_key(id),
            values,
        }],
    }
}

#[tokio::test]
async fn two_satellites_converge() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();
    let b = TestSatellite::open(&service, "b").await.unwrap();
    a.satellite.start().unwrap();
    b.satellite.start().unwrap();
    assert!(a.wait_until_active().await);
    assert!(b.wait_until_active().await);

    // Insert on a, see it on b
    a.insert_item(1, "pen", 3).await.unwrap();
    assert!(b.wait_for_items(&[item(1, "pen", 3)]).await);

    // Update on b, see it on a
    b.update_item(1, row([("qty", SqlValue::from(5))])).await.unwrap();
    assert!(a.wait_for_items(&[item(1, "pen", 5)]).await);

    // Delete on a, gone on b
    a.delete_item(1).await.unwrap();
    assert!(b.wait_for_items(&[]).await);

    assert!(a.wait_until_drained().await);
    assert!(b.wait_until_drained().await);
    assert_eq!(service.transactions().len(), 3);

    a.satellite.stop().await;
    b.satellite.stop().await;
    assert_eq!(a.satellite.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_resends_unacknowledged_entries_in_order() {
    let service = service();
    let config = fast_config("a").with_ack_timeout(Duration::from_secs(30));
    let a = TestSatellite::open_with(&service, config, InMemoryAdapter::new(), items_migrator())
        .await
        .unwrap();
    let replica = ReplicaId::new("a");
    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);

    // Entries 1-4 are acknowledged and purged
    for id in 1..=4 {
        a.insert_item(id, "pen", id).await.unwrap();
    }
    assert!(a.wait_until_drained().await);
    assert_eq!(service.received_seq(&replica), 4);

    // Entries 5-7 reach the service but are never acknowledged
    service.hold_acks(true);
    for id in 5..=7 {
        a.insert_item(id, "pen", id).await.unwrap();
    }
    assert!(wait_until(WAIT_TIMEOUT, || service.received_seq(&replica) == 7).await);
    assert_eq!(a.oplog_seqs().await.unwrap(), vec![5, 6, 7]);

    // The session drops; the next one resends 5, 6, 7 in order
    service.drop_connections();
    assert!(wait_until(WAIT_TIMEOUT, || service.received_seqs(&replica).len() >= 10).await);
    let seqs = service.received_seqs(&replica);
    assert_eq!(&seqs[..10], &[1, 2, 3, 4, 5, 6, 7, 5, 6, 7]);
    assert_eq!(a.oplog_seqs().await.unwrap(), vec![5, 6, 7]);

    // Entries leave the oplog only after the ack
    service.hold_acks(false);
    assert!(a.wait_until_drained().await);
    assert_eq!(service.transactions().len(), 7);
    assert!(a.satellite.stats().reconnects >= 1);

    a.satellite.stop().await;
}

#[tokio::test]
async fn lost_cursor_resubscribes_from_the_start() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();
    let b = TestSatellite::open(&service, "b").await.unwrap();
    a.satellite.start().unwrap();
    b.satellite.start().unwrap();
    assert!(a.wait_until_active().await);
    assert!(b.wait_until_active().await);

    b.insert_item(1, "pen", 1).await.unwrap();
    b.insert_item(2, "ink", 2).await.unwrap();
    assert!(a.wait_for_items(&[item(1, "pen", 1), item(2, "ink", 2)]).await);
    assert_eq!(a.satellite.server_cursor().await.unwrap(), 2);

    // a goes away while b keeps writing and the service forgets old history
    a.satellite.stop().await;
    b.insert_item(3, "cap", 3).await.unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || service.head() == 3).await);
    service.forget_history(3);

    a.satellite.start().unwrap();
    assert!(
        a.wait_for_items(&[item(1, "pen", 1), item(2, "ink", 2), item(3, "cap", 3)])
            .await
    );
    assert_eq!(a.satellite.server_cursor().await.unwrap(), 3);
    assert_eq!(a.satellite.stats().changes_stale, 2);

    a.satellite.stop().await;
    b.satellite.stop().await;
}

#[tokio::test]
async fn outbound_depth_pauses_transmission_until_acked() {
    let service = service();
    let config = fast_config("a")
        .with_max_outbound_depth(2)
        .with_batch_size(10)
        .with_ack_timeout(Duration::from_secs(30));
    let a = TestSatellite::open_with(&service, config, InMemoryAdapter::new(), items_migrator())
        .await
        .unwrap();
    let replica = ReplicaId::new("a");
    service.hold_acks(true);
    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);

    for id in 1..=5 {
        a.insert_item(id, "pen", id).await.unwrap();
    }
    assert!(wait_until(WAIT_TIMEOUT, || service.received_seq(&replica) == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.received_seqs(&replica), vec![1, 2]);

    service.hold_acks(false);
    assert!(a.wait_until_drained().await);
    assert_eq!(service.received_seqs(&replica), vec![1, 2, 3, 4, 5]);

    a.satellite.stop().await;
}

#[tokio::test]
async fn schema_gap_stops_sync_without_applying_anything() {
    let service = service();
    service.publish_migration(notes_migration(2));
    service.set_schema_version(4);

    // Version 3 is missing from the local migrator
    let migrator = Arc::new(StaticMigrator::new([
        items_migration(),
        notes_migration(2),
        notes_migration(4),
    ]));
    let a = TestSatellite::open_with(&service, fast_config("a"), InMemoryAdapter::new(), migrator)
        .await
        .unwrap();
    assert_eq!(a.satellite.schema_version().await.unwrap(), 2);

    a.satellite.start().unwrap();
    let status = a
        .wait_for_status(|s| matches!(s, SatelliteStatus::Error(_)))
        .await
        .unwrap();
    assert_eq!(
        status.error(),
        Some(&SatelliteError::SchemaGap {
            local: 2,
            remote: 4,
            missing: 3
        })
    );

    assert_eq!(a.satellite.schema_version().await.unwrap(), 2);
    assert!(a.satellite.tables().iter().all(|t| t.name != "notes_v4"));
    assert!(wait_until(WAIT_TIMEOUT, || !a.satellite.is_running()).await);
}

#[tokio::test]
async fn schema_catch_up_and_inline_migrations() {
    let service = service();
    service.publish_migration(notes_migration(2));

    // The satellite only knows version 1 locally but can fetch version 2
    let migrator = Arc::new(StaticMigrator::new([items_migration()]));
    let a = TestSatellite::open_with(
        &service,
        fast_config("a"),
        InMemoryAdapter::new(),
        Arc::clone(&migrator),
    )
    .await
    .unwrap();
    migrator.add(notes_migration(2));
    assert_eq!(a.satellite.schema_version().await.unwrap(), 1);

    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);
    assert_eq!(a.satellite.schema_version().await.unwrap(), 2);

    // A migration pushed while active is applied in place
    service.publish_migration(notes_migration(3));
    let satellite = &a.satellite;
    assert!(
        eventually(WAIT_TIMEOUT, move || async move {
            satellite.schema_version().await.unwrap() == 3
        })
        .await
    );
    assert!(a.satellite.tables().iter().any(|t| t.name == "notes_v3"));
    assert_eq!(a.satellite.connection_state(), ConnectionState::Active);

    a.satellite.stop().await;
}

#[tokio::test]
async fn incompatible_protocol_is_fatal() {
    init_tracing();
    let service = ReferenceService::with_version(ProtocolVersion::new(2, 0));
    service.publish_migration(items_migration());
    let a = TestSatellite::open(&service, "a").await.unwrap();

    a.satellite.start().unwrap();
    let status = a
        .wait_for_status(|s| matches!(s, SatelliteStatus::Error(_)))
        .await
        .unwrap();
    assert!(matches!(
        status.error(),
        Some(SatelliteError::IncompatibleProtocol { .. })
    ));
    assert!(wait_until(WAIT_TIMEOUT, || !a.satellite.is_running()).await);
    assert_eq!(service.connection_count(), 1);
}

#[tokio::test]
async fn refused_connections_back_off_and_recover() {
    let service = service();
    service.set_accepting(false);
    let a = TestSatellite::open(&service, "a").await.unwrap();
    a.insert_item(1, "pen", 1).await.unwrap();

    a.satellite.start().unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || a.connector.attempts() >= 3).await);
    assert!(matches!(
        a.satellite.status(),
        SatelliteStatus::Connecting | SatelliteStatus::Disconnected
    ));

    // Writes made offline go out once the service is back
    service.set_accepting(true);
    assert!(a.wait_until_active().await);
    assert!(a.wait_until_drained().await);
    assert_eq!(service.transactions().len(), 1);

    a.satellite.stop().await;
}

#[tokio::test]
async fn violation_budget_exhaustion_stops_sync() {
    let service = service();
    let config = fast_config("a")
        .with_violation_budget(1)
        .with_backoff(BackoffConfig::testing().with_stability_threshold(Duration::from_secs(60)));
    let a = TestSatellite::open_with(&service, config, InMemoryAdapter::new(), items_migrator())
        .await
        .unwrap();
    let replica = ReplicaId::new("a");
    let bogus = Message::HelloAck(HelloAck {
        server_version: ProtocolVersion::CURRENT,
        assigned_watermark: 1,
    });

    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);

    // First violation: reconnect
    service.send_to(&replica, bogus.clone());
    assert!(wait_until(WAIT_TIMEOUT, || a.satellite.stats().protocol_violations == 1).await);
    assert!(
        wait_until(WAIT_TIMEOUT, || service.connection_count() >= 2
            && a.satellite.connection_state().is_active())
        .await
    );

    // Second violation: over budget
    service.send_to(&replica, bogus);
    let status = a
        .wait_for_status(|s| matches!(s, SatelliteStatus::Error(_)))
        .await
        .unwrap();
    assert!(matches!(
        status.error(),
        Some(SatelliteError::ProtocolViolation(_))
    ));
    assert_eq!(a.satellite.stats().protocol_violations, 2);
}

#[tokio::test]
async fn replayed_transactions_are_no_ops() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();
    let replica = ReplicaId::new("a");
    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);

    let txn = remote_txn(
        "z",
        1,
        5_000,
        1,
        (ChangeOp::Insert, 1, row([("name", SqlValue::from("pen")), ("qty", SqlValue::from(1))])),
    );
    assert_eq!(service.inject_transaction(&ReplicaId::new("z"), txn.clone()), Some(1));
    assert!(a.wait_for_items(&[item(1, "pen", 1)]).await);
    assert!(wait_until(WAIT_TIMEOUT, || a.satellite.stats().transactions_received == 1).await);
    let shadow = a.satellite.shadow_row("items", &item_key(1)).await.unwrap();

    // Same commit sequence with a different payload: skipped by cursor
    let mut replay = txn.clone();
    replay.commit_seq = Some(1);
    replay.changes[0].values = row([("name", SqlValue::from("evil"))]);
    service.send_to(&replica, Message::Transaction(replay));

    // Same transaction under a new commit sequence: merges to nothing
    let mut again = txn;
    again.commit_seq = Some(2);
    service.send_to(&replica, Message::Transaction(again));

    let satellite = &a.satellite;
    assert!(
        eventually(WAIT_TIMEOUT, move || async move {
            satellite.server_cursor().await.unwrap() == 2
        })
        .await
    );
    assert_eq!(a.items().await.unwrap(), vec![item(1, "pen", 1)]);
    assert_eq!(a.satellite.shadow_row("items", &item_key(1)).await.unwrap(), shadow);
    assert_eq!(a.satellite.stats().changes_stale, 1);

    a.satellite.stop().await;
}

#[tokio::test]
async fn delete_update_race_resolves_by_stamp() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();
    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);

    // Local insert at t=1000
    a.insert_item(1, "pen", 3).await.unwrap();
    assert!(a.wait_until_drained().await);

    // Remote delete at t=2000 wins
    service.inject_transaction(
        &ReplicaId::new("z"),
        remote_txn("z", 1, 2_000, 1, (ChangeOp::Delete, 1, Row::new())),
    );
    assert!(a.wait_for_items(&[]).await);

    // A concurrent update older than the delete stays dead
    service.inject_transaction(
        &ReplicaId::new("y"),
        remote_txn("y", 1, 1_500, 1, (ChangeOp::Update, 1, row([("qty", SqlValue::from(9))]))),
    );
    // An update newer than the delete resurrects the row with its columns only
    service.inject_transaction(
        &ReplicaId::new("y"),
        remote_txn("y", 2, 3_000, 2, (ChangeOp::Update, 1, row([("name", SqlValue::from("ink"))]))),
    );

    let resurrected = row([
        ("id", SqlValue::from(1)),
        ("name", SqlValue::from("ink")),
        ("qty", SqlValue::Null),
    ]);
    assert!(a.wait_for_items(&[resurrected]).await);
    let stats = a.satellite.stats();
    assert_eq!(stats.changes_stale, 0);
    assert_eq!(stats.conflicts_resolved, 1);
    assert_eq!(stats.rows_resurrected, 1);

    let shadow = a
        .satellite
        .shadow_row("items", &item_key(1))
        .await
        .unwrap()
        .unwrap();
    assert!(shadow.is_live());
    assert_eq!(shadow.tombstone.unwrap().timestamp, 2_000);

    a.satellite.stop().await;
}

#[tokio::test]
async fn remote_changes_reach_listeners() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();
    let b = TestSatellite::open(&service, "b").await.unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    b.satellite.on_change(move |n| sink.lock().push(n.clone()));

    a.satellite.start().unwrap();
    b.satellite.start().unwrap();
    assert!(a.wait_until_active().await);
    assert!(b.wait_until_active().await);

    a.insert_item(7, "pen", 1).await.unwrap();
    assert!(b.wait_for_items(&[item(7, "pen", 1)]).await);
    assert!(wait_until(WAIT_TIMEOUT, || !seen.lock().is_empty()).await);

    let notification = seen.lock()[0].clone();
    assert_eq!(notification.origin, ChangeOrigin::Remote);
    assert_eq!(notification.rows.len(), 1);
    assert_eq!(notification.rows[0].table, "items");
    assert_eq!(notification.rows[0].pk, item_key(7));

    a.satellite.stop().await;
    b.satellite.stop().await;
}

#[tokio::test]
async fn causality_counters_survive_restart() {
    let service = service();
    let storage = InMemoryAdapter::new();
    let a = TestSatellite::open_with(&service, fast_config("a"), storage.clone(), items_migrator())
        .await
        .unwrap();
    a.insert_item(1, "pen", 1).await.unwrap();
    a.insert_item(2, "ink", 2).await.unwrap();
    let before = a.satellite.oplog().all_entries().await.unwrap();
    drop(a);

    // Reopen on the same store with a clock that went backwards
    let a = TestSatellite::open_with(&service, fast_config("a"), storage, items_migrator())
        .await
        .unwrap();
    a.clock.set(10);
    a.insert_item(3, "cap", 3).await.unwrap();
    let after = a.satellite.oplog().all_entries().await.unwrap();

    assert_eq!(after.len(), 3);
    let counters: Vec<u64> = after.iter().map(|e| e.stamp.tag.counter).collect();
    assert_eq!(counters, vec![1, 2, 3]);
    assert!(after[2].stamp.timestamp > before[1].stamp.timestamp);
    assert_eq!(a.satellite.schema_version().await.unwrap(), 1);
    assert_eq!(a.items().await.unwrap().len(), 3);
}

#[tokio::test]
async fn storage_failure_during_apply_stops_sync() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();
    a.satellite.start().unwrap();
    assert!(a.wait_until_active().await);

    a.storage.set_available(false);
    service.inject_transaction(
        &ReplicaId::new("z"),
        remote_txn("z", 1, 5_000, 1, (ChangeOp::Insert, 1, row([("name", SqlValue::from("pen"))]))),
    );

    let status = a
        .wait_for_status(|s| matches!(s, SatelliteStatus::Error(_)))
        .await
        .unwrap();
    assert!(matches!(
        status.error(),
        Some(SatelliteError::StorageUnavailable(_))
    ));

    // Nothing half-applied once the store is back
    a.storage.set_available(true);
    assert!(a.items().await.unwrap().is_empty());
    assert_eq!(a.satellite.server_cursor().await.unwrap(), 0);
}

#[tokio::test]
async fn local_writes_fail_cleanly_while_storage_is_down() {
    let service = service();
    let a = TestSatellite::open(&service, "a").await.unwrap();

    a.storage.set_available(false);
    let err = a.insert_item(1, "pen", 1).await.unwrap_err();
    assert!(matches!(err, SatelliteError::StorageUnavailable(_)));

    a.storage.set_available(true);
    assert!(a.items().await.unwrap().is_empty());
    assert!(a.oplog_seqs().await.unwrap().is_empty());

    a.insert_item(1, "pen", 1).await.unwrap();
    let entries = a.satellite.oplog().all_entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stamp.tag.counter, 1);
}

#[tokio::test]
async fn peer_that_stops_reading_cannot_stall_the_session() {
    init_tracing();
    let connector = Arc::new(StalledConnector::new(1, 256));
    // Liveness alone would take a minute; only the write timeout can end the session
    let config = fast_config("a").with_liveness(Duration::from_millis(200), Duration::from_secs(60));
    let satellite = Satellite::open(
        config,
        Arc::new(InMemoryAdapter::new()),
        Arc::clone(&connector) as _,
        items_migrator(),
    )
    .await
    .unwrap();
    satellite.start().unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || satellite.connection_state().is_active()).await);

    // Fill the pipe
    for id in 1..=50 {
        let mut tx = satellite.begin().await.unwrap();
        tx.insert("items", item(id, "pen", id)).await.unwrap();
        tx.commit().await.unwrap();
    }

    // The blocked write ends the session and the driver reconnects
    assert!(wait_until(WAIT_TIMEOUT, || connector.attempts() >= 2).await);
    let stats = satellite.stats();
    assert!(stats.reconnects >= 1);
    assert!(stats
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("write timed out")));

    let stopped = tokio::time::timeout(Duration::from_secs(3), satellite.stop()).await;
    assert!(stopped.is_ok());
    assert_eq!(satellite.status(), SatelliteStatus::Disconnected);
}
