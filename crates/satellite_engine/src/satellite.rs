//! The satellite process.
//!
//! [`Satellite`] composes oplog capture, the connection state machine and
//! conflict resolution over one local store. Applications write through
//! [`LocalTransaction`], which records every row change in the oplog and
//! the shadow tables inside the same storage transaction as the write.

use crate::applier::merge_change;
use crate::clock::{Clock, SystemClock};
use crate::config::SatelliteConfig;
use crate::connection::{stopped, ConnectionDriver, Signals};
use crate::context::{SchemaRegistry, SyncContext};
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::{MetaStore, SyncMeta, INTERNAL_PREFIX};
use crate::migration::{MigrationCoordinator, Migrator};
use crate::notifier::{ChangeNotification, ChangeOrigin, ChangedRow, ListenerId};
use crate::oplog::OplogStore;
use crate::shadow::{ShadowRow, ShadowStore};
use crate::state::{ConnectionState, SatelliteStatus, SyncStats};
use crate::tagger::CausalityTagger;
use crate::transport::Connector;
use parking_lot::Mutex;
use satellite_protocol::{Change, ChangeOp, ReplicaId, VersionStamp};
use satellite_storage::{
    Condition, Query, Row, Statement, StorageAdapter, TableDescriptor, Transaction,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Running {
    stop: watch::Sender<bool>,
    driver: JoinHandle<()>,
    gc: JoinHandle<()>,
}

/// A local replica kept in sync with the replication service.
pub struct Satellite {
    ctx: Arc<SyncContext>,
    storage: Arc<dyn StorageAdapter>,
    connector: Arc<dyn Connector>,
    oplog: OplogStore,
    tagger: CausalityTagger,
    migrations: MigrationCoordinator,
    signals: Arc<Signals>,
    running: Mutex<Option<Running>>,
}

impl Satellite {
    /// Opens a satellite over `storage`.
    ///
    /// Creates the sync tables on first use, restores the tracked-table
    /// registry, and applies any pending migrations the migrator holds.
    /// Does not connect; call [`Satellite::start`].
    pub async fn open(
        config: SatelliteConfig,
        storage: Arc<dyn StorageAdapter>,
        connector: Arc<dyn Connector>,
        migrator: Arc<dyn Migrator>,
    ) -> SatelliteResult<Self> {
        Self::open_with_clock(config, storage, connector, migrator, Arc::new(SystemClock)).await
    }

    /// Opens a satellite with an explicit wall clock.
    pub async fn open_with_clock(
        config: SatelliteConfig,
        storage: Arc<dyn StorageAdapter>,
        connector: Arc<dyn Connector>,
        migrator: Arc<dyn Migrator>,
        clock: Arc<dyn Clock>,
    ) -> SatelliteResult<Self> {
        let mut tx = storage.begin().await?;
        let meta = MetaStore::ensure(tx.as_mut(), config.replica_id.as_ref()).await?;
        OplogStore::ensure(tx.as_mut()).await?;
        let tables = MetaStore::tracked_tables(tx.as_mut()).await?;
        for table in &tables {
            ShadowStore::create(tx.as_mut(), table).await?;
        }
        tx.commit().await?;

        let ctx = Arc::new(SyncContext::new(
            config,
            meta.replica_id.clone(),
            clock,
            migrator,
            SchemaRegistry::from_tables(tables),
        ));
        let migrations = MigrationCoordinator::new(Arc::clone(&storage), Arc::clone(&ctx));
        let schema_version = migrations.apply_pending(meta.schema_version).await?;

        info!(
            replica = %meta.replica_id,
            schema_version,
            cursor = meta.server_cursor,
            tables = ctx.registry().len(),
            "satellite opened"
        );

        Ok(Self {
            oplog: OplogStore::new(Arc::clone(&storage)),
            tagger: CausalityTagger::new(Arc::clone(&ctx)),
            migrations,
            signals: Arc::new(Signals::new()),
            running: Mutex::new(None),
            ctx,
            storage,
            connector,
        })
    }

    /// Starts syncing in the background.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SatelliteError::AlreadyStarted`] if sync is running.
    pub fn start(&self) -> SatelliteResult<()> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.driver.is_finished() {
                return Err(SatelliteError::AlreadyStarted);
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let driver = ConnectionDriver::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.storage),
            Arc::clone(&self.connector),
            Arc::clone(&self.signals),
            stop_rx.clone(),
        );
        let driver = tokio::spawn(driver.run());
        let gc = tokio::spawn(gc_loop(
            Arc::clone(&self.storage),
            Arc::clone(&self.ctx),
            stop_rx,
        ));
        *running = Some(Running { stop, driver, gc });
        debug!(replica = %self.ctx.replica_id, "sync started");
        Ok(())
    }

    /// Stops syncing.
    ///
    /// The current frame completes, the transport closes, and no further
    /// reconnects are attempted. Unacknowledged changes stay in the oplog.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.driver.await {
            warn!(error = %e, "connection task ended abnormally");
        }
        running.gc.abort();
        debug!(replica = %self.ctx.replica_id, "sync stopped");
    }

    /// Returns true while the background sync task runs.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.driver.is_finished())
    }

    /// Begins a local transaction.
    pub async fn begin(&self) -> SatelliteResult<LocalTransaction<'_>> {
        let tx = self.storage.begin().await?;
        Ok(LocalTransaction {
            satellite: self,
            tx,
            stamp: None,
            changed: Vec::new(),
            failed: None,
        })
    }

    /// Registers a change listener.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        self.ctx.notifier.subscribe(listener)
    }

    /// Removes a change listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.ctx.notifier.unsubscribe(id)
    }

    /// Connectivity as seen by the application.
    pub fn status(&self) -> SatelliteStatus {
        self.signals.status.borrow().clone()
    }

    /// Watches [`Satellite::status`].
    pub fn watch_status(&self) -> watch::Receiver<SatelliteStatus> {
        self.signals.status.subscribe()
    }

    /// Fine-grained connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.signals.state.borrow()
    }

    /// Watches [`Satellite::connection_state`].
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.signals.state.subscribe()
    }

    /// Sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.ctx.stats()
    }

    /// This replica's identity.
    pub fn replica_id(&self) -> &ReplicaId {
        &self.ctx.replica_id
    }

    /// The configuration the satellite was opened with.
    pub fn config(&self) -> &SatelliteConfig {
        &self.ctx.config
    }

    /// Persisted sync metadata.
    pub async fn meta(&self) -> SatelliteResult<SyncMeta> {
        let mut tx = self.storage.begin().await?;
        MetaStore::load(tx.as_mut()).await
    }

    /// Local schema watermark.
    pub async fn schema_version(&self) -> SatelliteResult<u64> {
        Ok(self.meta().await?.schema_version)
    }

    /// Last service cursor applied locally.
    pub async fn server_cursor(&self) -> SatelliteResult<u64> {
        Ok(self.meta().await?.server_cursor)
    }

    /// The oplog.
    pub fn oplog(&self) -> &OplogStore {
        &self.oplog
    }

    /// The causality tagger.
    pub fn tagger(&self) -> &CausalityTagger {
        &self.tagger
    }

    /// The migration coordinator.
    pub fn migrations(&self) -> &MigrationCoordinator {
        &self.migrations
    }

    /// Applies migrations the migrator has gained since open.
    pub async fn apply_migrations(&self) -> SatelliteResult<u64> {
        let current = self.schema_version().await?;
        self.migrations.apply_pending(current).await
    }

    /// Descriptors of the tracked tables.
    pub fn tables(&self) -> Vec<TableDescriptor> {
        self.ctx.registry().tables().cloned().collect()
    }

    /// Reads user rows outside any transaction.
    pub async fn read(&self, query: &Query) -> SatelliteResult<Vec<Row>> {
        reject_internal(&query.table)?;
        Ok(self.storage.read(query).await?)
    }

    /// The merge baseline of one row, if known.
    pub async fn shadow_row(&self, table: &str, pk: &Row) -> SatelliteResult<Option<ShadowRow>> {
        let descriptor = self.ctx.table(table)?;
        let mut tx = self.storage.begin().await?;
        ShadowStore::load(tx.as_mut(), &descriptor, pk).await
    }

    /// Deletes dead shadow rows older than the tombstone retention window.
    pub async fn collect_garbage(&self) -> SatelliteResult<u64> {
        collect_garbage(&self.storage, &self.ctx).await
    }
}

impl Drop for Satellite {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.stop.send(true);
            running.gc.abort();
        }
    }
}

impl std::fmt::Debug for Satellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Satellite")
            .field("replica_id", &self.ctx.replica_id)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

fn reject_internal(table: &str) -> SatelliteResult<()> {
    if table.starts_with(INTERNAL_PREFIX) {
        return Err(SatelliteError::UnknownTable(table.to_string()));
    }
    Ok(())
}

async fn collect_garbage(
    storage: &Arc<dyn StorageAdapter>,
    ctx: &SyncContext,
) -> SatelliteResult<u64> {
    let retention = u64::try_from(ctx.config.tombstone_retention.as_millis()).unwrap_or(u64::MAX);
    let cutoff = ctx.now_millis().saturating_sub(retention);
    let mut collected = 0;
    let mut tx = storage.begin().await?;
    for table in ctx.registry().tables() {
        collected += ShadowStore::collect(tx.as_mut(), table, cutoff).await?;
    }
    tx.commit().await?;
    if collected > 0 {
        ctx.record(|s| s.tombstones_collected += collected);
        info!(collected, cutoff, "collected tombstones");
    }
    Ok(collected)
}

async fn gc_loop(
    storage: Arc<dyn StorageAdapter>,
    ctx: Arc<SyncContext>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => return,
            _ = tokio::time::sleep(ctx.config.gc_interval) => {
                if let Err(e) = collect_garbage(&storage, &ctx).await {
                    warn!(error = %e, "tombstone collection failed");
                }
            }
        }
    }
}

/// A local read-write transaction.
///
/// Every write is captured in the oplog and shadow tables within the same
/// storage transaction. Dropping without [`LocalTransaction::commit`] rolls
/// everything back.
pub struct LocalTransaction<'a> {
    satellite: &'a Satellite,
    tx: Box<dyn Transaction>,
    stamp: Option<VersionStamp>,
    changed: Vec<ChangedRow>,
    failed: Option<SatelliteError>,
}

impl LocalTransaction<'_> {
    /// Inserts a row into a tracked table.
    ///
    /// # Errors
    ///
    /// Fails on unknown columns, a missing key, or a duplicate key.
    pub async fn insert(&mut self, table: &str, row: Row) -> SatelliteResult<()> {
        let descriptor = self.satellite.ctx.table(table)?;
        if let Some(column) = descriptor.unknown_column(&row) {
            return Err(invalid_row(table, format!("unknown column {column}")));
        }
        let pk = descriptor
            .key_of(&row)
            .map_err(|e| invalid_row(table, e.to_string()))?;

        self.tx.execute(&Statement::insert(table, row.clone())).await?;
        let values: Row = descriptor
            .complete_row(&row)
            .into_iter()
            .filter(|(column, _)| !descriptor.is_key_column(column))
            .collect();
        self.capture(&descriptor, ChangeOp::Insert, pk, values).await
    }

    /// Updates columns of the row with primary key `pk`.
    ///
    /// # Errors
    ///
    /// Returns [`SatelliteError::RowNotFound`] if no such row exists and
    /// [`SatelliteError::InvalidRow`] if `set` names key or unknown columns.
    pub async fn update(&mut self, table: &str, pk: Row, set: Row) -> SatelliteResult<()> {
        let descriptor = self.satellite.ctx.table(table)?;
        let pk = descriptor
            .key_of(&pk)
            .map_err(|e| invalid_row(table, e.to_string()))?;
        if let Some(column) = descriptor.unknown_column(&set) {
            return Err(invalid_row(table, format!("unknown column {column}")));
        }
        if let Some(column) = set.keys().find(|c| descriptor.is_key_column(c)) {
            return Err(invalid_row(
                table,
                format!("primary key column {column} cannot be updated"),
            ));
        }
        if set.is_empty() {
            return Ok(());
        }

        let updated = self
            .tx
            .execute(&Statement::update(table, set.clone(), Condition::matching(&pk)))
            .await?;
        if updated == 0 {
            return Err(SatelliteError::RowNotFound {
                table: table.to_string(),
            });
        }
        self.capture(&descriptor, ChangeOp::Update, pk, set).await
    }

    /// Deletes the row with primary key `pk`.
    ///
    /// # Errors
    ///
    /// Returns [`SatelliteError::RowNotFound`] if no such row exists.
    pub async fn delete(&mut self, table: &str, pk: Row) -> SatelliteResult<()> {
        let descriptor = self.satellite.ctx.table(table)?;
        let pk = descriptor
            .key_of(&pk)
            .map_err(|e| invalid_row(table, e.to_string()))?;
        let deleted = self
            .tx
            .execute(&Statement::delete(table, Condition::matching(&pk)))
            .await?;
        if deleted == 0 {
            return Err(SatelliteError::RowNotFound {
                table: table.to_string(),
            });
        }
        self.capture(&descriptor, ChangeOp::Delete, pk, Row::new())
            .await
    }

    /// Reads rows as this transaction sees them.
    pub async fn query(&mut self, query: &Query) -> SatelliteResult<Vec<Row>> {
        reject_internal(&query.table)?;
        Ok(self.tx.query(query).await?)
    }

    /// Commits the writes and their oplog entries together.
    ///
    /// # Errors
    ///
    /// If capturing any write failed, the whole transaction is rolled back
    /// and that error is returned.
    pub async fn commit(self) -> SatelliteResult<()> {
        if let Some(err) = self.failed {
            let _ = self.tx.rollback().await;
            return Err(err);
        }
        self.tx.commit().await?;

        if !self.changed.is_empty() {
            let ctx = &self.satellite.ctx;
            debug!(rows = self.changed.len(), "local transaction committed");
            ctx.local_writes.notify_one();
            ctx.notifier.notify(ChangeOrigin::Local, self.changed);
        }
        Ok(())
    }

    /// Discards every write.
    pub async fn rollback(self) -> SatelliteResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// Records a write that already reached the user table.
    async fn capture(
        &mut self,
        descriptor: &TableDescriptor,
        op: ChangeOp,
        pk: Row,
        values: Row,
    ) -> SatelliteResult<()> {
        let result = self.try_capture(descriptor, op, pk, values).await;
        if let Err(err) = &result {
            self.failed.get_or_insert_with(|| err.clone());
        }
        result
    }

    async fn try_capture(
        &mut self,
        descriptor: &TableDescriptor,
        op: ChangeOp,
        pk: Row,
        values: Row,
    ) -> SatelliteResult<()> {
        let satellite = self.satellite;
        let stamp = match &self.stamp {
            Some(stamp) => stamp.clone(),
            None => {
                let stamp = satellite.tagger.next_stamp(self.tx.as_mut()).await?;
                self.stamp = Some(stamp.clone());
                stamp
            }
        };

        let entry = satellite
            .oplog
            .record_local_change(
                self.tx.as_mut(),
                &stamp,
                &descriptor.name,
                pk.clone(),
                op,
                values.clone(),
            )
            .await?;
        let change = Change {
            seq: entry.seq,
            table: descriptor.name.clone(),
            op,
            pk: pk.clone(),
            values,
        };
        let now = satellite.ctx.now_millis();
        merge_change(self.tx.as_mut(), descriptor, &change, &stamp, now, false).await?;

        self.changed.push(ChangedRow {
            table: descriptor.name.clone(),
            pk,
        });
        Ok(())
    }
}

impl std::fmt::Debug for LocalTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("stamp", &self.stamp)
            .field("changed", &self.changed.len())
            .finish_non_exhaustive()
    }
}

fn invalid_row(table: &str, reason: impl Into<String>) -> SatelliteError {
    SatelliteError::InvalidRow {
        table: table.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::migration::StaticMigrator;
    use crate::transport::BoxedStream;
    use async_trait::async_trait;
    use satellite_protocol::MigrationRecord;
    use satellite_storage::{row, ColumnType, InMemoryAdapter, SqlValue, StorageError};
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> SatelliteResult<BoxedStream> {
            Err(SatelliteError::transport_retryable("unreachable"))
        }
    }

    fn migrator() -> Arc<StaticMigrator> {
        Arc::new(StaticMigrator::new([MigrationRecord::new(
            1,
            vec![Statement::create_table(
                TableDescriptor::builder("items")
                    .column("id", ColumnType::Integer)
                    .column("name", ColumnType::Text)
                    .column("qty", ColumnType::Integer)
                    .primary_key(["id"])
                    .build()
                    .unwrap(),
            )],
        )]))
    }

    async fn open(adapter: &InMemoryAdapter, clock: Arc<ManualClock>) -> Satellite {
        Satellite::open_with_clock(
            SatelliteConfig::default()
                .with_replica_id("r1")
                .with_tombstone_gc(Duration::from_millis(100), Duration::from_secs(3600)),
            Arc::new(adapter.clone()),
            Arc::new(Unreachable),
            migrator(),
            clock,
        )
        .await
        .unwrap()
    }

    fn key(id: i64) -> Row {
        row([("id", SqlValue::from(id))])
    }

    #[tokio::test]
    async fn open_applies_migrations() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;
        assert_eq!(satellite.schema_version().await.unwrap(), 1);
        assert_eq!(satellite.tables().len(), 1);
        assert_eq!(satellite.replica_id().as_str(), "r1");
        assert_eq!(satellite.status(), SatelliteStatus::Disconnected);
    }

    #[tokio::test]
    async fn writes_are_captured_with_one_tag_per_transaction() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;

        let mut tx = satellite.begin().await.unwrap();
        tx.insert("items", row([("id", SqlValue::from(1)), ("name", "pen".into())]))
            .await
            .unwrap();
        tx.update("items", key(1), row([("qty", SqlValue::from(3))]))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let entries = satellite.oplog().all_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stamp, entries[1].stamp);
        assert_eq!(entries[0].values["qty"], SqlValue::Null);

        let shadow = satellite.shadow_row("items", &key(1)).await.unwrap().unwrap();
        assert_eq!(shadow.columns["qty"].value, SqlValue::from(3));
        assert!(shadow.is_live());
    }

    #[tokio::test]
    async fn rollback_captures_nothing() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;

        let mut tx = satellite.begin().await.unwrap();
        tx.insert("items", row([("id", SqlValue::from(1))]))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(satellite.oplog().all_entries().await.unwrap().is_empty());
        assert!(satellite
            .read(&Query::table("items"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(satellite.meta().await.unwrap().counter, 0);

        // The rolled back tag stays burnt
        let mut tx = satellite.begin().await.unwrap();
        tx.insert("items", row([("id", SqlValue::from(2))]))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let entries = satellite.oplog().all_entries().await.unwrap();
        assert_eq!(entries[0].stamp.tag.counter, 2);
    }

    #[tokio::test]
    async fn invalid_writes_are_rejected() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;
        let mut tx = satellite.begin().await.unwrap();

        assert!(matches!(
            tx.insert("ghost", key(1)).await,
            Err(SatelliteError::UnknownTable(_))
        ));
        assert!(matches!(
            tx.insert("items", row([("id", SqlValue::from(1)), ("color", "red".into())]))
                .await,
            Err(SatelliteError::InvalidRow { .. })
        ));
        assert!(matches!(
            tx.update("items", key(1), row([("id", SqlValue::from(2))]))
                .await,
            Err(SatelliteError::InvalidRow { .. })
        ));
        assert!(matches!(
            tx.delete("items", key(9)).await,
            Err(SatelliteError::RowNotFound { .. })
        ));
        assert!(matches!(
            tx.query(&Query::table("_satellite_oplog")).await,
            Err(SatelliteError::UnknownTable(_))
        ));

        tx.insert("items", key(1)).await.unwrap();
        assert!(matches!(
            tx.insert("items", key(1)).await,
            Err(SatelliteError::Storage(StorageError::DuplicateKey { .. }))
        ));
    }

    #[tokio::test]
    async fn unavailable_storage_fails_the_write() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;
        let mut tx = satellite.begin().await.unwrap();
        adapter.set_available(false);

        let err = tx.insert("items", key(1)).await.unwrap_err();
        assert!(matches!(err, SatelliteError::StorageUnavailable(_)));
        assert!(tx.commit().await.is_err());

        adapter.set_available(true);
        assert!(satellite.oplog().all_entries().await.unwrap().is_empty());
        assert!(satellite
            .read(&Query::table("items"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn listeners_see_local_commits() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = satellite.on_change(move |n| sink.lock().push(n.clone()));

        let mut tx = satellite.begin().await.unwrap();
        tx.insert("items", key(1)).await.unwrap();
        tx.insert("items", key(2)).await.unwrap();
        tx.commit().await.unwrap();

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].origin, ChangeOrigin::Local);
            assert_eq!(seen[0].rows.len(), 2);
        }
        assert!(satellite.remove_listener(id));
    }

    #[tokio::test]
    async fn garbage_collection_respects_retention() {
        let adapter = InMemoryAdapter::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let satellite = open(&adapter, Arc::clone(&clock)).await;

        let mut tx = satellite.begin().await.unwrap();
        tx.insert("items", key(1)).await.unwrap();
        tx.commit().await.unwrap();
        let mut tx = satellite.begin().await.unwrap();
        tx.delete("items", key(1)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(satellite.collect_garbage().await.unwrap(), 0);
        clock.advance(100);
        assert_eq!(satellite.collect_garbage().await.unwrap(), 1);
        assert!(satellite.shadow_row("items", &key(1)).await.unwrap().is_none());
        assert_eq!(satellite.stats().tombstones_collected, 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_disconnects() {
        let adapter = InMemoryAdapter::new();
        let satellite = open(&adapter, Arc::new(ManualClock::new(1_000))).await;
        satellite.start().unwrap();
        assert_eq!(satellite.start(), Err(SatelliteError::AlreadyStarted));
        satellite.stop().await;
        assert!(!satellite.is_running());
        assert_eq!(satellite.status(), SatelliteStatus::Disconnected);
        assert_eq!(satellite.connection_state(), ConnectionState::Disconnected);
    }
}
