//! Test fixtures and satellite helpers.
//!
//! Provides a shared `items` table, a migrator that creates it, fast sync
//! settings, and helpers to open satellites against a
//! [`ReferenceService`].

use crate::connector::ChannelConnector;
use crate::service::ReferenceService;
use satellite_engine::{
    BackoffConfig, ManualClock, Satellite, SatelliteConfig, SatelliteResult, SatelliteStatus,
    StaticMigrator,
};
use satellite_protocol::MigrationRecord;
use satellite_storage::{
    row, ColumnType, InMemoryAdapter, Query, Row, SortOrder, SqlValue, Statement,
    StorageAdapter, TableDescriptor,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long the wait helpers poll before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a test-friendly tracing subscriber, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `items(id INTEGER PRIMARY KEY, name TEXT, qty INTEGER)`.
pub fn items_table() -> TableDescriptor {
    TableDescriptor::builder("items")
        .column("id", ColumnType::Integer)
        .column("name", ColumnType::Text)
        .column("qty", ColumnType::Integer)
        .primary_key(["id"])
        .build()
        .expect("items table is valid")
}

/// Migration 1: creates `items`.
pub fn items_migration() -> MigrationRecord {
    MigrationRecord::new(1, vec![Statement::create_table(items_table())])
}

/// A migrator holding [`items_migration`].
pub fn items_migrator() -> Arc<StaticMigrator> {
    Arc::new(StaticMigrator::new([items_migration()]))
}

/// Primary key of an `items` row.
pub fn item_key(id: i64) -> Row {
    row([("id", SqlValue::Integer(id))])
}

/// A full `items` row.
pub fn item(id: i64, name: &str, qty: i64) -> Row {
    row([
        ("id", SqlValue::Integer(id)),
        ("name", SqlValue::from(name)),
        ("qty", SqlValue::Integer(qty)),
    ])
}

/// Sync settings with short timeouts and deterministic backoff.
pub fn fast_config(replica: &str) -> SatelliteConfig {
    SatelliteConfig::default()
        .with_replica_id(replica)
        .with_batch_window(Duration::from_millis(5))
        .with_ack_timeout(Duration::from_millis(500))
        .with_liveness(Duration::from_millis(200), Duration::from_secs(2))
        .with_connect_timeout(Duration::from_millis(500))
        .with_write_timeout(Duration::from_millis(500))
        .with_backoff(BackoffConfig::testing())
}

/// A satellite wired to a [`ReferenceService`], with handles tests need.
pub struct TestSatellite {
    /// The satellite.
    pub satellite: Satellite,
    /// Its store; clones share state, so this survives a reopen.
    pub storage: InMemoryAdapter,
    /// The connector it dials.
    pub connector: Arc<ChannelConnector>,
    /// Its wall clock.
    pub clock: Arc<ManualClock>,
}

impl TestSatellite {
    /// Opens a satellite with [`fast_config`] over a fresh store.
    pub async fn open(service: &ReferenceService, replica: &str) -> SatelliteResult<Self> {
        Self::open_with(
            service,
            fast_config(replica),
            InMemoryAdapter::new(),
            items_migrator(),
        )
        .await
    }

    /// Opens a satellite with explicit settings, store and migrator.
    pub async fn open_with(
        service: &ReferenceService,
        config: SatelliteConfig,
        storage: InMemoryAdapter,
        migrator: Arc<StaticMigrator>,
    ) -> SatelliteResult<Self> {
        let connector = Arc::new(ChannelConnector::new(service.clone()));
        let clock = Arc::new(ManualClock::new(1_000));
        let satellite = Satellite::open_with_clock(
            config,
            Arc::new(storage.clone()) as Arc<dyn StorageAdapter>,
            Arc::clone(&connector) as _,
            migrator,
            Arc::clone(&clock) as _,
        )
        .await?;
        Ok(Self {
            satellite,
            storage,
            connector,
            clock,
        })
    }

    /// Inserts one `items` row in its own transaction.
    pub async fn insert_item(&self, id: i64, name: &str, qty: i64) -> SatelliteResult<()> {
        let mut tx = self.satellite.begin().await?;
        tx.insert("items", item(id, name, qty)).await?;
        tx.commit().await
    }

    /// Updates columns of one `items` row in its own transaction.
    pub async fn update_item(&self, id: i64, set: Row) -> SatelliteResult<()> {
        let mut tx = self.satellite.begin().await?;
        tx.update("items", item_key(id), set).await?;
        tx.commit().await
    }

    /// Deletes one `items` row in its own transaction.
    pub async fn delete_item(&self, id: i64) -> SatelliteResult<()> {
        let mut tx = self.satellite.begin().await?;
        tx.delete("items", item_key(id)).await?;
        tx.commit().await
    }

    /// Every `items` row, ordered by key.
    pub async fn items(&self) -> SatelliteResult<Vec<Row>> {
        self.satellite
            .read(&Query::table("items").order_by("id", SortOrder::Asc))
            .await
    }

    /// Waits until `items` holds exactly `expected`, in key order.
    pub async fn wait_for_items(&self, expected: &[Row]) -> bool {
        eventually(WAIT_TIMEOUT, move || async move {
            self.items().await.is_ok_and(|rows| rows == expected)
        })
        .await
    }

    /// Waits until the connection is active.
    pub async fn wait_until_active(&self) -> bool {
        let mut state = self.satellite.watch_connection_state();
        let reached = matches!(
            tokio::time::timeout(WAIT_TIMEOUT, state.wait_for(|s| s.is_active())).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Waits for a status matching `accept` and returns it.
    pub async fn wait_for_status<F>(&self, accept: F) -> Option<SatelliteStatus>
    where
        F: Fn(&SatelliteStatus) -> bool,
    {
        let mut status = self.satellite.watch_status();
        let waited = tokio::time::timeout(WAIT_TIMEOUT, status.wait_for(|s| accept(s))).await;
        let found = match waited {
            Ok(Ok(found)) => Some(found.clone()),
            _ => None,
        };
        found
    }

    /// Waits until every oplog entry was acknowledged and purged.
    pub async fn wait_until_drained(&self) -> bool {
        eventually(WAIT_TIMEOUT, move || async move {
            self.satellite
                .oplog()
                .all_entries()
                .await
                .is_ok_and(|entries| entries.is_empty())
        })
        .await
    }

    /// Sequence numbers of the entries still in the oplog.
    pub async fn oplog_seqs(&self) -> SatelliteResult<Vec<u64>> {
        let entries = self.satellite.oplog().all_entries().await?;
        Ok(entries.iter().map(|e| e.seq).collect())
    }
}

/// Polls `check` until it returns true or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls a synchronous `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    eventually(timeout, || std::future::ready(check())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_table_shape() {
        let table = items_table();
        assert!(table.is_key_column("id"));
        assert_eq!(table.value_columns().collect::<Vec<_>>(), vec!["name", "qty"]);
    }

    #[tokio::test]
    async fn eventually_times_out() {
        assert!(!eventually(Duration::from_millis(30), || async { false }).await);
        assert!(eventually(Duration::from_millis(30), || async { true }).await);
    }
}
