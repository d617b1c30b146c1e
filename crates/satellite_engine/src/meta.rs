//! Persisted sync metadata.
//!
//! A single row in `_satellite_meta` holds the replica identity and every
//! high-water mark the engine needs after a restart. `_satellite_tables`
//! holds the descriptor of every tracked table.

use crate::blob::{from_blob, int, read_text, read_u64, to_blob};
use crate::error::SatelliteResult;
use satellite_protocol::ReplicaId;
use satellite_storage::{
    row, ColumnDescriptor, ColumnType, Condition, Query, Row, SqlValue, Statement,
    TableDescriptor, Transaction,
};
use tracing::{info, warn};

/// Prefix reserved for the engine's own tables.
pub const INTERNAL_PREFIX: &str = "_satellite_";

pub(crate) const META_TABLE: &str = "_satellite_meta";
pub(crate) const TABLES_TABLE: &str = "_satellite_tables";

/// Snapshot of the persisted sync metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMeta {
    /// Replica identity.
    pub replica_id: ReplicaId,
    /// Highest causality counter issued or observed.
    pub counter: u64,
    /// Highest hybrid timestamp issued or observed.
    pub last_timestamp: u64,
    /// Last oplog sequence number assigned.
    pub last_seq: u64,
    /// Highest oplog sequence number acknowledged by the service.
    pub acked_seq: u64,
    /// Last service cursor applied locally.
    pub server_cursor: u64,
    /// Schema watermark.
    pub schema_version: u64,
}

fn meta_descriptor() -> TableDescriptor {
    let integer = |name: &str| ColumnDescriptor::new(name, ColumnType::Integer);
    TableDescriptor {
        name: META_TABLE.to_string(),
        columns: vec![
            integer("id"),
            ColumnDescriptor::new("replica_id", ColumnType::Text),
            integer("counter"),
            integer("last_timestamp"),
            integer("last_seq"),
            integer("acked_seq"),
            integer("server_cursor"),
            integer("schema_version"),
        ],
        primary_key: vec!["id".to_string()],
    }
}

fn tables_descriptor() -> TableDescriptor {
    TableDescriptor {
        name: TABLES_TABLE.to_string(),
        columns: vec![
            ColumnDescriptor::new("name", ColumnType::Text),
            ColumnDescriptor::new("descriptor", ColumnType::Blob),
        ],
        primary_key: vec!["name".to_string()],
    }
}

fn meta_key() -> Vec<Condition> {
    vec![Condition::eq("id", 0)]
}

/// Access to the metadata tables inside a caller's transaction.
pub(crate) struct MetaStore;

impl MetaStore {
    /// Creates the metadata tables if needed and returns the metadata.
    ///
    /// On first open the replica identity is `configured`, or a fresh UUID.
    /// A persisted identity always wins over the configured one, since the
    /// counter history belongs to it.
    pub(crate) async fn ensure(
        tx: &mut dyn Transaction,
        configured: Option<&ReplicaId>,
    ) -> SatelliteResult<SyncMeta> {
        tx.execute(&Statement::create_table_if_not_exists(meta_descriptor()))
            .await?;
        tx.execute(&Statement::create_table_if_not_exists(tables_descriptor()))
            .await?;

        let existing = tx
            .query(&Query::table(META_TABLE).filters(meta_key()))
            .await?;
        if existing.is_empty() {
            let replica_id = configured
                .cloned()
                .unwrap_or_else(|| ReplicaId::new(uuid::Uuid::new_v4().to_string()));
            info!(replica = %replica_id, "initializing sync metadata");
            tx.execute(&Statement::insert(
                META_TABLE,
                row([
                    ("id", SqlValue::from(0)),
                    ("replica_id", replica_id.as_str().into()),
                    ("counter", SqlValue::from(0)),
                    ("last_timestamp", SqlValue::from(0)),
                    ("last_seq", SqlValue::from(0)),
                    ("acked_seq", SqlValue::from(0)),
                    ("server_cursor", SqlValue::from(0)),
                    ("schema_version", SqlValue::from(0)),
                ]),
            ))
            .await?;
        }

        let meta = Self::load(tx).await?;
        if let Some(configured) = configured {
            if configured != &meta.replica_id {
                warn!(
                    configured = %configured,
                    persisted = %meta.replica_id,
                    "configured replica id differs from persisted one; keeping persisted"
                );
            }
        }
        Ok(meta)
    }

    /// Reads the metadata row.
    pub(crate) async fn load(tx: &mut dyn Transaction) -> SatelliteResult<SyncMeta> {
        let rows = tx
            .query(&Query::table(META_TABLE).filters(meta_key()))
            .await?;
        let row = rows.into_iter().next().ok_or_else(|| {
            crate::SatelliteError::Corrupt("sync metadata row is missing".into())
        })?;
        Ok(SyncMeta {
            replica_id: ReplicaId::new(read_text(&row, "replica_id")?),
            counter: read_u64(&row, "counter")?,
            last_timestamp: read_u64(&row, "last_timestamp")?,
            last_seq: read_u64(&row, "last_seq")?,
            acked_seq: read_u64(&row, "acked_seq")?,
            server_cursor: read_u64(&row, "server_cursor")?,
            schema_version: read_u64(&row, "schema_version")?,
        })
    }

    /// Overwrites the given integer fields.
    pub(crate) async fn set(
        tx: &mut dyn Transaction,
        fields: &[(&str, u64)],
    ) -> SatelliteResult<()> {
        let set: Row = fields
            .iter()
            .map(|(name, value)| (name.to_string(), int(*value)))
            .collect();
        tx.execute(&Statement::update(META_TABLE, set, meta_key()))
            .await?;
        Ok(())
    }

    /// Loads every tracked table descriptor.
    pub(crate) async fn tracked_tables(
        tx: &mut dyn Transaction,
    ) -> SatelliteResult<Vec<TableDescriptor>> {
        let rows = tx.query(&Query::table(TABLES_TABLE)).await?;
        rows.iter()
            .map(|row| from_blob(row, "descriptor"))
            .collect()
    }

    /// Records (or replaces) a tracked table descriptor.
    pub(crate) async fn save_tracked(
        tx: &mut dyn Transaction,
        descriptor: &TableDescriptor,
    ) -> SatelliteResult<()> {
        tx.execute(&Statement::upsert(
            TABLES_TABLE,
            row([
                ("name", SqlValue::from(descriptor.name.as_str())),
                ("descriptor", to_blob(descriptor)?),
            ]),
        ))
        .await?;
        Ok(())
    }

    /// Forgets a tracked table.
    pub(crate) async fn remove_tracked(tx: &mut dyn Transaction, name: &str) -> SatelliteResult<()> {
        tx.execute(&Statement::delete(
            TABLES_TABLE,
            vec![Condition::eq("name", name)],
        ))
        .await?;
        Ok(())
    }
}
