//! Oplog store.
//!
//! A durable, ordered log of local row-level changes in `_satellite_oplog`.
//!
//! # Invariants
//!
//! - An entry is written in the same transaction as the user write it
//!   describes: no committed write without an entry, no entry without a
//!   committed write
//! - Sequence numbers are strictly increasing and never reused, even after
//!   purged entries are gone
//! - Entries are immutable except for the `sent` flag, which is set only
//!   once the service acknowledged them

use crate::blob::{from_blob, int, read_text, read_u64, to_blob};
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::MetaStore;
use satellite_protocol::{CausalityTag, Change, ChangeOp, ReplicaId, VersionStamp};
use satellite_storage::{
    row, CmpOp, ColumnDescriptor, ColumnType, Condition, Query, Row, SortOrder, SqlValue,
    Statement, StorageAdapter, TableDescriptor, Transaction,
};
use std::sync::Arc;
use tracing::debug;

pub(crate) const OPLOG_TABLE: &str = "_satellite_oplog";

/// One local row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Local sequence number.
    pub seq: u64,
    /// Table name.
    pub table: String,
    /// Operation kind.
    pub op: ChangeOp,
    /// Primary key.
    pub pk: Row,
    /// Changed non-key columns.
    pub values: Row,
    /// Version stamp of the local transaction.
    pub stamp: VersionStamp,
    /// Acknowledged by the service.
    pub sent: bool,
}

impl OplogEntry {
    /// Converts to a wire change.
    pub fn to_change(&self) -> Change {
        Change {
            seq: self.seq,
            table: self.table.clone(),
            op: self.op,
            pk: self.pk.clone(),
            values: self.values.clone(),
        }
    }

    fn to_row(&self) -> SatelliteResult<Row> {
        Ok(row([
            ("seq", int(self.seq)),
            ("tbl", SqlValue::from(self.table.as_str())),
            ("op", SqlValue::from(self.op.as_str())),
            ("pk", to_blob(&self.pk)?),
            ("vals", to_blob(&self.values)?),
            ("replica", SqlValue::from(self.stamp.tag.replica_id.as_str())),
            ("counter", int(self.stamp.tag.counter)),
            ("timestamp", int(self.stamp.timestamp)),
            ("observed", int(self.stamp.observed)),
            ("sent", SqlValue::from(self.sent)),
        ]))
    }

    fn from_row(row: &Row) -> SatelliteResult<Self> {
        let op_name = read_text(row, "op")?;
        let op = ChangeOp::parse(&op_name)
            .ok_or_else(|| SatelliteError::Corrupt(format!("unknown oplog op {op_name}")))?;
        Ok(Self {
            seq: read_u64(row, "seq")?,
            table: read_text(row, "tbl")?,
            op,
            pk: from_blob(row, "pk")?,
            values: from_blob(row, "vals")?,
            stamp: VersionStamp::new(
                CausalityTag::new(
                    ReplicaId::new(read_text(row, "replica")?),
                    read_u64(row, "counter")?,
                ),
                read_u64(row, "timestamp")?,
                read_u64(row, "observed")?,
            ),
            sent: read_u64(row, "sent")? != 0,
        })
    }
}

pub(crate) fn oplog_descriptor() -> TableDescriptor {
    let column = ColumnDescriptor::new;
    TableDescriptor {
        name: OPLOG_TABLE.to_string(),
        columns: vec![
            column("seq", ColumnType::Integer),
            column("tbl", ColumnType::Text),
            column("op", ColumnType::Text),
            column("pk", ColumnType::Blob),
            column("vals", ColumnType::Blob),
            column("replica", ColumnType::Text),
            column("counter", ColumnType::Integer),
            column("timestamp", ColumnType::Integer),
            column("observed", ColumnType::Integer),
            column("sent", ColumnType::Integer),
        ],
        primary_key: vec!["seq".to_string()],
    }
}

/// Durable log of local changes.
#[derive(Clone)]
pub struct OplogStore {
    storage: Arc<dyn StorageAdapter>,
}

impl OplogStore {
    pub(crate) fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    /// Creates the oplog table if needed.
    pub(crate) async fn ensure(tx: &mut dyn Transaction) -> SatelliteResult<()> {
        tx.execute(&Statement::create_table_if_not_exists(oplog_descriptor()))
            .await?;
        Ok(())
    }

    /// Appends a change inside the application's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SatelliteError::StorageUnavailable`] if the store fails;
    /// the caller must then abandon its transaction.
    pub async fn record_local_change(
        &self,
        tx: &mut dyn Transaction,
        stamp: &VersionStamp,
        table: &str,
        pk: Row,
        op: ChangeOp,
        values: Row,
    ) -> SatelliteResult<OplogEntry> {
        let meta = MetaStore::load(tx).await?;
        let entry = OplogEntry {
            seq: meta.last_seq + 1,
            table: table.to_string(),
            op,
            pk,
            values,
            stamp: stamp.clone(),
            sent: false,
        };
        tx.execute(&Statement::insert(OPLOG_TABLE, entry.to_row()?))
            .await?;
        MetaStore::set(tx, &[("last_seq", entry.seq)]).await?;
        debug!(seq = entry.seq, table, op = %op, tag = %stamp.tag, "recorded local change");
        Ok(entry)
    }

    /// Unacknowledged entries with a sequence number above `since_seq`, in
    /// sequence order, at most `limit` of them.
    pub async fn pending_entries(
        &self,
        since_seq: u64,
        limit: usize,
    ) -> SatelliteResult<Vec<OplogEntry>> {
        let query = Query::table(OPLOG_TABLE)
            .filter(Condition::new("seq", CmpOp::Gt, int(since_seq)))
            .filter(Condition::eq("sent", 0))
            .order_by("seq", SortOrder::Asc)
            .limit(limit);
        let rows = self.storage.read(&query).await?;
        rows.iter().map(OplogEntry::from_row).collect()
    }

    /// Marks every entry up to `up_to_seq` as acknowledged and records the
    /// acknowledged high-water mark.
    pub async fn mark_sent(&self, up_to_seq: u64) -> SatelliteResult<u64> {
        let mut tx = self.storage.begin().await?;
        let marked = tx
            .execute(&Statement::update(
                OPLOG_TABLE,
                row([("sent", SqlValue::from(1))]),
                vec![
                    Condition::new("seq", CmpOp::Le, int(up_to_seq)),
                    Condition::eq("sent", 0),
                ],
            ))
            .await?;
        let meta = MetaStore::load(tx.as_mut()).await?;
        if up_to_seq > meta.acked_seq {
            MetaStore::set(tx.as_mut(), &[("acked_seq", up_to_seq.min(meta.last_seq))]).await?;
        }
        tx.commit().await?;
        debug!(up_to_seq, marked, "marked oplog entries sent");
        Ok(marked)
    }

    /// Deletes acknowledged entries.
    pub async fn purge_sent(&self) -> SatelliteResult<u64> {
        let mut tx = self.storage.begin().await?;
        let purged = tx
            .execute(&Statement::delete(
                OPLOG_TABLE,
                vec![Condition::eq("sent", 1)],
            ))
            .await?;
        tx.commit().await?;
        Ok(purged)
    }

    /// Number of unacknowledged entries.
    pub async fn pending_count(&self) -> SatelliteResult<usize> {
        let rows = self
            .storage
            .read(&Query::table(OPLOG_TABLE).filter(Condition::eq("sent", 0)))
            .await?;
        Ok(rows.len())
    }

    /// Every entry still in the log, acknowledged or not.
    pub async fn all_entries(&self) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = self
            .storage
            .read(&Query::table(OPLOG_TABLE).order_by("seq", SortOrder::Asc))
            .await?;
        rows.iter().map(OplogEntry::from_row).collect()
    }
}

impl std::fmt::Debug for OplogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OplogStore").finish_non_exhaustive()
    }
}
