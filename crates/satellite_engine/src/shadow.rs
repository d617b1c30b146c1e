//! Shadow rows.
//!
//! Every tracked table `t` has a shadow table `_satellite_shadow_t` with the
//! same primary key and the merge baseline for each row: the last known
//! value and version stamp of every column, the stamp of the latest insert,
//! and the stamp of the latest delete (the tombstone).
//!
//! # Invariants
//!
//! - Every column stamp and the insert stamp are at or above the tombstone;
//!   older ones are dropped when the tombstone advances
//! - A row is live iff it holds an insert stamp or at least one column

use crate::blob::{from_blob, int, to_blob};
use crate::error::SatelliteResult;
use crate::meta::INTERNAL_PREFIX;
use satellite_protocol::VersionStamp;
use satellite_storage::{
    CmpOp, ColumnDescriptor, ColumnType, Condition, Query, Row, SqlValue, Statement,
    TableDescriptor, Transaction,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const STATE_COLUMN: &str = "_state";
const TOMBSTONED_AT_COLUMN: &str = "_tombstoned_at";

/// Value and version of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnVersion {
    /// Last known value.
    pub value: SqlValue,
    /// Stamp of the write that produced it.
    pub stamp: VersionStamp,
}

/// Merge baseline for one row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowRow {
    /// Primary key.
    #[serde(skip)]
    pub pk: Row,
    /// Non-key columns.
    pub columns: BTreeMap<String, ColumnVersion>,
    /// Stamp of the latest surviving insert.
    pub inserted: Option<VersionStamp>,
    /// Stamp of the latest delete.
    pub tombstone: Option<VersionStamp>,
}

impl ShadowRow {
    /// Creates an empty shadow row.
    pub fn new(pk: Row) -> Self {
        Self {
            pk,
            ..Self::default()
        }
    }

    /// Returns true if the row exists in the user table.
    pub fn is_live(&self) -> bool {
        self.inserted.is_some() || !self.columns.is_empty()
    }

    /// Returns true if the row has been deleted and not resurrected.
    pub fn is_tombstoned(&self) -> bool {
        self.tombstone.is_some() && !self.is_live()
    }

    /// Highest stamp the row carries.
    pub fn latest_stamp(&self) -> Option<&VersionStamp> {
        self.columns
            .values()
            .map(|c| &c.stamp)
            .chain(self.inserted.iter())
            .chain(self.tombstone.iter())
            .max_by(|a, b| a.priority().cmp(&b.priority()))
    }

    /// The full user row this shadow describes: key, known columns, and
    /// `NULL` for every other column of `table`.
    pub fn to_user_row(&self, table: &TableDescriptor) -> Row {
        let mut row = self.pk.clone();
        for column in table.value_columns() {
            let value = self
                .columns
                .get(column)
                .map(|c| c.value.clone())
                .unwrap_or(SqlValue::Null);
            row.insert(column.to_string(), value);
        }
        row
    }
}

/// Name of the shadow table of `table`.
pub fn shadow_table_name(table: &str) -> String {
    format!("{INTERNAL_PREFIX}shadow_{table}")
}

/// Descriptor of the shadow table of `table`.
pub fn shadow_descriptor(table: &TableDescriptor) -> TableDescriptor {
    let mut columns: Vec<ColumnDescriptor> = table
        .primary_key
        .iter()
        .filter_map(|key| table.column(key).cloned())
        .collect();
    columns.push(ColumnDescriptor::new(STATE_COLUMN, ColumnType::Blob));
    columns.push(ColumnDescriptor::new(TOMBSTONED_AT_COLUMN, ColumnType::Integer));
    TableDescriptor {
        name: shadow_table_name(&table.name),
        columns,
        primary_key: table.primary_key.clone(),
    }
}

/// Shadow table access inside a caller's transaction.
pub(crate) struct ShadowStore;

impl ShadowStore {
    /// Creates the shadow table of `table`.
    pub(crate) async fn create(
        tx: &mut dyn Transaction,
        table: &TableDescriptor,
    ) -> SatelliteResult<()> {
        tx.execute(&Statement::create_table_if_not_exists(shadow_descriptor(
            table,
        )))
        .await?;
        Ok(())
    }

    /// Drops the shadow table of `table`.
    pub(crate) async fn drop_table(tx: &mut dyn Transaction, table: &str) -> SatelliteResult<()> {
        tx.execute(&Statement::DropTable {
            table: shadow_table_name(table),
            if_exists: true,
        })
        .await?;
        Ok(())
    }

    /// Loads the shadow row for `pk`.
    pub(crate) async fn load(
        tx: &mut dyn Transaction,
        table: &TableDescriptor,
        pk: &Row,
    ) -> SatelliteResult<Option<ShadowRow>> {
        let rows = tx
            .query(&Query::table(shadow_table_name(&table.name)).filters(Condition::matching(pk)))
            .await?;
        match rows.first() {
            Some(row) => {
                let mut shadow: ShadowRow = from_blob(row, STATE_COLUMN)?;
                shadow.pk = pk.clone();
                Ok(Some(shadow))
            }
            None => Ok(None),
        }
    }

    /// Writes the shadow row. `tombstoned_at` is the local time the row
    /// died, or `None` while it is live.
    pub(crate) async fn save(
        tx: &mut dyn Transaction,
        table: &TableDescriptor,
        shadow: &ShadowRow,
        tombstoned_at: Option<u64>,
    ) -> SatelliteResult<()> {
        let mut row = shadow.pk.clone();
        row.insert(STATE_COLUMN.to_string(), to_blob(shadow)?);
        row.insert(
            TOMBSTONED_AT_COLUMN.to_string(),
            tombstoned_at.map(int).unwrap_or(SqlValue::Null),
        );
        tx.execute(&Statement::upsert(shadow_table_name(&table.name), row))
            .await?;
        Ok(())
    }

    /// Reads the recorded tombstone time of a row.
    pub(crate) async fn tombstoned_at(
        tx: &mut dyn Transaction,
        table: &TableDescriptor,
        pk: &Row,
    ) -> SatelliteResult<Option<u64>> {
        let rows = tx
            .query(&Query::table(shadow_table_name(&table.name)).filters(Condition::matching(pk)))
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get(TOMBSTONED_AT_COLUMN))
            .and_then(SqlValue::as_integer)
            .and_then(|n| u64::try_from(n).ok()))
    }

    /// Deletes dead rows tombstoned at or before `cutoff`.
    pub(crate) async fn collect(
        tx: &mut dyn Transaction,
        table: &TableDescriptor,
        cutoff: u64,
    ) -> SatelliteResult<u64> {
        let removed = tx
            .execute(&Statement::delete(
                shadow_table_name(&table.name),
                vec![
                    Condition::new(TOMBSTONED_AT_COLUMN, CmpOp::Ge, 0),
                    Condition::new(TOMBSTONED_AT_COLUMN, CmpOp::Le, int(cutoff)),
                ],
            ))
            .await?;
        Ok(removed)
    }
}
