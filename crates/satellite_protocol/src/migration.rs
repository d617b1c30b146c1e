//! Migration records.

use satellite_storage::{Statement, TableDescriptor};
use serde::{Deserialize, Serialize};

/// One schema migration.
///
/// Applying a record runs its statements in order and sets the local
/// schema watermark to `version`. Records are immutable once applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Schema version this record establishes.
    pub version: u64,
    /// DDL statements, in order.
    pub statements: Vec<Statement>,
}

impl MigrationRecord {
    /// Creates a migration record.
    pub fn new(version: u64, statements: Vec<Statement>) -> Self {
        Self {
            version,
            statements,
        }
    }

    /// Returns true if every statement is DDL.
    pub fn is_ddl_only(&self) -> bool {
        self.statements.iter().all(Statement::is_ddl)
    }

    /// Tables this record creates.
    pub fn created_tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.statements.iter().filter_map(|s| match s {
            Statement::CreateTable { descriptor, .. } => Some(descriptor),
            _ => None,
        })
    }

    /// Names of the tables this record touches.
    pub fn touched_tables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.statements.iter().map(Statement::table).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_storage::{row, ColumnDescriptor, ColumnType, SqlValue};

    fn record() -> MigrationRecord {
        let items = TableDescriptor::builder("items")
            .column("id", ColumnType::Integer)
            .primary_key(["id"])
            .build()
            .unwrap();
        MigrationRecord::new(
            1,
            vec![
                Statement::create_table(items),
                Statement::AddColumn {
                    table: "items".into(),
                    column: ColumnDescriptor::new("name", ColumnType::Text),
                },
            ],
        )
    }

    #[test]
    fn classifies_statements() {
        let r = record();
        assert!(r.is_ddl_only());
        assert_eq!(r.created_tables().count(), 1);
        assert_eq!(r.touched_tables(), vec!["items"]);
    }

    #[test]
    fn dml_is_not_ddl_only() {
        let mut r = record();
        r.statements
            .push(Statement::insert("items", row([("id", SqlValue::from(1))])));
        assert!(!r.is_ddl_only());
    }
}
