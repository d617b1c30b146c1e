//! Runtime table descriptors.
//!
//! Every component that needs to know a table's shape (the oplog, the
//! shadow tables, the conflict resolver, the in-memory adapter) works from
//! a [`TableDescriptor`]. There is no generated per-table code.

use crate::error::{StorageError, StorageResult};
use crate::value::{Row, SqlValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Integer column.
    Integer,
    /// Floating point column.
    Real,
    /// Text column.
    Text,
    /// Blob column.
    Blob,
}

/// A single column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub kind: ColumnType,
}

impl ColumnDescriptor {
    /// Creates a column descriptor.
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Shape of a table: columns and primary key.
///
/// # Invariants
///
/// - At least one primary key column
/// - Every primary key column is a declared column
/// - Column names are unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns, in key order.
    pub primary_key: Vec<String>,
}

impl TableDescriptor {
    /// Starts building a descriptor for `name`.
    pub fn builder(name: impl Into<String>) -> TableDescriptorBuilder {
        TableDescriptorBuilder {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Checks the descriptor invariants.
    pub fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() {
            return Err(StorageError::InvalidDescriptor("empty table name".into()));
        }
        if self.primary_key.is_empty() {
            return Err(StorageError::InvalidDescriptor(format!(
                "table {} has no primary key",
                self.name
            )));
        }
        let mut seen = BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(StorageError::InvalidDescriptor(format!(
                    "duplicate column {}.{}",
                    self.name, column.name
                )));
            }
        }
        for key in &self.primary_key {
            if !seen.contains(key.as_str()) {
                return Err(StorageError::InvalidDescriptor(format!(
                    "primary key column {}.{} is not declared",
                    self.name, key
                )));
            }
        }
        Ok(())
    }

    /// Returns the column with the given name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns true if the table declares `name`.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Returns true if `name` is part of the primary key.
    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Iterates over the non-key column names.
    pub fn value_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(move |name| !self.is_key_column(name))
    }

    /// Extracts the primary key of `row`.
    ///
    /// Fails if any key column is missing or `NULL`.
    pub fn key_of(&self, row: &Row) -> StorageResult<Row> {
        let mut key = Row::new();
        for column in &self.primary_key {
            match row.get(column) {
                Some(value) if !value.is_null() => {
                    key.insert(column.clone(), value.clone());
                }
                _ => {
                    return Err(StorageError::MissingKey {
                        table: self.name.clone(),
                        column: column.clone(),
                    })
                }
            }
        }
        Ok(key)
    }

    /// Returns the first column of `row` the table does not declare.
    pub fn unknown_column<'a>(&self, row: &'a Row) -> Option<&'a str> {
        row.keys()
            .map(String::as_str)
            .find(|name| !self.has_column(name))
    }

    /// Returns `row` with every declared column present (absent ones `NULL`).
    pub fn complete_row(&self, row: &Row) -> Row {
        self.columns
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    row.get(&c.name).cloned().unwrap_or(SqlValue::Null),
                )
            })
            .collect()
    }
}

/// Builder for [`TableDescriptor`].
#[derive(Debug, Clone)]
pub struct TableDescriptorBuilder {
    name: String,
    columns: Vec<ColumnDescriptor>,
    primary_key: Vec<String>,
}

impl TableDescriptorBuilder {
    /// Adds a column.
    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(ColumnDescriptor::new(name, kind));
        self
    }

    /// Sets the primary key columns.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Validates and builds the descriptor.
    pub fn build(self) -> StorageResult<TableDescriptor> {
        let descriptor = TableDescriptor {
            name: self.name,
            columns: self.columns,
            primary_key: self.primary_key,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::row;

    fn items() -> TableDescriptor {
        TableDescriptor::builder("items")
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::Text)
            .column("qty", ColumnType::Integer)
            .primary_key(["id"])
            .build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_undeclared_key() {
        let err = TableDescriptor::builder("t")
            .column("a", ColumnType::Integer)
            .primary_key(["b"])
            .build()
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDescriptor(_)));
    }

    #[test]
    fn builder_rejects_missing_key() {
        let err = TableDescriptor::builder("t")
            .column("a", ColumnType::Integer)
            .build()
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDescriptor(_)));
    }

    #[test]
    fn builder_rejects_duplicate_columns() {
        let err = TableDescriptor::builder("t")
            .column("a", ColumnType::Integer)
            .column("a", ColumnType::Text)
            .primary_key(["a"])
            .build()
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidDescriptor(_)));
    }

    #[test]
    fn key_extraction() {
        let t = items();
        let r = row([("id", SqlValue::from(7)), ("name", "x".into())]);
        assert_eq!(t.key_of(&r).unwrap(), row([("id", SqlValue::from(7))]));

        let missing = row([("name", SqlValue::from("x"))]);
        assert!(matches!(
            t.key_of(&missing),
            Err(StorageError::MissingKey { .. })
        ));
    }

    #[test]
    fn value_columns_skip_key() {
        let t = items();
        let cols: Vec<_> = t.value_columns().collect();
        assert_eq!(cols, vec!["name", "qty"]);
    }

    #[test]
    fn complete_row_fills_nulls() {
        let t = items();
        let full = t.complete_row(&row([("id", SqlValue::from(1))]));
        assert_eq!(full.len(), 3);
        assert_eq!(full["qty"], SqlValue::Null);
    }
}
