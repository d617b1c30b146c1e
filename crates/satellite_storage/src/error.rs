//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The underlying engine cannot serve requests.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The statement referenced a table that does not exist.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// `CREATE TABLE` without `if_not_exists` hit an existing table.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// The statement referenced a column that does not exist.
    #[error("no such column: {table}.{column}")]
    NoSuchColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// `ADD COLUMN` hit an existing column.
    #[error("column already exists: {table}.{column}")]
    ColumnExists {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// An insert collided with an existing primary key.
    #[error("duplicate primary key in table {table}")]
    DuplicateKey {
        /// Table name.
        table: String,
    },

    /// A row was missing a primary key column.
    #[error("missing primary key column {column} for table {table}")]
    MissingKey {
        /// Table name.
        table: String,
        /// Primary key column.
        column: String,
    },

    /// A table descriptor failed validation.
    #[error("invalid table descriptor: {0}")]
    InvalidDescriptor(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction is closed")]
    TransactionClosed,
}

impl StorageError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Returns true if the engine itself failed, as opposed to the statement.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}
