//! Storage adapter contract.

use crate::error::StorageResult;
use crate::statement::{Query, Statement};
use crate::value::Row;
use async_trait::async_trait;

/// The local store as seen by the sync engine.
///
/// Adapters translate typed statements into whatever the embedded engine
/// understands. The engine makes no other assumption about the store.
///
/// # Invariants
///
/// - Transactions are isolated: a transaction observes either all or none
///   of another transaction's writes
/// - Conflicting transactions are serialized by the adapter
/// - A transaction that is dropped without [`Transaction::commit`] leaves
///   no trace
///
/// # Implementors
///
/// - [`super::InMemoryAdapter`] - For testing
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Unavailable`] if the engine cannot
    /// serve requests.
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Runs a single query in its own read transaction.
    async fn read(&self, query: &Query) -> StorageResult<Vec<Row>> {
        let mut tx = self.begin().await?;
        let rows = tx.query(query).await?;
        tx.rollback().await?;
        Ok(rows)
    }
}

/// An open transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Runs a statement and returns the number of affected rows.
    ///
    /// DDL statements report zero affected rows.
    async fn execute(&mut self, statement: &Statement) -> StorageResult<u64>;

    /// Runs a query and returns the matching rows.
    async fn query(&mut self, query: &Query) -> StorageResult<Vec<Row>>;

    /// Makes every write of this transaction durable and visible.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards every write of this transaction.
    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}
