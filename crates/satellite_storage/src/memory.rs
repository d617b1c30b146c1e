//! In-memory storage adapter for testing.

use crate::adapter::{StorageAdapter, Transaction};
use crate::error::{StorageError, StorageResult};
use crate::schema::TableDescriptor;
use crate::statement::{Condition, Query, SortOrder, Statement};
use crate::value::{Row, SqlValue};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
struct MemTable {
    descriptor: TableDescriptor,
    rows: Vec<Row>,
}

impl MemTable {
    fn position_of_key(&self, key: &Row) -> Option<usize> {
        self.rows.iter().position(|row| {
            key.iter()
                .all(|(column, value)| row.get(column) == Some(value))
        })
    }

    fn check_columns(&self, row: &Row) -> StorageResult<()> {
        match self.descriptor.unknown_column(row) {
            Some(column) => Err(StorageError::NoSuchColumn {
                table: self.descriptor.name.clone(),
                column: column.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn check_filter(&self, filter: &[Condition]) -> StorageResult<()> {
        for condition in filter {
            if !self.descriptor.has_column(&condition.column) {
                return Err(StorageError::NoSuchColumn {
                    table: self.descriptor.name.clone(),
                    column: condition.column.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<String, MemTable>,
}

impl Tables {
    fn table(&self, name: &str) -> StorageResult<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::NoSuchTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> StorageResult<&mut MemTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::NoSuchTable(name.to_string()))
    }

    fn execute(&mut self, statement: &Statement) -> StorageResult<u64> {
        match statement {
            Statement::CreateTable {
                descriptor,
                if_not_exists,
            } => {
                descriptor.validate()?;
                if self.tables.contains_key(&descriptor.name) {
                    return if *if_not_exists {
                        Ok(0)
                    } else {
                        Err(StorageError::TableExists(descriptor.name.clone()))
                    };
                }
                self.tables.insert(
                    descriptor.name.clone(),
                    MemTable {
                        descriptor: descriptor.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(0)
            }
            Statement::DropTable { table, if_exists } => {
                if self.tables.remove(table).is_none() && !*if_exists {
                    return Err(StorageError::NoSuchTable(table.clone()));
                }
                Ok(0)
            }
            Statement::AddColumn { table, column } => {
                let t = self.table_mut(table)?;
                if t.descriptor.has_column(&column.name) {
                    return Err(StorageError::ColumnExists {
                        table: table.clone(),
                        column: column.name.clone(),
                    });
                }
                t.descriptor.columns.push(column.clone());
                for row in &mut t.rows {
                    row.insert(column.name.clone(), SqlValue::Null);
                }
                Ok(0)
            }
            Statement::Insert { table, row } => {
                let t = self.table_mut(table)?;
                t.check_columns(row)?;
                let key = t.descriptor.key_of(row)?;
                if t.position_of_key(&key).is_some() {
                    return Err(StorageError::DuplicateKey {
                        table: table.clone(),
                    });
                }
                let full = t.descriptor.complete_row(row);
                t.rows.push(full);
                Ok(1)
            }
            Statement::Upsert { table, row } => {
                let t = self.table_mut(table)?;
                t.check_columns(row)?;
                let key = t.descriptor.key_of(row)?;
                let full = t.descriptor.complete_row(row);
                match t.position_of_key(&key) {
                    Some(idx) => t.rows[idx] = full,
                    None => t.rows.push(full),
                }
                Ok(1)
            }
            Statement::Update { table, set, filter } => {
                let t = self.table_mut(table)?;
                t.check_columns(set)?;
                t.check_filter(filter)?;
                let mut affected = 0;
                for row in t.rows.iter_mut() {
                    if filter.iter().all(|c| c.matches(row)) {
                        for (column, value) in set {
                            row.insert(column.clone(), value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(affected)
            }
            Statement::Delete { table, filter } => {
                let t = self.table_mut(table)?;
                t.check_filter(filter)?;
                let before = t.rows.len();
                t.rows.retain(|row| !filter.iter().all(|c| c.matches(row)));
                Ok((before - t.rows.len()) as u64)
            }
        }
    }

    fn query(&self, query: &Query) -> StorageResult<Vec<Row>> {
        let t = self.table(&query.table)?;
        t.check_filter(&query.filter)?;
        let mut rows: Vec<Row> = t
            .rows
            .iter()
            .filter(|row| query.filter.iter().all(|c| c.matches(row)))
            .cloned()
            .collect();

        if let Some(order) = &query.order_by {
            if !t.descriptor.has_column(&order.column) {
                return Err(StorageError::NoSuchColumn {
                    table: query.table.clone(),
                    column: order.column.clone(),
                });
            }
            let null = SqlValue::Null;
            rows.sort_by(|a, b| {
                let lhs = a.get(&order.column).unwrap_or(&null);
                let rhs = b.get(&order.column).unwrap_or(&null);
                match order.order {
                    SortOrder::Asc => lhs.sql_cmp(rhs),
                    SortOrder::Desc => rhs.sql_cmp(lhs),
                }
            });
        }

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

/// An in-memory storage adapter.
///
/// This adapter keeps every table in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral replicas that don't need persistence
///
/// Clones share the same underlying store, so a clone handed to a fresh
/// satellite behaves like reopening the same database after a restart.
///
/// # Isolation
///
/// A transaction holds the store lock from `begin` until it ends and works
/// on a private snapshot that replaces the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAdapter {
    state: Arc<Mutex<Tables>>,
    available: Arc<AtomicBool>,
}

impl InMemoryAdapter {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(Tables::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates the engine going away (or coming back).
    ///
    /// While unavailable, `begin` and every operation on open transactions
    /// fail with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the names of all tables.
    pub async fn table_names(&self) -> Vec<String> {
        self.state.lock().await.tables.keys().cloned().collect()
    }

    /// Returns the descriptor of `table`, if it exists.
    pub async fn descriptor(&self, table: &str) -> Option<TableDescriptor> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.descriptor.clone())
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("in-memory store is offline"));
        }
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            available: Arc::clone(&self.available),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    available: Arc<AtomicBool>,
}

impl MemoryTransaction {
    fn check_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::unavailable("in-memory store is offline"))
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, statement: &Statement) -> StorageResult<u64> {
        self.check_available()?;
        self.working.execute(statement)
    }

    async fn query(&mut self, query: &Query) -> StorageResult<Vec<Row>> {
        self.check_available()?;
        self.working.query(query)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.check_available()?;
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
