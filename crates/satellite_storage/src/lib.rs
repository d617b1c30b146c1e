//! # Satellite Storage
//!
//! Storage adapter contract for the satellite sync client.
//!
//! The sync engine never talks to a concrete embedded SQL engine. It drives
//! the local store through the narrow contract defined here:
//!
//! - [`StorageAdapter::begin`] opens a [`Transaction`]
//! - [`Transaction::execute`] runs a typed [`Statement`] and returns the
//!   affected row count
//! - [`Transaction::query`] runs a [`Query`] and returns [`Row`]s
//! - [`Transaction::commit`] / [`Transaction::rollback`] end the scope
//!
//! Dropping a transaction without committing rolls it back, so the handle
//! is released on every exit path, including `?` early returns.
//!
//! ## Design Principles
//!
//! - Statements are typed values, not SQL text
//! - Tables are described at runtime by a [`TableDescriptor`]
//! - Adapters serialize conflicting transactions
//! - Platform-specific adapters live outside this workspace
//!
//! ## Available Adapters
//!
//! - [`InMemoryAdapter`] - For testing and ephemeral replicas
//!
//! ## Example
//!
//! ```rust
//! # tokio_test_block(async {
//! use satellite_storage::{
//!     row, ColumnType, InMemoryAdapter, Query, SqlValue, Statement, StorageAdapter,
//!     TableDescriptor,
//! };
//!
//! let adapter = InMemoryAdapter::new();
//! let items = TableDescriptor::builder("items")
//!     .column("id", ColumnType::Integer)
//!     .column("name", ColumnType::Text)
//!     .primary_key(["id"])
//!     .build()
//!     .unwrap();
//!
//! let mut tx = adapter.begin().await.unwrap();
//! tx.execute(&Statement::create_table(items)).await.unwrap();
//! tx.execute(&Statement::insert("items", row([("id", SqlValue::from(1)), ("name", "pen".into())])))
//!     .await
//!     .unwrap();
//! tx.commit().await.unwrap();
//!
//! let rows = adapter.read(&Query::table("items")).await.unwrap();
//! assert_eq!(rows.len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod error;
mod memory;
mod schema;
mod statement;
mod value;

pub use adapter::{StorageAdapter, Transaction};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryAdapter;
pub use schema::{ColumnDescriptor, ColumnType, TableDescriptor, TableDescriptorBuilder};
pub use statement::{CmpOp, Condition, OrderBy, Query, SortOrder, Statement};
pub use value::{row, Row, SqlValue};
