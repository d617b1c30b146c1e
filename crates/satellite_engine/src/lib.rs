//! # Satellite Engine
//!
//! Local-first replication client: the satellite process.
//!
//! This crate provides:
//! - Oplog capture inside the application's own storage transaction
//! - Causality tags and hybrid timestamps for every local transaction
//! - A connection state machine with backoff, batching and backpressure
//! - Per-column last-writer-wins merge with tombstones and resurrection
//! - Transactional schema migrations with gap detection
//! - Change notifications for local and remote writes
//!
//! ## Architecture
//!
//! ```text
//!  application ──► LocalTransaction ──► user table + oplog + shadow (one tx)
//!                                           │
//!                                           ▼
//!                               ConnectionDriver ◄──► replication service
//!                                           │
//!                  RemoteApplier ◄──────────┘  (inbound transactions)
//!                        │
//!                        ▼
//!               ConflictResolver ──► user table + shadow + cursor (one tx)
//! ```
//!
//! ## Key Invariants
//!
//! - No committed local write without an oplog entry, and no entry without
//!   a committed write
//! - Oplog entries are marked sent only after the service acknowledged them
//! - Causality counters never repeat for a replica, restarts included
//! - Merging is order-independent, so replicas that saw the same
//!   transactions hold the same rows
//!
//! ## Example
//!
//! ```no_run
//! use satellite_engine::{Satellite, SatelliteConfig, StaticMigrator, TcpConnector};
//! use satellite_storage::{row, InMemoryAdapter, SqlValue};
//! use std::sync::Arc;
//!
//! # async fn demo() -> satellite_engine::SatelliteResult<()> {
//! let config = SatelliteConfig::new("127.0.0.1:5133").with_replica_id("laptop");
//! let satellite = Satellite::open(
//!     config.clone(),
//!     Arc::new(InMemoryAdapter::new()),
//!     Arc::new(TcpConnector::new(config.endpoint.clone())),
//!     Arc::new(StaticMigrator::default()),
//! )
//! .await?;
//! satellite.start()?;
//!
//! let mut tx = satellite.begin().await?;
//! tx.insert("items", row([("id", SqlValue::from(1)), ("name", "pen".into())]))
//!     .await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod blob;
mod clock;
mod config;
mod connection;
mod context;
mod error;
mod meta;
mod migration;
mod notifier;
mod oplog;
mod resolver;
mod satellite;
mod shadow;
mod state;
mod tagger;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffConfig, SatelliteConfig};
pub use context::SchemaRegistry;
pub use error::{SatelliteError, SatelliteResult};
pub use meta::{SyncMeta, INTERNAL_PREFIX};
pub use migration::{MigrationCoordinator, Migrator, StaticMigrator};
pub use notifier::{ChangeNotification, ChangeOrigin, ChangedRow, ListenerId, Notifier};
pub use oplog::{OplogEntry, OplogStore};
pub use resolver::{ConflictResolver, Merge, MergeOutcome};
pub use satellite::{LocalTransaction, Satellite};
pub use shadow::{shadow_descriptor, shadow_table_name, ColumnVersion, ShadowRow};
pub use state::{ConnectionState, SatelliteStatus, SyncStats};
pub use tagger::CausalityTagger;
pub use transport::{BoxedStream, Connector, FramedTransport, TcpConnector, TransportStream};
