//! Schema migrations.
//!
//! Migrations are ordered [`MigrationRecord`]s supplied by a [`Migrator`].
//! The [`MigrationCoordinator`] applies them:
//!
//! - **Atomic**: one local transaction per record holds the DDL, the shadow
//!   table adjustments and the watermark update
//! - **Sequential**: record `v` only applies on top of watermark `v - 1`
//! - **Gap-checked**: catching up to a server version first checks that
//!   every intervening record is available, so a gap applies nothing
//!
//! Tables created by migrations are enrolled in sync.

use crate::context::{SchemaRegistry, SyncContext};
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::{MetaStore, INTERNAL_PREFIX};
use crate::shadow::ShadowStore;
use parking_lot::RwLock;
use satellite_protocol::MigrationRecord;
use satellite_storage::{Statement, StorageAdapter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Supplies migration records. Owns no sync state.
pub trait Migrator: Send + Sync {
    /// Records with a version above `current`, in version order.
    fn pending(&self, current: u64) -> Vec<MigrationRecord>;
}

/// Migrator backed by an in-memory list.
#[derive(Debug, Default)]
pub struct StaticMigrator {
    records: RwLock<BTreeMap<u64, MigrationRecord>>,
}

impl StaticMigrator {
    /// Creates a migrator holding `records`.
    pub fn new(records: impl IntoIterator<Item = MigrationRecord>) -> Self {
        let migrator = Self::default();
        for record in records {
            migrator.add(record);
        }
        migrator
    }

    /// Adds or replaces a record.
    pub fn add(&self, record: MigrationRecord) {
        self.records.write().insert(record.version, record);
    }

    /// Highest known version, or 0.
    pub fn latest_version(&self) -> u64 {
        self.records.read().keys().next_back().copied().unwrap_or(0)
    }
}

impl Migrator for StaticMigrator {
    fn pending(&self, current: u64) -> Vec<MigrationRecord> {
        self.records
            .read()
            .range(current.saturating_add(1)..)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

/// Applies migration records to the local store.
#[derive(Clone)]
pub struct MigrationCoordinator {
    storage: Arc<dyn StorageAdapter>,
    ctx: Arc<SyncContext>,
}

impl MigrationCoordinator {
    pub(crate) fn new(storage: Arc<dyn StorageAdapter>, ctx: Arc<SyncContext>) -> Self {
        Self { storage, ctx }
    }

    /// Applies the contiguous run of pending records above `current` and
    /// returns the new watermark.
    ///
    /// Records past a missing version are left for later; the server will
    /// report the gap if it matters.
    pub async fn apply_pending(&self, current: u64) -> SatelliteResult<u64> {
        let mut version = current;
        for record in self.ctx.migrator.pending(current) {
            if record.version != version + 1 {
                warn!(
                    watermark = version,
                    next = record.version,
                    "pending migrations are not contiguous; stopping"
                );
                break;
            }
            version = self.apply_record(&record).await?;
        }
        Ok(version)
    }

    /// Brings the watermark from `current` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SatelliteError::SchemaGap`] without touching the store if
    /// any record between the two is unavailable.
    pub async fn catch_up(&self, current: u64, target: u64) -> SatelliteResult<u64> {
        if target <= current {
            return Ok(current);
        }
        let records: Vec<MigrationRecord> = self
            .ctx
            .migrator
            .pending(current)
            .into_iter()
            .filter(|r| r.version <= target)
            .collect();

        let mut expected = current + 1;
        for record in &records {
            if record.version != expected {
                break;
            }
            expected += 1;
        }
        if expected <= target {
            warn!(
                local = current,
                remote = target,
                missing = expected,
                "migration record unavailable"
            );
            return Err(SatelliteError::SchemaGap {
                local: current,
                remote: target,
                missing: expected,
            });
        }

        info!(from = current, to = target, "catching up schema");
        let mut version = current;
        for record in &records {
            version = self.apply_record(record).await?;
        }
        Ok(version)
    }

    /// Handles a record pushed by the server while active.
    ///
    /// Already-applied records are ignored; a record further ahead pulls
    /// the intervening ones from the migrator first.
    pub async fn apply_inline(&self, record: &MigrationRecord) -> SatelliteResult<u64> {
        let current = self.current_version().await?;
        if record.version <= current {
            debug!(version = record.version, current, "ignoring applied migration");
            return Ok(current);
        }
        if record.version > current + 1 {
            self.catch_up(current, record.version - 1).await?;
        }
        self.apply_record(record).await
    }

    /// Applies one record in a single local transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SatelliteError::InvalidMigration`] if the record does not
    /// follow the watermark or touches the engine's own tables. A storage
    /// failure rolls the whole record back.
    pub async fn apply_record(&self, record: &MigrationRecord) -> SatelliteResult<u64> {
        if let Some(table) = record
            .touched_tables()
            .into_iter()
            .find(|t| t.starts_with(INTERNAL_PREFIX))
        {
            return Err(SatelliteError::InvalidMigration {
                version: record.version,
                reason: format!("statement targets internal table {table}"),
            });
        }

        let mut tx = self.storage.begin().await?;
        let meta = MetaStore::load(tx.as_mut()).await?;
        if record.version != meta.schema_version + 1 {
            return Err(SatelliteError::InvalidMigration {
                version: record.version,
                reason: format!("watermark is {}", meta.schema_version),
            });
        }

        let mut registry = self.ctx.registry();
        for statement in &record.statements {
            tx.execute(statement).await?;
            Self::adjust_tracking(tx.as_mut(), &mut registry, statement, record.version).await?;
        }
        MetaStore::set(tx.as_mut(), &[("schema_version", record.version)]).await?;
        tx.commit().await?;

        self.ctx.replace_registry(registry);
        info!(
            version = record.version,
            statements = record.statements.len(),
            "applied migration"
        );
        Ok(record.version)
    }

    /// Current watermark.
    pub async fn current_version(&self) -> SatelliteResult<u64> {
        let mut tx = self.storage.begin().await?;
        Ok(MetaStore::load(tx.as_mut()).await?.schema_version)
    }

    async fn adjust_tracking(
        tx: &mut dyn satellite_storage::Transaction,
        registry: &mut SchemaRegistry,
        statement: &Statement,
        version: u64,
    ) -> SatelliteResult<()> {
        match statement {
            Statement::CreateTable { descriptor, .. } => {
                ShadowStore::create(tx, descriptor).await?;
                MetaStore::save_tracked(tx, descriptor).await?;
                registry.track(descriptor.clone());
            }
            Statement::DropTable { table, .. } => {
                ShadowStore::drop_table(tx, table).await?;
                MetaStore::remove_tracked(tx, table).await?;
                registry.untrack(table);
            }
            Statement::AddColumn { table, column } => {
                let Some(mut descriptor) = registry.get(table).cloned() else {
                    return Err(SatelliteError::InvalidMigration {
                        version,
                        reason: format!("column added to untracked table {table}"),
                    });
                };
                descriptor.columns.push(column.clone());
                MetaStore::save_tracked(tx, &descriptor).await?;
                registry.track(descriptor);
            }
            _ => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator").finish_non_exhaustive()
    }
}
