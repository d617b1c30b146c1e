//! Shared context of one satellite.
//!
//! Everything the components share lives in one [`SyncContext`], built when
//! the satellite opens and passed to each component explicitly.

use crate::clock::Clock;
use crate::config::SatelliteConfig;
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::INTERNAL_PREFIX;
use crate::migration::Migrator;
use crate::notifier::Notifier;
use crate::state::SyncStats;
use parking_lot::{Mutex, RwLock};
use satellite_protocol::ReplicaId;
use satellite_storage::TableDescriptor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Descriptors of the tables enrolled in sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaRegistry {
    /// Creates a registry from descriptors.
    pub fn from_tables(tables: impl IntoIterator<Item = TableDescriptor>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Returns the descriptor of `name`.
    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    /// Returns true if `name` is tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Enrolls or replaces a table.
    pub fn track(&mut self, descriptor: TableDescriptor) {
        self.tables.insert(descriptor.name.clone(), descriptor);
    }

    /// Removes a table.
    pub fn untrack(&mut self, name: &str) -> Option<TableDescriptor> {
        self.tables.remove(name)
    }

    /// Iterates over the tracked tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// Number of tracked tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// State shared by the components of one satellite.
pub(crate) struct SyncContext {
    pub(crate) config: SatelliteConfig,
    pub(crate) replica_id: ReplicaId,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) migrator: Arc<dyn Migrator>,
    pub(crate) notifier: Notifier,
    /// Signalled after every local commit that produced oplog entries.
    pub(crate) local_writes: Notify,
    registry: RwLock<SchemaRegistry>,
    stats: Mutex<SyncStats>,
    /// Highest counter and timestamp issued by this process, committed or not.
    tag_floor: Mutex<(u64, u64)>,
}

impl SyncContext {
    pub(crate) fn new(
        config: SatelliteConfig,
        replica_id: ReplicaId,
        clock: Arc<dyn Clock>,
        migrator: Arc<dyn Migrator>,
        registry: SchemaRegistry,
    ) -> Self {
        Self {
            config,
            replica_id,
            clock,
            migrator,
            notifier: Notifier::new(),
            local_writes: Notify::new(),
            registry: RwLock::new(registry),
            stats: Mutex::new(SyncStats::default()),
            tag_floor: Mutex::new((0, 0)),
        }
    }

    /// Issues the next `(counter, timestamp)` pair above both the persisted
    /// marks and everything this process handed out before.
    pub(crate) fn issue_tag(&self, counter_mark: u64, timestamp_mark: u64) -> (u64, u64) {
        let mut floor = self.tag_floor.lock();
        let counter = floor.0.max(counter_mark) + 1;
        let timestamp = self.now_millis().max(floor.1.max(timestamp_mark) + 1);
        *floor = (counter, timestamp);
        (counter, timestamp)
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Returns the descriptor of a tracked table.
    pub(crate) fn table(&self, name: &str) -> SatelliteResult<TableDescriptor> {
        if name.starts_with(INTERNAL_PREFIX) {
            return Err(SatelliteError::UnknownTable(name.to_string()));
        }
        self.registry
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SatelliteError::UnknownTable(name.to_string()))
    }

    pub(crate) fn registry(&self) -> SchemaRegistry {
        self.registry.read().clone()
    }

    pub(crate) fn replace_registry(&self, registry: SchemaRegistry) {
        *self.registry.write() = registry;
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record<F: FnOnce(&mut SyncStats)>(&self, update: F) {
        update(&mut self.stats.lock());
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("replica_id", &self.replica_id)
            .field("tables", &self.registry.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_storage::ColumnType;

    fn table(name: &str) -> TableDescriptor {
        TableDescriptor::builder(name)
            .column("id", ColumnType::Integer)
            .primary_key(["id"])
            .build()
            .unwrap()
    }

    #[test]
    fn registry_tracks_tables() {
        let mut registry = SchemaRegistry::from_tables([table("a")]);
        assert!(registry.contains("a"));
        registry.track(table("b"));
        assert_eq!(registry.len(), 2);
        assert!(registry.untrack("a").is_some());
        assert!(registry.get("a").is_none());
        let names: Vec<_> = registry.tables().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
