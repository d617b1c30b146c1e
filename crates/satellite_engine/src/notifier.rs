//! Change notifications for the application.
//!
//! Listeners are invoked after a transaction commits, with every
//! `(table, primary key)` pair the transaction touched. Delivery is at
//! least once per affecting transaction.

use parking_lot::RwLock;
use satellite_storage::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local application transaction.
    Local,
    /// A transaction received from the service.
    Remote,
}

/// One affected row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedRow {
    /// Table name.
    pub table: String,
    /// Primary key.
    pub pk: Row,
}

/// Rows affected by one committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    /// Local or remote.
    pub origin: ChangeOrigin,
    /// Affected rows, without duplicates.
    pub rows: Vec<ChangedRow>,
}

/// Handle returned by [`Notifier::subscribe`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Publishes [`ChangeNotification`]s to registered listeners.
#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl Notifier {
    /// Creates a notifier with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invokes every listener. Empty notifications are dropped.
    pub fn notify(&self, origin: ChangeOrigin, rows: Vec<ChangedRow>) {
        if rows.is_empty() {
            return;
        }
        let mut unique: Vec<ChangedRow> = Vec::with_capacity(rows.len());
        for row in rows {
            if !unique.contains(&row) {
                unique.push(row);
            }
        }
        let notification = ChangeNotification {
            origin,
            rows: unique,
        };
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        trace!(
            origin = ?origin,
            rows = notification.rows.len(),
            listeners = listeners.len(),
            "publishing change notification"
        );
        for listener in listeners {
            listener(&notification);
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
