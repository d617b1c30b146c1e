//! Causality tagger.
//!
//! Issues one [`VersionStamp`] per local transaction. The counter and the
//! hybrid clock high-water marks live in the metadata row and are advanced
//! inside the caller's transaction, which makes them survive restarts. The
//! process also keeps its own floor, so a counter handed to a transaction
//! that rolled back is never handed out again.

use crate::context::SyncContext;
use crate::error::SatelliteResult;
use crate::meta::MetaStore;
use satellite_protocol::{Causality, CausalityTag, VersionStamp};
use satellite_storage::Transaction;
use std::sync::Arc;
use tracing::trace;

/// Assigns causality tags to local transactions.
#[derive(Debug, Clone)]
pub struct CausalityTagger {
    ctx: Arc<SyncContext>,
}

impl CausalityTagger {
    pub(crate) fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Returns the next tag for this replica.
    ///
    /// Strictly increasing for the life of the process, even when the
    /// transaction that received a tag rolls back.
    pub async fn next_tag(&self, tx: &mut dyn Transaction) -> SatelliteResult<CausalityTag> {
        Ok(self.next_stamp(tx).await?.tag)
    }

    /// Returns the next stamp: a fresh tag, a hybrid timestamp strictly
    /// above every timestamp issued or observed so far, and the service
    /// cursor applied at this point.
    pub async fn next_stamp(&self, tx: &mut dyn Transaction) -> SatelliteResult<VersionStamp> {
        let meta = MetaStore::load(tx).await?;
        let (counter, timestamp) = self.ctx.issue_tag(meta.counter, meta.last_timestamp);
        MetaStore::set(tx, &[("counter", counter), ("last_timestamp", timestamp)]).await?;

        let stamp = VersionStamp::new(
            CausalityTag::new(self.ctx.replica_id.clone(), counter),
            timestamp,
            meta.server_cursor,
        );
        trace!(tag = %stamp.tag, timestamp, "issued version stamp");
        Ok(stamp)
    }

    /// Raises the counter and clock floors past a remote stamp.
    ///
    /// Called inside the transaction that applies the remote write, so any
    /// later local stamp outranks it.
    pub async fn observe(
        &self,
        tx: &mut dyn Transaction,
        stamp: &VersionStamp,
    ) -> SatelliteResult<()> {
        let meta = MetaStore::load(tx).await?;
        if stamp.tag.counter > meta.counter || stamp.timestamp > meta.last_timestamp {
            MetaStore::set(
                tx,
                &[
                    ("counter", meta.counter.max(stamp.tag.counter)),
                    ("last_timestamp", meta.last_timestamp.max(stamp.timestamp)),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Compares two tags.
    pub fn compare(&self, a: &CausalityTag, b: &CausalityTag) -> Causality {
        a.compare(b)
    }
}
