//! Applies inbound transactions.
//!
//! Each inbound transaction is merged change by change through the
//! [`ConflictResolver`] and lands in one local transaction together with the
//! new server cursor, so it is applied entirely or not at all.

use crate::context::SyncContext;
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::MetaStore;
use crate::notifier::ChangedRow;
use crate::resolver::{ConflictResolver, Merge, MergeOutcome};
use crate::shadow::ShadowStore;
use crate::tagger::CausalityTagger;
use satellite_protocol::{Change, VersionStamp, WireTransaction};
use satellite_storage::{StorageAdapter, TableDescriptor, Transaction};
use std::sync::Arc;
use tracing::{debug, trace};

/// Merges one change into the shadow table and, if `apply` is set, the
/// user table, inside `tx`.
pub(crate) async fn merge_change(
    tx: &mut dyn Transaction,
    table: &TableDescriptor,
    change: &Change,
    stamp: &VersionStamp,
    now: u64,
    apply: bool,
) -> SatelliteResult<Merge> {
    let existing = ShadowStore::load(tx, table, &change.pk).await?;
    let merge = ConflictResolver::merge(table, existing.as_ref(), change, stamp);
    if !merge.changed {
        return Ok(merge);
    }

    if apply {
        if let Some(statement) = &merge.statement {
            tx.execute(statement).await?;
        }
    }

    let tombstoned_at = if merge.shadow.is_tombstoned() {
        let previous = match &existing {
            Some(shadow) if shadow.is_tombstoned() => {
                ShadowStore::tombstoned_at(tx, table, &change.pk).await?
            }
            _ => None,
        };
        Some(previous.unwrap_or(now))
    } else {
        None
    };
    ShadowStore::save(tx, table, &merge.shadow, tombstoned_at).await?;
    Ok(merge)
}

/// What applying one inbound transaction did.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ApplyReport {
    /// Server cursor after the transaction.
    pub(crate) cursor: u64,
    /// Rows whose user-visible state changed.
    pub(crate) rows: Vec<ChangedRow>,
    /// The transaction was at or below the cursor and skipped.
    pub(crate) duplicate: bool,
}

/// Applies inbound transactions to the local store.
#[derive(Clone)]
pub(crate) struct RemoteApplier {
    storage: Arc<dyn StorageAdapter>,
    ctx: Arc<SyncContext>,
    tagger: CausalityTagger,
}

impl RemoteApplier {
    pub(crate) fn new(storage: Arc<dyn StorageAdapter>, ctx: Arc<SyncContext>) -> Self {
        let tagger = CausalityTagger::new(Arc::clone(&ctx));
        Self {
            storage,
            ctx,
            tagger,
        }
    }

    /// Applies `txn` atomically and advances the server cursor.
    ///
    /// Transactions at or below the cursor are skipped. Echoes of this
    /// replica's own writes advance the cursor without being re-applied.
    ///
    /// # Errors
    ///
    /// A transaction without a commit sequence, or touching a table that is
    /// not tracked, is a protocol violation and applies nothing.
    pub(crate) async fn apply(&self, txn: &WireTransaction) -> SatelliteResult<ApplyReport> {
        let commit_seq = txn.commit_seq.ok_or_else(|| {
            SatelliteError::violation("inbound transaction has no commit sequence")
        })?;

        let mut tx = self.storage.begin().await?;
        let meta = MetaStore::load(tx.as_mut()).await?;
        if commit_seq <= meta.server_cursor {
            trace!(commit_seq, cursor = meta.server_cursor, "skipping applied transaction");
            return Ok(ApplyReport {
                cursor: meta.server_cursor,
                rows: Vec::new(),
                duplicate: true,
            });
        }

        let mut report = ApplyReport {
            cursor: commit_seq,
            ..ApplyReport::default()
        };

        if txn.tag.replica_id != self.ctx.replica_id {
            let stamp = txn.stamp();
            self.tagger.observe(tx.as_mut(), &stamp).await?;
            let now = self.ctx.now_millis();
            let mut outcomes = Vec::with_capacity(txn.changes.len());

            for change in &txn.changes {
                let table = self.ctx.table(&change.table).map_err(|_| {
                    SatelliteError::violation(format!(
                        "change for untracked table {}",
                        change.table
                    ))
                })?;
                table.key_of(&change.pk).map_err(|e| {
                    SatelliteError::violation(format!("bad primary key: {e}"))
                })?;

                let merge = merge_change(tx.as_mut(), &table, change, &stamp, now, true).await?;
                debug!(
                    table = %change.table,
                    op = %change.op,
                    tag = %stamp.tag,
                    outcome = %merge.outcome,
                    "merged remote change"
                );
                if merge.statement.is_some() {
                    report.rows.push(ChangedRow {
                        table: change.table.clone(),
                        pk: change.pk.clone(),
                    });
                }
                outcomes.push((merge.outcome, merge.changed));
            }

            MetaStore::set(tx.as_mut(), &[("server_cursor", commit_seq)]).await?;
            tx.commit().await?;
            self.record(&outcomes);
        } else {
            trace!(commit_seq, "own transaction echoed back");
            MetaStore::set(tx.as_mut(), &[("server_cursor", commit_seq)]).await?;
            tx.commit().await?;
            self.ctx.record(|s| s.transactions_received += 1);
        }

        Ok(report)
    }

    fn record(&self, outcomes: &[(MergeOutcome, bool)]) {
        self.ctx.record(|stats| {
            stats.transactions_received += 1;
            for &(outcome, changed) in outcomes {
                match outcome {
                    MergeOutcome::Stale => stats.changes_stale += 1,
                    MergeOutcome::Applied | MergeOutcome::Deleted => stats.changes_applied += 1,
                    MergeOutcome::ConflictResolved => {
                        stats.conflicts_resolved += 1;
                        if changed {
                            stats.changes_applied += 1;
                        }
                    }
                    MergeOutcome::Resurrected => {
                        stats.changes_applied += 1;
                        stats.rows_resurrected += 1;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for RemoteApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApplier")
            .field("replica_id", &self.ctx.replica_id)
            .finish_non_exhaustive()
    }
}
