//! Conflict resolver.
//!
//! Merges one incoming change into the shadow row of its primary key with
//! last-writer-wins per column. The winner of every contest is the write
//! with the higher [`VersionStamp::priority`], that is
//! `(timestamp, replica_id, counter)`.
//!
//! Deletes are tombstone writes. A tombstone removes every column written
//! at or before it; a column write only lands if it is newer than both the
//! column and the tombstone. A write newer than the tombstone therefore
//! resurrects the row with just the columns written after the delete.
//!
//! The merge is a pure function of the shadow row and the change, and the
//! resulting shadow state does not depend on the order in which changes
//! arrive. Conflicts are a normal outcome, never an error.

use crate::shadow::{ColumnVersion, ShadowRow};
use satellite_protocol::{Causality, Change, ChangeOp, VersionStamp};
use satellite_storage::{Condition, Statement, TableDescriptor};
use std::fmt;

/// What a merge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    /// The change landed without contest.
    Applied,
    /// The change was already known or causally superseded; nothing changed.
    Stale,
    /// Concurrent writes were resolved per column. The change may have lost
    /// every contest, in which case nothing changed either.
    ConflictResolved,
    /// A write newer than the tombstone brought the row back.
    Resurrected,
    /// The row was deleted.
    Deleted,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeOutcome::Applied => "applied",
            MergeOutcome::Stale => "stale",
            MergeOutcome::ConflictResolved => "conflict-resolved",
            MergeOutcome::Resurrected => "resurrected",
            MergeOutcome::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Result of merging one change.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    /// Classification.
    pub outcome: MergeOutcome,
    /// The shadow row after the merge.
    pub shadow: ShadowRow,
    /// Statement that brings the user table in line, if any.
    pub statement: Option<Statement>,
    /// Whether the shadow row changed and must be written back.
    pub changed: bool,
}

/// Merges changes into shadow rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Merges `change`, stamped `stamp`, into `existing`.
    ///
    /// `existing` is `None` when nothing is known about the key; the change
    /// is then applied directly and a shadow row created for it.
    pub fn merge(
        table: &TableDescriptor,
        existing: Option<&ShadowRow>,
        change: &Change,
        stamp: &VersionStamp,
    ) -> Merge {
        let mut shadow = existing
            .cloned()
            .unwrap_or_else(|| ShadowRow::new(change.pk.clone()));
        shadow.pk = change.pk.clone();

        let was_live = existing.is_some_and(ShadowRow::is_live);
        let had_tombstone = existing.is_some_and(|s| s.tombstone.is_some());
        let mut contest = Contest::default();

        match change.op {
            ChangeOp::Delete => merge_delete(&mut shadow, stamp, was_live, &mut contest),
            ChangeOp::Insert | ChangeOp::Update => {
                merge_write(table, &mut shadow, change, stamp, &mut contest)
            }
        }

        let is_live = shadow.is_live();
        let outcome = if !contest.changed {
            if contest.concurrent {
                MergeOutcome::ConflictResolved
            } else {
                MergeOutcome::Stale
            }
        } else if change.op == ChangeOp::Delete {
            if is_live {
                MergeOutcome::ConflictResolved
            } else {
                MergeOutcome::Deleted
            }
        } else if !was_live && had_tombstone && is_live {
            MergeOutcome::Resurrected
        } else if contest.lost > 0 || contest.concurrent {
            MergeOutcome::ConflictResolved
        } else {
            MergeOutcome::Applied
        };

        let statement = if !contest.changed {
            None
        } else if is_live {
            Some(Statement::upsert(
                table.name.clone(),
                shadow.to_user_row(table),
            ))
        } else {
            Some(Statement::delete(
                table.name.clone(),
                Condition::matching(&shadow.pk),
            ))
        };

        Merge {
            outcome,
            shadow,
            statement,
            changed: contest.changed,
        }
    }
}

#[derive(Debug, Default)]
struct Contest {
    changed: bool,
    lost: usize,
    concurrent: bool,
}

/// `stamp` lands over `current` if it is at least as recent. Equal stamps
/// are the same transaction writing the key more than once.
fn lands_over(stamp: &VersionStamp, current: &VersionStamp) -> bool {
    !current.beats(stamp)
}

/// Two stamps with the same tag belong to the same transaction, whatever
/// commit sequence either copy carries.
fn same_write(a: &VersionStamp, b: &VersionStamp) -> bool {
    a.tag == b.tag
}

fn concurrent(current: Option<&VersionStamp>, stamp: &VersionStamp) -> bool {
    current.is_some_and(|c| c.causality(stamp) == Causality::Concurrent)
}

fn merge_delete(
    shadow: &mut ShadowRow,
    stamp: &VersionStamp,
    was_live: bool,
    contest: &mut Contest,
) {
    let advances = shadow
        .tombstone
        .as_ref()
        .map_or(true, |t| lands_over(stamp, t));
    if !advances {
        contest.lost += 1;
        contest.concurrent |= concurrent(shadow.tombstone.as_ref(), stamp);
        return;
    }
    if !shadow.tombstone.as_ref().is_some_and(|t| same_write(t, stamp)) {
        shadow.tombstone = Some(stamp.clone());
        contest.changed = true;
    }

    let before = shadow.columns.len();
    shadow.columns.retain(|_, c| c.stamp.beats(stamp));
    if shadow.columns.len() != before {
        contest.changed = true;
    }
    if shadow.inserted.as_ref().is_some_and(|i| !i.beats(stamp)) {
        shadow.inserted = None;
        contest.changed = true;
    }
    if was_live && shadow.is_live() {
        contest.concurrent = true;
    }
}

fn merge_write(
    table: &TableDescriptor,
    shadow: &mut ShadowRow,
    change: &Change,
    stamp: &VersionStamp,
    contest: &mut Contest,
) {
    if let Some(tombstone) = &shadow.tombstone {
        if !lands_over(stamp, tombstone) {
            contest.lost += change.values.len().max(1);
            contest.concurrent |= concurrent(Some(tombstone), stamp);
            return;
        }
    }

    if change.op == ChangeOp::Insert {
        let lands = shadow
            .inserted
            .as_ref()
            .map_or(true, |i| lands_over(stamp, i));
        if lands && !shadow.inserted.as_ref().is_some_and(|i| same_write(i, stamp)) {
            shadow.inserted = Some(stamp.clone());
            contest.changed = true;
        }
    }

    for (column, value) in &change.values {
        if table.is_key_column(column) || !table.has_column(column) {
            continue;
        }
        let incoming = ColumnVersion {
            value: value.clone(),
            stamp: stamp.clone(),
        };
        match shadow.columns.get(column) {
            Some(current) if !lands_over(stamp, &current.stamp) => {
                contest.lost += 1;
                if current.stamp.causality(stamp) == Causality::Concurrent {
                    contest.concurrent = true;
                }
            }
            Some(current) => {
                let same = same_write(&current.stamp, stamp);
                if !same && current.stamp.causality(stamp) == Causality::Concurrent {
                    contest.concurrent = true;
                }
                if !same || current.value != incoming.value {
                    shadow.columns.insert(column.clone(), incoming);
                    contest.changed = true;
                }
            }
            None => {
                shadow.columns.insert(column.clone(), incoming);
                contest.changed = true;
            }
        }
    }
}
