//! Property tests: merge results do not depend on delivery order.

use proptest::prelude::*;
use satellite_engine::{ConflictResolver, MergeOutcome, ShadowRow};
use satellite_storage::TableDescriptor;
use satellite_testkit::{change_history_strategy, items_table, PropTestConfig, StampedChange};
use std::collections::BTreeMap;

/// Merges `history` in the given order and returns the shadow row of every
/// key that was touched.
fn replay(table: &TableDescriptor, history: &[StampedChange]) -> BTreeMap<i64, ShadowRow> {
    let mut rows: BTreeMap<i64, ShadowRow> = BTreeMap::new();
    for stamped in history {
        let id = stamped.change.pk["id"].as_integer().unwrap();
        let merge = ConflictResolver::merge(table, rows.get(&id), &stamped.change, &stamped.stamp);
        if merge.changed {
            rows.insert(id, merge.shadow);
        }
    }
    rows
}

fn live_rows(
    table: &TableDescriptor,
    rows: &BTreeMap<i64, ShadowRow>,
) -> Vec<satellite_storage::Row> {
    rows.values()
        .filter(|shadow| shadow.is_live())
        .map(|shadow| shadow.to_user_row(table))
        .collect()
}

fn history_and_permutation() -> impl Strategy<Value = (Vec<StampedChange>, Vec<StampedChange>)> {
    change_history_strategy(1, 24)
        .prop_flat_map(|history| (Just(history.clone()), Just(history).prop_shuffle()))
}

proptest! {
    #![proptest_config(PropTestConfig::default().to_proptest_config())]

    #[test]
    fn any_delivery_order_converges((history, shuffled) in history_and_permutation()) {
        let table = items_table();
        let left = replay(&table, &history);
        let right = replay(&table, &shuffled);

        prop_assert_eq!(live_rows(&table, &left), live_rows(&table, &right));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn redelivery_changes_nothing(history in change_history_strategy(1, 24)) {
        let table = items_table();
        let once = replay(&table, &history);

        let mut rows = once.clone();
        for stamped in &history {
            let id = stamped.change.pk["id"].as_integer().unwrap();
            let merge =
                ConflictResolver::merge(&table, rows.get(&id), &stamped.change, &stamped.stamp);
            // A redelivered loser may still report its conflict, but nothing moves
            prop_assert!(matches!(
                merge.outcome,
                MergeOutcome::Stale | MergeOutcome::ConflictResolved
            ));
            prop_assert!(!merge.changed);
            prop_assert!(merge.statement.is_none());
            if merge.changed {
                rows.insert(id, merge.shadow);
            }
        }
        prop_assert_eq!(once, rows);
    }

    #[test]
    fn dead_rows_keep_only_a_tombstone(history in change_history_strategy(1, 24)) {
        let table = items_table();
        for shadow in replay(&table, &history).values() {
            if !shadow.is_live() {
                prop_assert!(shadow.tombstone.is_some());
                prop_assert!(shadow.columns.is_empty());
            }
            if let Some(tombstone) = &shadow.tombstone {
                for column in shadow.columns.values() {
                    prop_assert!(column.stamp.beats(tombstone));
                }
            }
        }
    }
}
