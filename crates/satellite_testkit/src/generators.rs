//! Property-based test generators using proptest.
//!
//! Strategies produce values and change histories that respect the
//! invariants the engine relies on: causality tags never repeat, and
//! changes only reference columns of the table they target.

use crate::fixtures::items_table;
use proptest::prelude::*;
use satellite_protocol::{Change, ChangeOp, CausalityTag, ReplicaId, VersionStamp};
use satellite_storage::{row, Row, SqlValue};

/// Strategy for replica identifiers drawn from a small pool, so histories
/// contain several writes per replica.
pub fn replica_id_strategy() -> impl Strategy<Value = ReplicaId> {
    prop::sample::select(vec!["alpha", "beta", "gamma"])
        .prop_map(|name: &str| ReplicaId::new(name))
}

/// Strategy for non-null column values.
pub fn sql_value_strategy() -> impl Strategy<Value = SqlValue> {
    prop_oneof![
        any::<i64>().prop_map(SqlValue::Integer),
        (-1.0e6..1.0e6f64).prop_map(SqlValue::Real),
        "[a-z]{0,12}".prop_map(SqlValue::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(SqlValue::Blob),
    ]
}

/// Strategy for the non-key columns of an `items` row.
pub fn item_values_strategy() -> impl Strategy<Value = Row> {
    (
        prop::option::of("[a-z]{1,8}"),
        prop::option::of(0i64..1_000),
    )
        .prop_map(|(name, qty)| {
            let mut values = Row::new();
            if let Some(name) = name {
                values.insert("name".into(), SqlValue::Text(name));
            }
            if let Some(qty) = qty {
                values.insert("qty".into(), SqlValue::Integer(qty));
            }
            values
        })
}

/// One stamped change against the `items` table.
#[derive(Debug, Clone)]
pub struct StampedChange {
    /// The change.
    pub change: Change,
    /// Stamp of the transaction that made it.
    pub stamp: VersionStamp,
}

fn change_op_strategy() -> impl Strategy<Value = ChangeOp> {
    prop_oneof![
        2 => Just(ChangeOp::Insert),
        3 => Just(ChangeOp::Update),
        1 => Just(ChangeOp::Delete),
    ]
}

/// Strategy for a history of changes to a few `items` keys, written by a
/// few replicas.
///
/// Every change carries its own stamp. Counters are assigned per replica in
/// generation order, so no two changes share a tag. Timestamps come from a
/// narrow range so that ties on the wall clock are common.
pub fn change_history_strategy(
    min_changes: usize,
    max_changes: usize,
) -> impl Strategy<Value = Vec<StampedChange>> {
    prop::collection::vec(
        (
            replica_id_strategy(),
            0i64..3,
            change_op_strategy(),
            item_values_strategy(),
            0u64..8,
        ),
        min_changes..max_changes,
    )
    .prop_map(|raw| {
        let mut counters = std::collections::HashMap::<ReplicaId, u64>::new();
        raw.into_iter()
            .enumerate()
            .map(|(seq, (replica, id, op, values, timestamp))| {
                let counter = counters.entry(replica.clone()).or_insert(0);
                *counter += 1;
                let values = if op == ChangeOp::Delete { Row::new() } else { values };
                StampedChange {
                    change: Change {
                        seq: seq as u64 + 1,
                        table: items_table().name,
                        op,
                        pk: row([("id", SqlValue::Integer(id))]),
                        values,
                    },
                    stamp: VersionStamp::new(CausalityTag::new(replica, *counter), timestamp, 0),
                }
            })
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn history_tags_are_unique(history in change_history_strategy(1, 40)) {
            let tags: HashSet<_> = history.iter().map(|c| c.stamp.tag.clone()).collect();
            prop_assert_eq!(tags.len(), history.len());
        }

        #[test]
        fn deletes_carry_no_values(history in change_history_strategy(1, 40)) {
            for stamped in &history {
                if stamped.change.op == ChangeOp::Delete {
                    prop_assert!(stamped.change.values.is_empty());
                }
            }
        }

        #[test]
        fn item_values_fit_the_table(values in item_values_strategy()) {
            let table = items_table();
            prop_assert!(table.unknown_column(&values).is_none());
            prop_assert!(values.keys().all(|c| !table.is_key_column(c)));
        }

        #[test]
        fn sql_values_are_never_null(value in sql_value_strategy()) {
            prop_assert!(!value.is_null());
        }
    }
}
