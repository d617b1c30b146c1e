//! Typed statements and queries.

use crate::schema::{ColumnDescriptor, TableDescriptor};
use crate::value::{Row, SqlValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator used in a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// `=` (`NULL = NULL` matches).
    Eq,
    /// `<>`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
}

/// A single `column <op> value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Column name.
    pub column: String,
    /// Operator.
    pub op: CmpOp,
    /// Right-hand side.
    pub value: SqlValue,
}

impl Condition {
    /// `column = value`.
    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::new(column, CmpOp::Eq, value)
    }

    /// `column <op> value`.
    pub fn new(column: impl Into<String>, op: CmpOp, value: impl Into<SqlValue>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// One equality condition per column of `key`.
    pub fn matching(key: &Row) -> Vec<Condition> {
        key.iter()
            .map(|(column, value)| Condition::eq(column.clone(), value.clone()))
            .collect()
    }

    /// Evaluates the condition against `row`. Absent columns read as `NULL`.
    pub fn matches(&self, row: &Row) -> bool {
        let lhs = row.get(&self.column).unwrap_or(&SqlValue::Null);
        let ord = lhs.sql_cmp(&self.value);
        match self.op {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// `ORDER BY column direction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column name.
    pub column: String,
    /// Direction.
    pub order: SortOrder,
}

/// A statement that changes the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// `CREATE TABLE`.
    CreateTable {
        /// Table shape.
        descriptor: TableDescriptor,
        /// Succeed silently when the table exists.
        if_not_exists: bool,
    },
    /// `DROP TABLE`.
    DropTable {
        /// Table name.
        table: String,
        /// Succeed silently when the table is missing.
        if_exists: bool,
    },
    /// `ALTER TABLE .. ADD COLUMN`.
    AddColumn {
        /// Table name.
        table: String,
        /// New column.
        column: ColumnDescriptor,
    },
    /// `INSERT`; fails on a duplicate primary key.
    Insert {
        /// Table name.
        table: String,
        /// Row to insert; absent columns become `NULL`.
        row: Row,
    },
    /// `INSERT OR REPLACE`; replaces the whole row.
    Upsert {
        /// Table name.
        table: String,
        /// Row to write; absent columns become `NULL`.
        row: Row,
    },
    /// `UPDATE .. SET .. WHERE`.
    Update {
        /// Table name.
        table: String,
        /// Columns to assign.
        set: Row,
        /// Conjunction of predicates.
        filter: Vec<Condition>,
    },
    /// `DELETE .. WHERE`.
    Delete {
        /// Table name.
        table: String,
        /// Conjunction of predicates.
        filter: Vec<Condition>,
    },
}

impl Statement {
    /// `CREATE TABLE` (fails if it exists).
    pub fn create_table(descriptor: TableDescriptor) -> Self {
        Statement::CreateTable {
            descriptor,
            if_not_exists: false,
        }
    }

    /// `CREATE TABLE IF NOT EXISTS`.
    pub fn create_table_if_not_exists(descriptor: TableDescriptor) -> Self {
        Statement::CreateTable {
            descriptor,
            if_not_exists: true,
        }
    }

    /// `INSERT`.
    pub fn insert(table: impl Into<String>, row: Row) -> Self {
        Statement::Insert {
            table: table.into(),
            row,
        }
    }

    /// `INSERT OR REPLACE`.
    pub fn upsert(table: impl Into<String>, row: Row) -> Self {
        Statement::Upsert {
            table: table.into(),
            row,
        }
    }

    /// `UPDATE`.
    pub fn update(table: impl Into<String>, set: Row, filter: Vec<Condition>) -> Self {
        Statement::Update {
            table: table.into(),
            set,
            filter,
        }
    }

    /// `DELETE`.
    pub fn delete(table: impl Into<String>, filter: Vec<Condition>) -> Self {
        Statement::Delete {
            table: table.into(),
            filter,
        }
    }

    /// Returns true for schema statements.
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable { .. } | Statement::DropTable { .. } | Statement::AddColumn { .. }
        )
    }

    /// The table the statement targets.
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable { descriptor, .. } => &descriptor.name,
            Statement::DropTable { table, .. }
            | Statement::AddColumn { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Upsert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }
}

/// A `SELECT * FROM table WHERE .. ORDER BY .. LIMIT ..`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Table name.
    pub table: String,
    /// Conjunction of predicates.
    pub filter: Vec<Condition>,
    /// Optional ordering.
    pub order_by: Option<OrderBy>,
    /// Optional row limit.
    pub limit: Option<usize>,
}

impl Query {
    /// Selects every row of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds a predicate.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter.push(condition);
        self
    }

    /// Adds several predicates.
    pub fn filters(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.filter.extend(conditions);
        self
    }

    /// Orders by `column`.
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            order,
        });
        self
    }

    /// Limits the number of returned rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::row;

    #[test]
    fn condition_eval() {
        let r = row([("a", SqlValue::from(5)), ("b", "x".into())]);
        assert!(Condition::eq("a", 5).matches(&r));
        assert!(Condition::new("a", CmpOp::Gt, 4).matches(&r));
        assert!(!Condition::new("a", CmpOp::Lt, 5).matches(&r));
        assert!(Condition::new("a", CmpOp::Le, 5).matches(&r));
        assert!(Condition::new("b", CmpOp::Ne, "y").matches(&r));
    }

    #[test]
    fn absent_column_is_null() {
        let r = row([("a", SqlValue::from(5))]);
        assert!(Condition::eq("missing", SqlValue::Null).matches(&r));
        assert!(!Condition::new("missing", CmpOp::Gt, 0).matches(&r));
    }

    #[test]
    fn ddl_classification() {
        let t = TableDescriptor::builder("t")
            .column("id", crate::ColumnType::Integer)
            .primary_key(["id"])
            .build()
            .unwrap();
        assert!(Statement::create_table(t).is_ddl());
        assert!(!Statement::delete("t", vec![]).is_ddl());
        assert_eq!(Statement::delete("t", vec![]).table(), "t");
    }
}
