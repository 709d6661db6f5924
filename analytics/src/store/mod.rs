//! Wide-column store interface.
//!
//! The engine talks to the store through [`ColumnStore`]; drivers live
//! outside this repository. Row keys and clustering keys are ordered vectors
//! of primitive [`DbValue`]s, column names are strings.

pub mod memory;

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: `{0}`")]
    Unavailable(String),
    #[error("unknown column family: `{0}`")]
    UnknownColumnFamily(String),
    #[error("store i/o error: `{0}`")]
    Io(String),
}

/// A primitive value stored in a row key, clustering key or column.
#[derive(Debug, Clone)]
pub enum DbValue {
    Str(String),
    U64(u64),
    Double(f64),
    Uuid(Uuid),
}

impl DbValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DbValue::U64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            DbValue::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            DbValue::Str(_) => 0,
            DbValue::U64(_) => 1,
            DbValue::Double(_) => 2,
            DbValue::Uuid(_) => 3,
        }
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbValue::Str(s) => write!(f, "{s}"),
            DbValue::U64(n) => write!(f, "{n}"),
            DbValue::Double(d) => write!(f, "{d}"),
            DbValue::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        DbValue::Str(value.to_string())
    }
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        DbValue::Str(value)
    }
}

impl From<u64> for DbValue {
    fn from(value: u64) -> Self {
        DbValue::U64(value)
    }
}

impl PartialEq for DbValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DbValue {}

impl PartialOrd for DbValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DbValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DbValue::Str(a), DbValue::Str(b)) => a.cmp(b),
            (DbValue::U64(a), DbValue::U64(b)) => a.cmp(b),
            (DbValue::Double(a), DbValue::Double(b)) => a.total_cmp(b),
            (DbValue::Uuid(a), DbValue::Uuid(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

/// Index comparison pushed down to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Eq,
    Like,
}

/// One indexed-column predicate of a sub-query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPredicate {
    pub column: String,
    pub op: StoreOp,
    pub value: String,
}

impl IndexPredicate {
    pub fn new(column: impl Into<String>, op: StoreOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// Ordered column slice within a row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusteringRange {
    pub start: Vec<DbValue>,
    pub finish: Vec<DbValue>,
}

/// One column of a row: its (composite) name and (composite) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreColumn {
    pub name: Vec<DbValue>,
    pub value: Vec<DbValue>,
}

/// A row returned by a range slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSlice {
    pub key: Vec<DbValue>,
    pub columns: Vec<StoreColumn>,
}

/// Read statistics for one physical table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub table: String,
    pub reads: u64,
    pub read_fails: u64,
}

#[cfg_attr(test, mockall::automock)]
pub trait ColumnStore: Send + Sync {
    fn init(&self) -> Result<(), StoreError>;

    fn set_keyspace(&self, keyspace: &str) -> Result<(), StoreError>;

    /// Returns whether the column family exists and is usable. Absence is
    /// not an error; bring-up uses it to discover optional tables.
    fn use_column_family(&self, cf: &str) -> Result<bool, StoreError>;

    fn get_row(&self, cf: &str, key: &[DbValue]) -> Result<Vec<StoreColumn>, StoreError>;

    fn get_range_slice(
        &self,
        cf: &str,
        keys: &[Vec<DbValue>],
        range: &ClusteringRange,
        predicates: &[IndexPredicate],
    ) -> Result<Vec<RowSlice>, StoreError>;

    fn stats(&self) -> Vec<TableInfo>;

    fn endpoints(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_value_ordering_is_total() {
        let mut values = vec![
            DbValue::U64(5),
            DbValue::Str("b".into()),
            DbValue::U64(2),
            DbValue::Str("a".into()),
            DbValue::Double(1.5),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                DbValue::Str("a".into()),
                DbValue::Str("b".into()),
                DbValue::U64(2),
                DbValue::U64(5),
                DbValue::Double(1.5),
            ]
        );
    }

    #[test]
    fn db_value_display() {
        assert_eq!(DbValue::Str("x".into()).to_string(), "x");
        assert_eq!(DbValue::U64(7).to_string(), "7");
    }
}
