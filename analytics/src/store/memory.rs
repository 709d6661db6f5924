//! In-memory reference driver for the wide-column interface.
//!
//! Holds index entries and rows in plain maps; used by the test suites and
//! for local development without a cluster. Predicate matching implements
//! the same EQ/LIKE semantics drivers are expected to provide.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{
    ClusteringRange, ColumnStore, DbValue, IndexPredicate, RowSlice, StoreColumn, StoreError,
    StoreOp, TableInfo,
};

/// One index entry. The first clustering element is the in-row time offset;
/// `indexed` carries the column values predicates match against.
#[derive(Debug, Clone, Default)]
pub struct MemoryEntry {
    pub key: Vec<DbValue>,
    pub clustering: Vec<DbValue>,
    pub value: Vec<DbValue>,
    pub indexed: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    column_families: Mutex<HashSet<String>>,
    entries: Mutex<HashMap<String, Vec<MemoryEntry>>>,
    rows: Mutex<HashMap<String, Vec<(Vec<DbValue>, Vec<StoreColumn>)>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column_families(names: &[&str]) -> Self {
        let store = Self::default();
        for name in names {
            store.add_column_family(name);
        }
        store
    }

    pub fn add_column_family(&self, name: &str) {
        self.column_families
            .lock()
            .expect("memory store lock poisoned")
            .insert(name.to_string());
    }

    pub fn insert_entry(&self, cf: &str, entry: MemoryEntry) {
        self.add_column_family(cf);
        self.entries
            .lock()
            .expect("memory store lock poisoned")
            .entry(cf.to_string())
            .or_default()
            .push(entry);
    }

    pub fn insert_row(&self, cf: &str, key: Vec<DbValue>, columns: Vec<(&str, DbValue)>) {
        self.add_column_family(cf);
        let columns = columns
            .into_iter()
            .map(|(name, value)| StoreColumn {
                name: vec![DbValue::Str(name.to_string())],
                value: vec![value],
            })
            .collect();
        self.rows
            .lock()
            .expect("memory store lock poisoned")
            .entry(cf.to_string())
            .or_default()
            .push((key, columns));
    }

    /// Simulates an outage: every call fails until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn like_match(pattern: &str, value: &str) -> bool {
    match (pattern.strip_prefix('%'), pattern.strip_suffix('%')) {
        (Some(_), Some(_)) => {
            let needle = &pattern[1..pattern.len() - 1];
            value.contains(needle)
        }
        (Some(suffix), None) => value.ends_with(suffix),
        (None, Some(prefix)) => value.starts_with(prefix),
        (None, None) => value == pattern,
    }
}

fn range_match(clustering: &[DbValue], range: &ClusteringRange) -> bool {
    let bounds = range.start.len().max(range.finish.len());
    for i in 0..bounds {
        // element 0 is the time offset; bounds address the rest
        let Some(actual) = clustering.get(1 + i) else {
            return true;
        };
        if let Some(low) = range.start.get(i) {
            if actual < low {
                return false;
            }
        }
        if let Some(high) = range.finish.get(i) {
            if actual > high {
                return false;
            }
        }
    }
    true
}

fn predicates_match(indexed: &HashMap<String, String>, predicates: &[IndexPredicate]) -> bool {
    predicates.iter().all(|predicate| {
        let Some(value) = indexed.get(&predicate.column) else {
            return false;
        };
        match predicate.op {
            StoreOp::Eq => value == &predicate.value,
            StoreOp::Like => like_match(&predicate.value, value),
        }
    })
}

impl ColumnStore for MemoryStore {
    fn init(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    fn set_keyspace(&self, _keyspace: &str) -> Result<(), StoreError> {
        self.check_available()
    }

    fn use_column_family(&self, cf: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .column_families
            .lock()
            .expect("memory store lock poisoned")
            .contains(cf))
    }

    fn get_row(&self, cf: &str, key: &[DbValue]) -> Result<Vec<StoreColumn>, StoreError> {
        self.check_available()?;
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows
            .get(cf)
            .and_then(|rows| rows.iter().find(|(k, _)| k == key))
            .map(|(_, columns)| columns.clone())
            .unwrap_or_default())
    }

    fn get_range_slice(
        &self,
        cf: &str,
        keys: &[Vec<DbValue>],
        range: &ClusteringRange,
        predicates: &[IndexPredicate],
    ) -> Result<Vec<RowSlice>, StoreError> {
        self.check_available()?;
        let entries = self.entries.lock().expect("memory store lock poisoned");
        let mut by_key: Vec<RowSlice> = Vec::new();
        for entry in entries.get(cf).map(Vec::as_slice).unwrap_or_default() {
            if !keys.contains(&entry.key)
                || !range_match(&entry.clustering, range)
                || !predicates_match(&entry.indexed, predicates)
            {
                continue;
            }
            let column = StoreColumn {
                name: entry.clustering.clone(),
                value: entry.value.clone(),
            };
            match by_key.iter_mut().find(|row| row.key == entry.key) {
                Some(row) => row.columns.push(column),
                None => by_key.push(RowSlice {
                    key: entry.key.clone(),
                    columns: vec![column],
                }),
            }
        }
        Ok(by_key)
    }

    fn stats(&self) -> Vec<TableInfo> {
        let entries = self.entries.lock().expect("memory store lock poisoned");
        entries
            .iter()
            .map(|(table, rows)| TableInfo {
                table: table.clone(),
                reads: rows.len() as u64,
                read_fails: 0,
            })
            .collect()
    }

    fn endpoints(&self) -> Vec<String> {
        vec!["memory://local".to_string()]
    }
}
