//! Process-wide data-retention settings.
//!
//! TTLs come from a system-object row in the store, read once at bring-up
//! under a bounded retry policy; after exhaustion the compile-time defaults
//! apply and the engine runs degraded. The map is published once and read
//! everywhere, never locked.

use thiserror::Error;
use tracing::{error, warn};

use crate::schema::{
    self, TableKind, SYSTEM_OBJECT_ANALYTICS_ROW, SYSTEM_OBJECT_CONFIG_AUDIT_TTL,
    SYSTEM_OBJECT_FLOW_DATA_TTL, SYSTEM_OBJECT_GLOBAL_DATA_TTL, SYSTEM_OBJECT_STATS_DATA_TTL,
    SYSTEM_OBJECT_TABLE_CF,
};
use crate::store::{ColumnStore, DbValue};
use crate::utils::retry::retry;
pub use crate::utils::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum TtlBootstrapError {
    #[error("system object row unavailable: `{0}`")]
    RowUnavailable(String),
    #[error("system object row is missing ttl columns")]
    Incomplete,
}

/// Retention per data class, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlMap {
    pub global_hours: u64,
    pub flow_hours: u64,
    pub stats_hours: u64,
    pub config_audit_hours: u64,
}

impl Default for TtlMap {
    fn default() -> Self {
        Self {
            global_hours: 48,
            flow_hours: 2,
            stats_hours: 168,
            config_audit_hours: 2160,
        }
    }
}

impl TtlMap {
    /// TTL applying to queries against `table`, in hours.
    pub fn hours_for_table(&self, table: &str) -> u64 {
        match schema::classify(table) {
            TableKind::Stat => self.stats_hours,
            TableKind::Flow | TableKind::Session => self.flow_hours,
            TableKind::Object => self.config_audit_hours,
            TableKind::Message | TableKind::ObjectValue => self.global_hours,
        }
    }

    pub fn usec_for_table(&self, table: &str) -> u64 {
        self.hours_for_table(table) * 3_600 * 1_000_000
    }
}

/// Reads the TTL columns of the analytics system object. All four must be
/// present for the read to count; partial rows are retried like failures.
pub fn bootstrap_ttl_map(
    store: &dyn ColumnStore,
    policy: RetryPolicy,
) -> Result<TtlMap, TtlBootstrapError> {
    retry(policy, || read_ttl_row(store))
}

/// Reads TTLs, falling back to [`TtlMap::default`] after retry exhaustion.
pub fn ttl_map_or_default(store: &dyn ColumnStore, policy: RetryPolicy) -> TtlMap {
    match bootstrap_ttl_map(store, policy) {
        Ok(map) => map,
        Err(err) => {
            warn!(%err, "ttl bootstrap failed, using default ttl values");
            TtlMap::default()
        }
    }
}

fn read_ttl_row(store: &dyn ColumnStore) -> Result<TtlMap, TtlBootstrapError> {
    let key = [DbValue::Str(SYSTEM_OBJECT_ANALYTICS_ROW.to_string())];
    let columns = store
        .get_row(SYSTEM_OBJECT_TABLE_CF, &key)
        .map_err(|err| TtlBootstrapError::RowUnavailable(err.to_string()))?;

    let mut global = None;
    let mut flow = None;
    let mut stats = None;
    let mut config_audit = None;
    for column in &columns {
        let Some(name) = column.name.first().and_then(|n| n.as_str()) else {
            error!("system object column with non-string name, skipping");
            continue;
        };
        let value = column.value.first().and_then(|v| v.as_u64());
        match name {
            SYSTEM_OBJECT_GLOBAL_DATA_TTL => global = value,
            SYSTEM_OBJECT_FLOW_DATA_TTL => flow = value,
            SYSTEM_OBJECT_STATS_DATA_TTL => stats = value,
            SYSTEM_OBJECT_CONFIG_AUDIT_TTL => config_audit = value,
            _ => {}
        }
    }
    match (global, flow, stats, config_audit) {
        (Some(global_hours), Some(flow_hours), Some(stats_hours), Some(config_audit_hours)) => {
            Ok(TtlMap {
                global_hours,
                flow_hours,
                stats_hours,
                config_audit_hours,
            })
        }
        _ => Err(TtlBootstrapError::Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockColumnStore, StoreColumn, StoreError};
    use std::time::Duration;

    fn ttl_column(name: &str, hours: u64) -> StoreColumn {
        StoreColumn {
            name: vec![DbValue::Str(name.to_string())],
            value: vec![DbValue::U64(hours)],
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn bootstrap_reads_all_four_ttls() {
        let mut store = MockColumnStore::new();
        store.expect_get_row().returning(|_, _| {
            Ok(vec![
                ttl_column(SYSTEM_OBJECT_GLOBAL_DATA_TTL, 24),
                ttl_column(SYSTEM_OBJECT_FLOW_DATA_TTL, 1),
                ttl_column(SYSTEM_OBJECT_STATS_DATA_TTL, 12),
                ttl_column(SYSTEM_OBJECT_CONFIG_AUDIT_TTL, 720),
            ])
        });
        let map = bootstrap_ttl_map(&store, quick_policy()).unwrap();
        assert_eq!(map.global_hours, 24);
        assert_eq!(map.flow_hours, 1);
        assert_eq!(map.stats_hours, 12);
        assert_eq!(map.config_audit_hours, 720);
    }

    #[test]
    fn incomplete_row_falls_back_to_defaults() {
        let mut store = MockColumnStore::new();
        store
            .expect_get_row()
            .returning(|_, _| Ok(vec![ttl_column(SYSTEM_OBJECT_GLOBAL_DATA_TTL, 24)]));
        let map = ttl_map_or_default(&store, quick_policy());
        assert_eq!(map, TtlMap::default());
    }

    #[test]
    fn store_failure_falls_back_to_defaults() {
        let mut store = MockColumnStore::new();
        store
            .expect_get_row()
            .returning(|_, _| Err(StoreError::Unavailable("down".into())));
        let map = ttl_map_or_default(&store, quick_policy());
        assert_eq!(map, TtlMap::default());
    }

    #[test]
    fn ttl_selection_by_table_class() {
        let map = TtlMap::default();
        assert_eq!(map.hours_for_table("MessageTable"), map.global_hours);
        assert_eq!(map.hours_for_table("FlowSeriesTable"), map.flow_hours);
        assert_eq!(map.hours_for_table("SessionRecordTable"), map.flow_hours);
        assert_eq!(map.hours_for_table("StatTable.X.y"), map.stats_hours);
        assert_eq!(map.hours_for_table("ObjectVNTable"), map.config_audit_hours);
    }
}
