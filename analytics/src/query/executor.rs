//! WHERE/SELECT execution against the store.
//!
//! Sub-queries of a chunk run on parallel threads. Gathered results merge
//! with set algebra: message, object and flow tables OR their sub-queries,
//! session tables AND them, and stat tables union the per-generation
//! conjunctions (current and legacy schemas are queried separately).

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use serde_json::Value;
use tracing::debug;

use super::select_plan::{AggOp, SelectPlan};
use super::where_plan::{SchemaGeneration, WherePlan, WhereSubQuery};
use super::{json_value_to_string, AnalyticsQuery, QueryError};
use crate::schema::{TableKind, MESSAGE_TABLE_CF, ROW_TIME_BITS, SESSION_TABLE_CF};
use crate::sink::{ResultBuffer, ResultRow, ResultUnit, RowMap, RowMetadata, RowMultimap};
use crate::store::{ColumnStore, DbValue, StoreError};

/// Column carrying the row timestamp in buffer outputs.
pub const TIMESTAMP_COLUMN: &str = "MessageTS";
/// Column carrying the object id in object-value outputs.
pub const OBJECT_ID_COLUMN: &str = "ObjectId";

/// Executes every sub-query of the plan over `[from, end)` and applies the
/// table's set algebra to the gathered results.
pub fn execute_where(
    store: &dyn ColumnStore,
    plan: &WherePlan,
    kind: TableKind,
    from: u64,
    end: u64,
) -> Result<Vec<ResultUnit>, QueryError> {
    if from >= end || plan.sub_queries.is_empty() {
        return Ok(Vec::new());
    }
    let results: Vec<Result<Vec<ResultUnit>, StoreError>> = thread::scope(|scope| {
        let handles: Vec<_> = plan
            .sub_queries
            .iter()
            .map(|sub_query| scope.spawn(move || run_sub_query(store, sub_query, from, end)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("sub-query thread panicked"))
            .collect()
    });

    let mut current = Vec::new();
    let mut legacy = Vec::new();
    for (sub_query, result) in plan.sub_queries.iter().zip(results) {
        let units = result?;
        debug!(cf = %sub_query.cf_name, rows = units.len(), "sub-query done");
        match sub_query.generation {
            SchemaGeneration::Current => current.push(units),
            SchemaGeneration::Legacy => legacy.push(units),
        }
    }

    Ok(match kind {
        TableKind::Message | TableKind::Object | TableKind::ObjectValue | TableKind::Flow => {
            op_or(current)
        }
        TableKind::Session => op_and(current),
        TableKind::Stat => {
            let mut generations = Vec::new();
            if !legacy.is_empty() {
                generations.push(op_and(legacy));
            }
            generations.push(op_and(current));
            op_or(generations)
        }
    })
}

fn run_sub_query(
    store: &dyn ColumnStore,
    sub_query: &WhereSubQuery,
    from: u64,
    end: u64,
) -> Result<Vec<ResultUnit>, StoreError> {
    let first_bucket = from >> ROW_TIME_BITS;
    let last_bucket = (end - 1) >> ROW_TIME_BITS;
    let keys: Vec<Vec<DbValue>> = (first_bucket..=last_bucket)
        .map(|bucket| {
            let mut key = Vec::with_capacity(1 + sub_query.row_key_suffix.len());
            key.push(DbValue::U64(bucket));
            key.extend(sub_query.row_key_suffix.iter().cloned());
            key
        })
        .collect();

    let rows = store.get_range_slice(
        &sub_query.cf_name,
        &keys,
        &sub_query.range,
        &sub_query.predicates,
    )?;
    let mut units = Vec::new();
    for row in rows {
        let Some(bucket) = row.key.first().and_then(|v| v.as_u64()) else {
            continue;
        };
        for column in row.columns {
            let Some(offset) = column.name.first().and_then(|v| v.as_u64()) else {
                continue;
            };
            let timestamp = (bucket << ROW_TIME_BITS) | offset;
            if timestamp < from || timestamp >= end {
                continue;
            }
            units.push(ResultUnit {
                timestamp,
                info: column.value,
            });
        }
    }
    units.sort();
    units.dedup();
    Ok(units)
}

/// Union; deterministic order by (timestamp, tuple).
pub fn op_or(inputs: Vec<Vec<ResultUnit>>) -> Vec<ResultUnit> {
    let mut out: Vec<ResultUnit> = inputs.into_iter().flatten().collect();
    out.sort();
    out.dedup();
    out
}

/// Intersection; deterministic order by (timestamp, tuple).
pub fn op_and(inputs: Vec<Vec<ResultUnit>>) -> Vec<ResultUnit> {
    let mut iter = inputs.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut acc: BTreeSet<ResultUnit> = first.into_iter().collect();
    for input in iter {
        let other: BTreeSet<ResultUnit> = input.into_iter().collect();
        acc = acc.intersection(&other).cloned().collect();
    }
    acc.into_iter().collect()
}

/// Output of the select phase: a flat buffer, or for stat queries the
/// multi-map keyed by the grouping tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutput {
    Buffer(ResultBuffer),
    Map(RowMultimap),
}

pub fn execute_select(
    store: &dyn ColumnStore,
    query: &AnalyticsQuery,
    where_result: &[ResultUnit],
) -> Result<SelectOutput, QueryError> {
    match query.kind {
        TableKind::Message | TableKind::Object => Ok(SelectOutput::Buffer(select_rows(
            store,
            MESSAGE_TABLE_CF,
            &query.select_plan,
            where_result,
        )?)),
        TableKind::ObjectValue => {
            let mut buffer = ResultBuffer::new();
            for unit in where_result {
                let Some(object_id) = unit.object_id() else {
                    continue;
                };
                let mut row = RowMap::new();
                row.insert(OBJECT_ID_COLUMN.to_string(), object_id.to_string());
                buffer.push(ResultRow {
                    row,
                    metadata: RowMetadata {
                        timestamp: unit.timestamp,
                    },
                });
            }
            Ok(SelectOutput::Buffer(buffer))
        }
        TableKind::Session | TableKind::Flow => Ok(SelectOutput::Buffer(select_rows(
            store,
            SESSION_TABLE_CF,
            &query.select_plan,
            where_result,
        )?)),
        TableKind::Stat => Ok(SelectOutput::Map(select_stats(query, where_result)?)),
    }
}

fn select_rows(
    store: &dyn ColumnStore,
    cf: &str,
    plan: &SelectPlan,
    where_result: &[ResultUnit],
) -> Result<ResultBuffer, QueryError> {
    let mut buffer = ResultBuffer::new();
    for unit in where_result {
        let Some(uuid) = unit.uuid() else {
            continue;
        };
        let columns = store.get_row(cf, &[DbValue::Uuid(uuid)])?;
        let mut row = RowMap::new();
        for column in columns {
            let Some(name) = column.name.first().and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(value) = column.value.first() else {
                continue;
            };
            if plan.is_selected(name) {
                row.insert(name.to_string(), value.to_string());
            }
        }
        row.insert(TIMESTAMP_COLUMN.to_string(), unit.timestamp.to_string());
        buffer.push(ResultRow {
            row,
            metadata: RowMetadata {
                timestamp: unit.timestamp,
            },
        });
    }
    Ok(buffer)
}

/// Group-and-aggregate over the stat attribute maps carried in the where
/// result. Plain select columns are the grouping keys.
fn select_stats(
    query: &AnalyticsQuery,
    where_result: &[ResultUnit],
) -> Result<RowMultimap, QueryError> {
    let plan = &query.select_plan;
    let mut groups: BTreeMap<Vec<String>, Vec<BTreeMap<String, Value>>> = BTreeMap::new();
    for unit in where_result {
        let Some((attribs_json, _)) = unit.stat_info() else {
            continue;
        };
        let attribs: BTreeMap<String, Value> = serde_json::from_str(attribs_json)
            .map_err(|err| QueryError::Parse(format!("bad stat attribute json: {err}")))?;
        let key: Vec<String> = plan
            .columns
            .iter()
            .map(|column| {
                attribs
                    .get(column)
                    .map(json_value_to_string)
                    .unwrap_or_default()
            })
            .collect();
        groups.entry(key).or_default().push(attribs);
    }

    let mut out = RowMultimap::new();
    for (key, samples) in groups {
        if plan.aggregates.is_empty() {
            let rows = out.entry(key).or_default();
            for attribs in samples {
                let mut row = RowMap::new();
                for (name, value) in &attribs {
                    if plan.is_selected(name) {
                        row.insert(name.clone(), json_value_to_string(value));
                    }
                }
                rows.push(row);
            }
            continue;
        }
        let mut row = RowMap::new();
        for (column, value) in plan.columns.iter().zip(&key) {
            row.insert(column.clone(), value.clone());
        }
        for aggregate in &plan.aggregates {
            let values: Vec<f64> = samples
                .iter()
                .filter_map(|attribs| numeric_attr(attribs.get(&aggregate.field)))
                .collect();
            apply_aggregate(&mut row, &aggregate.label, aggregate.op, &values);
        }
        out.insert(key, vec![row]);
    }
    Ok(out)
}

fn numeric_attr(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn apply_aggregate(row: &mut RowMap, label: &str, op: AggOp, values: &[f64]) {
    match op {
        AggOp::Count => {
            row.insert(label.to_string(), format_number(values.len() as f64));
        }
        AggOp::Sum => {
            row.insert(label.to_string(), format_number(values.iter().sum()));
        }
        AggOp::Min => {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            row.insert(label.to_string(), format_number(if values.is_empty() { 0.0 } else { min }));
        }
        AggOp::Max => {
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            row.insert(label.to_string(), format_number(if values.is_empty() { 0.0 } else { max }));
        }
        AggOp::Avg => {
            let avg = if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            };
            row.insert(label.to_string(), format_number(avg));
        }
        AggOp::Percentiles => {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            for (suffix, fraction) in [("50", 0.50), ("95", 0.95), ("99", 0.99)] {
                let value = percentile(&sorted, fraction);
                row.insert(format!("{label}.{suffix}"), format_number(value));
            }
        }
    }
}

fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * fraction).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
