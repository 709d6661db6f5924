//! SELECT plan: projected columns, aggregates and grouping keys.

use analytics_api::QuerySpec;

use super::QueryError;
use crate::schema::{TableKind, COL_OBJECT_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Count,
    Max,
    Min,
    Avg,
    Percentiles,
}

impl AggOp {
    fn parse(name: &str) -> Option<AggOp> {
        match name {
            "SUM" => Some(AggOp::Sum),
            "COUNT" => Some(AggOp::Count),
            "MAX" => Some(AggOp::Max),
            "MIN" => Some(AggOp::Min),
            "AVG" => Some(AggOp::Avg),
            "PERCENTILES" => Some(AggOp::Percentiles),
            _ => None,
        }
    }
}

/// One aggregate specifier, e.g. `SUM(data.total-bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub op: AggOp,
    pub field: String,
    /// The specifier as written; used as the output column name.
    pub label: String,
}

/// Parses `OP(field)`; anything else is a plain column.
pub fn parse_aggregate(field: &str) -> Option<Aggregate> {
    let open = field.find('(')?;
    let close = field.rfind(')')?;
    if close != field.len() - 1 || close <= open {
        return None;
    }
    let op = AggOp::parse(&field[..open])?;
    let inner = field[open + 1..close].trim();
    if inner.is_empty() {
        return None;
    }
    Some(Aggregate {
        op,
        field: inner.to_string(),
        label: field.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectPlan {
    /// The select list as requested.
    pub fields: Vec<String>,
    /// Plain projected columns; for stat queries these are the grouping keys.
    pub columns: Vec<String>,
    pub aggregates: Vec<Aggregate>,
    pub is_object_id_query: bool,
}

impl SelectPlan {
    /// Aggregated outputs need the cross-chunk merge phase.
    pub fn merge_needed(&self) -> bool {
        !self.aggregates.is_empty()
    }

    /// Whether `column` should appear in the output; an empty select list
    /// projects everything.
    pub fn is_selected(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }
}

pub fn compile(spec: &QuerySpec, kind: TableKind) -> Result<SelectPlan, QueryError> {
    let mut plan = SelectPlan {
        fields: spec.select_fields.clone(),
        ..Default::default()
    };
    for field in &spec.select_fields {
        match parse_aggregate(field) {
            Some(agg) => {
                if matches!(kind, TableKind::Message | TableKind::Object | TableKind::ObjectValue)
                {
                    return Err(QueryError::InvalidArg(format!(
                        "aggregate `{field}` is not valid on table kind {kind:?}"
                    )));
                }
                plan.aggregates.push(agg);
            }
            None => plan.columns.push(field.clone()),
        }
    }
    plan.is_object_id_query = kind == TableKind::Object
        && spec.select_fields.len() == 1
        && spec.select_fields[0] == COL_OBJECT_ID;
    Ok(plan)
}
