//! Analytic query engine core.
//!
//! A query descriptor compiles into a WHERE plan (disjunction of
//! conjunctions over indexed columns), a SELECT plan and a post-processing
//! plan. Execution shards the time window into chunks; each chunk runs its
//! WHERE sub-queries against the store, applies set algebra, then SELECT and
//! post-processing; the merge layer produces the final ordered buffer.

pub mod engine;
pub mod executor;
pub mod merge;
pub mod post_plan;
pub mod select_plan;
pub mod where_plan;

use analytics_api::{QuerySpec, SESSION_TYPE_CLIENT, SESSION_TYPE_SERVER};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::schema::{
    self, stats::StatSchema, TableKind, CACHE_TIME_ADDITIONAL_BITS, OBJECT_VALUE_TABLE,
    ROW_TIME_BITS,
};
use crate::store::StoreError;
use crate::ttl::TtlMap;
use crate::utils::time::{parse_query_time, TimeParseError};

/// Error code reported for store failures.
pub const EIO_CODE: i32 = 5;
/// Error code reported for compile-time validation failures.
pub const EINVAL_CODE: i32 = 22;
/// Error code reported for caller-driven cancellation.
pub const ECANCELED_CODE: i32 = 125;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("malformed query: `{0}`")]
    Parse(String),
    #[error("invalid query argument: `{0}`")]
    InvalidArg(String),
    #[error("query cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn code(&self) -> i32 {
        match self {
            QueryError::Parse(_) | QueryError::InvalidArg(_) => EINVAL_CODE,
            QueryError::Cancelled => ECANCELED_CODE,
            QueryError::Store(_) => EIO_CODE,
        }
    }
}

impl From<TimeParseError> for QueryError {
    fn from(err: TimeParseError) -> Self {
        QueryError::Parse(err.to_string())
    }
}

/// Which endpoint of a session a sub-query targets. The discriminants are
/// the row-key byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Server = 0,
    Client = 1,
}

impl SessionRole {
    pub fn from_spec(session_type: Option<&str>) -> Result<Option<Self>, QueryError> {
        match session_type {
            None => Ok(None),
            Some(SESSION_TYPE_CLIENT) => Ok(Some(SessionRole::Client)),
            Some(SESSION_TYPE_SERVER) => Ok(Some(SessionRole::Server)),
            Some(other) => Err(QueryError::InvalidArg(format!(
                "unknown session type `{other}`"
            ))),
        }
    }
}

/// Flow direction selector; ingress is the default.
pub const DIRECTION_INGRESS: u8 = 1;

pub(crate) fn json_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One fully parsed and compiled query, scoped to a single parallel batch.
#[derive(Debug)]
pub struct AnalyticsQuery {
    pub qid: String,
    pub table: String,
    pub kind: TableKind,
    pub stat_name_attr: Option<(String, String)>,
    pub stat_schema: Option<StatSchema>,

    pub req_from_time: u64,
    pub req_end_time: u64,
    /// Effective window of this batch after TTL clamping and slicing.
    pub from_time: u64,
    pub end_time: u64,
    pub original_from_time: u64,
    pub original_end_time: u64,
    pub time_slice: u64,
    pub parallel_batch_num: u32,
    pub total_parallel_batches: u32,
    pub processing_needed: bool,
    pub parallelize: bool,
    pub merge_needed: bool,

    pub where_plan: where_plan::WherePlan,
    pub select_plan: select_plan::SelectPlan,
    pub post_plan: post_plan::PostProcessPlan,
}

impl AnalyticsQuery {
    /// Parses and compiles `spec` for the given batch. `or_number` of -1
    /// compiles every disjunct (prepare); otherwise only the requested one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        qid: &str,
        spec: &QuerySpec,
        or_number: i32,
        ttl_map: &TtlMap,
        batch: u32,
        total_batches: u32,
        max_slice: u64,
        legacy_stats: bool,
        now: u64,
    ) -> Result<Self, QueryError> {
        let table = spec.table.clone();
        let mut kind = schema::classify(&table);

        let (stat_name_attr, stat_schema) = if kind == TableKind::Stat {
            let name_attr = schema::stats::parse_stat_table_name(&table).ok_or_else(|| {
                QueryError::InvalidArg(format!("malformed stat table name `{table}`"))
            })?;
            let schema = match schema::stats::static_stat_schema(&table) {
                Some(static_schema) => Some(static_schema.clone()),
                None => spec
                    .table_schema
                    .as_deref()
                    .filter(|cols| !cols.is_empty())
                    .map(|cols| {
                        StatSchema::from_api(cols)
                            .map_err(|err| QueryError::InvalidArg(err.to_string()))
                    })
                    .transpose()?,
            };
            (Some(name_attr), schema)
        } else {
            (None, None)
        };

        // clamp the requested window to [now - ttl, now]
        let ttl_usec = ttl_map.usec_for_table(&table);
        let min_start_time = now.saturating_sub(ttl_usec);
        let req_from_time = parse_query_time(&spec.start_time, now)?;
        let req_end_time = parse_query_time(&spec.end_time, now)?;
        let mut from_time = req_from_time.max(min_start_time);
        let mut end_time = req_end_time.min(now);

        // fieldnames caches are written on a coarser bucket, widen backwards
        if schema::is_stat_fieldnames_table(&table) {
            let cache_time = 1u64 << (ROW_TIME_BITS + CACHE_TIME_ADDITIONAL_BITS);
            let time_period = end_time.saturating_sub(from_time);
            if time_period < cache_time {
                from_time = from_time
                    .saturating_sub(cache_time - time_period)
                    .max(min_start_time);
            }
        }

        let session_role = SessionRole::from_spec(spec.session_type.as_deref())?;
        if kind == TableKind::Session && session_role.is_none() {
            return Err(QueryError::InvalidArg(
                "session_type is required for session queries".to_string(),
            ));
        }
        let direction = spec.flow_dir.unwrap_or(DIRECTION_INGRESS);
        let is_si = spec.session_is_si.unwrap_or(0);

        let where_params = where_plan::WhereParams {
            kind,
            table: &table,
            stat_name_attr: stat_name_attr.as_ref(),
            stat_schema: stat_schema.as_ref(),
            session_role: session_role.unwrap_or(SessionRole::Server),
            is_si,
            direction_ing: direction,
            legacy_stats,
        };
        let where_plan =
            where_plan::compile(spec.where_clause.as_ref(), or_number, &where_params)?;

        let mut select_plan = select_plan::compile(spec, kind)?;
        // object-id listings come from the object value table
        if kind == TableKind::Object && select_plan.is_object_id_query {
            kind = TableKind::ObjectValue;
        }
        // spilled filters match on select output, their columns must ride along
        if !select_plan.columns.is_empty() {
            for column in &where_plan.additional_select {
                if !select_plan.columns.contains(column) {
                    select_plan.columns.push(column.clone());
                }
            }
        }

        let mut post_plan = post_plan::compile(spec, |column| {
            column_datatype(kind, stat_schema.as_ref(), column)
        })?;
        // direction-dependent flow terms ride along as post filters
        if !where_plan.filter_list.is_empty() {
            if post_plan.filter_list.is_empty() {
                post_plan.filter_list = where_plan.filter_list.clone();
            } else {
                for conjunct in &mut post_plan.filter_list {
                    for where_conjunct in &where_plan.filter_list {
                        conjunct.extend(where_conjunct.iter().cloned());
                    }
                }
            }
        }
        let mut merge_needed = post_plan.sorted || post_plan.limit.is_some();
        if matches!(kind, TableKind::Stat | TableKind::Session | TableKind::Flow) {
            merge_needed = select_plan.merge_needed();
        }

        if from_time > end_time {
            from_time = end_time.saturating_sub(1);
        }
        let original_from_time = from_time;
        let original_end_time = end_time;

        let parallelize = table != OBJECT_VALUE_TABLE;
        let time_slice = if parallelize {
            let floor = 1u64 << ROW_TIME_BITS;
            let ceiling = max_slice * floor;
            ((end_time - from_time) / u64::from(total_batches.max(1)) + 1).clamp(floor, ceiling)
        } else {
            merge_needed = false;
            end_time - from_time
        };

        let mut processing_needed = true;
        if parallelize {
            from_time = original_from_time + time_slice * u64::from(batch);
            end_time = (from_time + time_slice).min(original_end_time);
            if from_time >= original_end_time {
                processing_needed = false;
            }
        }
        debug!(
            qid,
            batch, from_time, end_time, time_slice, processing_needed, "query window resolved"
        );

        Ok(Self {
            qid: qid.to_string(),
            table,
            kind,
            stat_name_attr,
            stat_schema,
            req_from_time,
            req_end_time,
            from_time,
            end_time,
            original_from_time,
            original_end_time,
            time_slice,
            parallel_batch_num: batch,
            total_parallel_batches: total_batches,
            processing_needed,
            parallelize,
            merge_needed,
            where_plan,
            select_plan,
            post_plan,
        })
    }

    /// Chunk sizes over the original window; the prepare phase hands these
    /// to the job broker.
    pub fn chunk_sizes(&self) -> Vec<u64> {
        if !self.parallelize {
            return vec![self.original_end_time - self.original_from_time];
        }
        let mut sizes = Vec::new();
        let mut chunk_start = self.original_from_time;
        while chunk_start < self.original_end_time {
            sizes.push(self.time_slice.min(self.original_end_time - chunk_start));
            chunk_start += self.time_slice;
        }
        sizes
    }

    /// Whether the final result is the aggregated row multi-map rather than
    /// the flat buffer.
    pub fn map_output(&self) -> bool {
        self.kind == TableKind::Stat
    }
}

fn column_datatype(
    kind: TableKind,
    stat_schema: Option<&StatSchema>,
    column: &str,
) -> Option<String> {
    if kind == TableKind::Stat {
        let field = select_plan::parse_aggregate(column)
            .map(|agg| agg.field)
            .unwrap_or_else(|| column.to_string());
        return stat_schema
            .and_then(|s| s.column_desc(&field))
            .map(|desc| desc.datatype.as_str().to_string());
    }
    schema::catalog_for(kind)
        .and_then(|catalog| catalog.column_datatype(column))
        .map(|dt| dt.as_str().to_string())
}
