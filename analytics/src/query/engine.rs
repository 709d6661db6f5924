//! Query coordinator.
//!
//! Bring-up initializes the store (keyspace, column-family discovery, the
//! legacy stat-table probe and the TTL bootstrap) under a bounded retry
//! policy; exhaustion leaves the engine in degraded mode with default TTLs.
//! Per query, the phases are prepare, per-chunk where, per-chunk select and
//! post-process, and the final merge; every phase reports its timing and
//! outcome to the result sink.

use std::sync::Arc;
use std::time::Instant;

use analytics_api::QuerySpec;
use crossbeam::channel::unbounded;
use tracing::{debug, info, warn};

use super::executor::{self, SelectOutput};
use super::merge;
use super::{AnalyticsQuery, QueryError};
use crate::schema::{
    LEGACY_STAT_TABLES, MESSAGE_TABLE_CF, SESSION_TABLE_CF, STATS_TABLE_CF, SYSTEM_OBJECT_TABLE_CF,
};
use crate::sink::{QPerfInfo, QueryHandle, ResultBuffer, ResultSink, ResultUnit, RowMultimap};
use crate::store::{ColumnStore, StoreError};
use crate::ttl::{ttl_map_or_default, TtlMap};
use crate::utils::retry::{retry, RetryPolicy};
use crate::utils::time::utc_timestamp_usec;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub keyspace: String,
    /// Upper bound on the time slice, in row-time buckets.
    pub max_slice: u64,
    /// Worker pool size for the whole-query driver.
    pub max_tasks: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keyspace: "analytics".to_string(),
            max_slice: 100,
            max_tasks: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// One query job as handed over by the broker.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub qid: String,
    pub spec: QuerySpec,
    pub max_chunks: u32,
}

/// Parallelization details returned by the prepare phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareInfo {
    pub chunk_sizes: Vec<u64>,
    pub need_merge: bool,
    pub map_output: bool,
    pub wterms: u32,
    pub table: String,
    pub time_period_sec: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Buffer(ResultBuffer),
    Map(RowMultimap),
}

pub struct QueryEngine {
    store: Arc<dyn ColumnStore>,
    sink: Arc<dyn ResultSink>,
    config: EngineConfig,
    ttl_map: TtlMap,
    legacy_stats: bool,
    degraded: bool,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn ColumnStore>,
        sink: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> Self {
        let mut degraded = false;
        let bring_up = retry(config.retry, || init_store(store.as_ref(), &config.keyspace));
        if let Err(err) = bring_up {
            warn!(%err, "store bring-up failed, engine runs degraded");
            degraded = true;
        }
        // which stats generations to compile against is decided here, once
        let legacy_stats = !degraded
            && LEGACY_STAT_TABLES
                .iter()
                .all(|cf| store.use_column_family(cf).unwrap_or(false));
        let ttl_map = if degraded {
            TtlMap::default()
        } else {
            ttl_map_or_default(store.as_ref(), config.retry)
        };
        info!(legacy_stats, degraded, "query engine initialized");
        Self {
            store,
            sink,
            config,
            ttl_map,
            legacy_stats,
            degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn legacy_stats(&self) -> bool {
        self.legacy_stats
    }

    pub fn ttl_map(&self) -> &TtlMap {
        &self.ttl_map
    }

    fn build_query(
        &self,
        params: &QueryParams,
        or_number: i32,
        batch: u32,
    ) -> Result<AnalyticsQuery, QueryError> {
        AnalyticsQuery::new(
            &params.qid,
            &params.spec,
            or_number,
            &self.ttl_map,
            batch,
            params.max_chunks.max(1),
            self.config.max_slice,
            self.legacy_stats,
            utc_timestamp_usec(),
        )
    }

    /// Compiles once and returns the chunking and merge flags. No store I/O
    /// is issued; compile errors surface before any chunk runs.
    pub fn prepare(&self, params: &QueryParams) -> Result<PrepareInfo, QueryError> {
        let query = self.build_query(params, -1, 0)?;
        Ok(PrepareInfo {
            chunk_sizes: query.chunk_sizes(),
            need_merge: query.merge_needed,
            map_output: query.map_output(),
            wterms: query.where_plan.wterms,
            table: query.table.clone(),
            time_period_sec: (query.original_end_time - query.original_from_time) / 1_000_000,
        })
    }

    /// Executes the WHERE phase of one chunk for one disjunct. The sink is
    /// called even on failure (with an empty result and the error code) so
    /// the upstream coordinator can count chunks.
    pub fn exec_where(
        &self,
        handle: &QueryHandle,
        params: &QueryParams,
        chunk: u32,
        or_number: i32,
    ) -> bool {
        let mut qperf = QPerfInfo::default();
        let started = Instant::now();
        let outcome = self.run_where(handle, params, chunk, or_number);
        qperf.chunk_where_time = elapsed_ms(started);
        match outcome {
            Ok(result) => {
                self.sink.where_result(handle, qperf, result);
                true
            }
            Err(err) => {
                warn!(qid = %params.qid, chunk, %err, "where phase failed");
                qperf.error = err.code();
                self.sink.where_result(handle, qperf, Vec::new());
                false
            }
        }
    }

    fn run_where(
        &self,
        handle: &QueryHandle,
        params: &QueryParams,
        chunk: u32,
        or_number: i32,
    ) -> Result<Vec<ResultUnit>, QueryError> {
        if handle.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let query = self.build_query(params, or_number, chunk)?;
        if !query.processing_needed {
            return Ok(Vec::new());
        }
        executor::execute_where(
            self.store.as_ref(),
            &query.where_plan,
            query.kind,
            query.from_time,
            query.end_time,
        )
    }

    /// Executes SELECT and post-processing of one chunk, consuming the
    /// WHERE result when the broker supplies it.
    pub fn exec(
        &self,
        handle: &QueryHandle,
        params: &QueryParams,
        chunk: u32,
        where_info: Option<Vec<ResultUnit>>,
    ) -> bool {
        match self.run_select(handle, params, chunk, where_info) {
            Ok((SelectOutput::Buffer(buffer), qperf)) => {
                self.sink.query_result(handle, qperf, buffer);
                true
            }
            Ok((SelectOutput::Map(rows), qperf)) => {
                self.sink.query_result_map(handle, qperf, rows);
                true
            }
            Err(err) => {
                warn!(qid = %params.qid, chunk, %err, "select phase failed");
                let qperf = QPerfInfo {
                    error: err.code(),
                    ..Default::default()
                };
                self.sink.query_result(handle, qperf, ResultBuffer::new());
                false
            }
        }
    }

    fn run_select(
        &self,
        handle: &QueryHandle,
        params: &QueryParams,
        chunk: u32,
        where_info: Option<Vec<ResultUnit>>,
    ) -> Result<(SelectOutput, QPerfInfo), QueryError> {
        let mut qperf = QPerfInfo::default();
        let query = self.build_query(params, -1, chunk)?;
        if !query.processing_needed {
            return Ok((empty_output(&query), qperf));
        }

        let where_result = match where_info {
            Some(units) => units,
            None => {
                let started = Instant::now();
                let mut per_disjunct = Vec::new();
                for or_number in 0..query.where_plan.wterms {
                    per_disjunct.push(self.run_where(handle, params, chunk, or_number as i32)?);
                }
                let result = executor::op_or(per_disjunct);
                qperf.chunk_where_time = elapsed_ms(started);
                result
            }
        };
        if handle.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let select_started = Instant::now();
        let output = executor::execute_select(self.store.as_ref(), &query, &where_result)?;
        qperf.chunk_select_time = elapsed_ms(select_started);
        if handle.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let post_started = Instant::now();
        let output = post_process(&query, output);
        qperf.chunk_postproc_time = elapsed_ms(post_started);
        debug!(qid = %params.qid, chunk, "chunk processing done");
        Ok((output, qperf))
    }

    /// Merges one chunk's buffer into the accumulator.
    pub fn accumulate(
        &self,
        params: &QueryParams,
        input: ResultBuffer,
        output: &mut ResultBuffer,
    ) -> Result<(), QueryError> {
        let query = self.build_query(params, -1, 0)?;
        merge::accumulate(&query.post_plan, input, output);
        Ok(())
    }

    pub fn final_merge(
        &self,
        params: &QueryParams,
        inputs: Vec<ResultBuffer>,
    ) -> Result<ResultBuffer, QueryError> {
        let query = self.build_query(params, -1, 0)?;
        Ok(merge::final_merge(&query.post_plan, inputs))
    }

    pub fn final_merge_map(
        &self,
        params: &QueryParams,
        inputs: Vec<RowMultimap>,
    ) -> Result<RowMultimap, QueryError> {
        let query = self.build_query(params, -1, 0)?;
        if !query.map_output() {
            return Err(QueryError::InvalidArg(
                "multi-map merge applies to stat queries only".to_string(),
            ));
        }
        Ok(merge::final_merge_map(query.post_plan.limit, inputs))
    }

    /// Drives one query end to end: fans the chunks across a bounded worker
    /// pool, merges, and delivers the final result to the sink.
    pub fn run(
        &self,
        handle: &QueryHandle,
        params: &QueryParams,
    ) -> Result<QueryOutput, QueryError> {
        let prepared = self.prepare(params)?;
        let chunks = prepared.chunk_sizes.len() as u32;
        let workers = self.config.max_tasks.max(1).min(chunks.max(1) as usize);

        let (task_tx, task_rx) = unbounded::<u32>();
        for chunk in 0..chunks {
            task_tx.send(chunk).expect("task channel open");
        }
        drop(task_tx);
        let (result_tx, result_rx) = unbounded();

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                std::thread::Builder::new()
                    .name(format!("qe-worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        while let Ok(chunk) = task_rx.recv() {
                            let outcome = self.run_select(handle, params, chunk, None);
                            if result_tx.send((chunk, outcome)).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("thread config should be valid");
            }
        });
        drop(result_tx);

        let mut qperf = QPerfInfo::default();
        let mut buffers = Vec::new();
        let mut maps = Vec::new();
        let mut outcomes: Vec<_> = result_rx.iter().collect();
        outcomes.sort_by_key(|(chunk, _)| *chunk);
        for (chunk, outcome) in outcomes {
            match outcome {
                Ok((SelectOutput::Buffer(buffer), chunk_perf)) => {
                    accumulate_perf(&mut qperf, chunk_perf);
                    buffers.push(buffer);
                }
                Ok((SelectOutput::Map(rows), chunk_perf)) => {
                    accumulate_perf(&mut qperf, chunk_perf);
                    maps.push(rows);
                }
                Err(err) => {
                    // partial results are still surfaced; the error code
                    // tells the broker what happened
                    warn!(qid = %params.qid, chunk, %err, "chunk failed");
                    qperf.error = err.code();
                }
            }
        }

        let query = self.build_query(params, -1, 0)?;
        if prepared.map_output {
            let merged = merge::final_merge_map(query.post_plan.limit, maps);
            self.sink.query_result_map(handle, qperf, merged.clone());
            Ok(QueryOutput::Map(merged))
        } else {
            let merged = merge::final_merge(&query.post_plan, buffers);
            self.sink.query_result(handle, qperf, merged.clone());
            Ok(QueryOutput::Buffer(merged))
        }
    }
}

fn init_store(store: &dyn ColumnStore, keyspace: &str) -> Result<(), StoreError> {
    store.init()?;
    store.set_keyspace(keyspace)?;
    for cf in [
        MESSAGE_TABLE_CF,
        SESSION_TABLE_CF,
        STATS_TABLE_CF,
        SYSTEM_OBJECT_TABLE_CF,
    ] {
        if !store.use_column_family(cf)? {
            return Err(StoreError::UnknownColumnFamily(cf.to_string()));
        }
    }
    Ok(())
}

fn empty_output(query: &AnalyticsQuery) -> SelectOutput {
    if query.map_output() {
        SelectOutput::Map(RowMultimap::new())
    } else {
        SelectOutput::Buffer(ResultBuffer::new())
    }
}

fn post_process(query: &AnalyticsQuery, output: SelectOutput) -> SelectOutput {
    match output {
        SelectOutput::Buffer(buffer) => SelectOutput::Buffer(query.post_plan.process(buffer)),
        SelectOutput::Map(mut rows) => {
            if !query.post_plan.filter_list.is_empty() {
                for group in rows.values_mut() {
                    group.retain(|row| query.post_plan.matches(row));
                }
                rows.retain(|_, group| !group.is_empty());
            }
            SelectOutput::Map(rows)
        }
    }
}

fn elapsed_ms(started: Instant) -> u32 {
    started.elapsed().as_millis() as u32
}

fn accumulate_perf(total: &mut QPerfInfo, chunk: QPerfInfo) {
    total.chunk_where_time += chunk.chunk_where_time;
    total.chunk_select_time += chunk.chunk_select_time;
    total.chunk_postproc_time += chunk.chunk_postproc_time;
    if chunk.error != 0 {
        total.error = chunk.error;
    }
}
