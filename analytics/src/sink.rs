//! Result sink / job broker interface and the result shapes that cross it.
//!
//! The engine never talks to the transport directly; each phase hands its
//! outcome to a [`ResultSink`] together with a [`QPerfInfo`] perf record so
//! the upstream coordinator can account for every chunk, failed ones
//! included.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::store::DbValue;

/// Per-phase timing counters and error code of one chunk, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QPerfInfo {
    pub chunk_where_time: u32,
    pub chunk_select_time: u32,
    pub chunk_postproc_time: u32,
    pub error: i32,
}

/// One unit of a WHERE result: a timestamp and the ordered opaque tuple
/// identifying the matching row (UUID, object id, or stat attributes plus
/// UUID, depending on the table).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResultUnit {
    pub timestamp: u64,
    pub info: Vec<DbValue>,
}

impl ResultUnit {
    pub fn uuid(&self) -> Option<Uuid> {
        self.info.first().and_then(|v| v.as_uuid())
    }

    pub fn object_id(&self) -> Option<&str> {
        self.info.get(1).and_then(|v| v.as_str())
    }

    /// Stat rows carry `(attribute-json, uuid)`.
    pub fn stat_info(&self) -> Option<(&str, Uuid)> {
        let attribs = self.info.first().and_then(|v| v.as_str())?;
        let uuid = self.info.get(1).and_then(|v| v.as_uuid())?;
        Some((attribs, uuid))
    }
}

pub type RowMap = BTreeMap<String, String>;

/// Opaque per-row metadata carried through merges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowMetadata {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultRow {
    pub row: RowMap,
    pub metadata: RowMetadata,
}

/// Ordered sequence of result rows.
pub type ResultBuffer = Vec<ResultRow>;

/// Aggregated stat output keyed by the plan's grouping tuple.
pub type RowMultimap = BTreeMap<Vec<String>, Vec<RowMap>>;

/// Handle identifying one query chunk towards the job broker. Cancellation
/// propagates through the shared flag; phases check it between steps.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    pub qid: String,
    pub chunk: u32,
    cancelled: Arc<AtomicBool>,
}

impl QueryHandle {
    pub fn new(qid: impl Into<String>, chunk: u32) -> Self {
        Self {
            qid: qid.into(),
            chunk,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ResultSink: Send + Sync {
    /// Delivers the WHERE result of one chunk (possibly empty on failure).
    fn where_result(&self, handle: &QueryHandle, qperf: QPerfInfo, result: Vec<ResultUnit>);

    /// Delivers the final buffer of one chunk.
    fn query_result(&self, handle: &QueryHandle, qperf: QPerfInfo, buffer: ResultBuffer);

    /// Delivers the aggregated multi-map output of a stat chunk.
    fn query_result_map(&self, handle: &QueryHandle, qperf: QPerfInfo, rows: RowMultimap);
}
