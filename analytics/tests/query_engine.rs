//! End-to-end query runs against the in-memory store driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use analytics::query::engine::{EngineConfig, QueryEngine, QueryOutput, QueryParams};
use analytics::query::EIO_CODE;
use analytics::schema::{
    self, MESSAGE_TABLE_CF, ROW_TIME_BITS, SESSION_TABLE_CF, STATS_TABLE_CF,
    SYSTEM_OBJECT_TABLE_CF,
};
use analytics::sink::{QPerfInfo, QueryHandle, ResultBuffer, ResultSink, ResultUnit, RowMultimap};
use analytics::store::memory::{MemoryEntry, MemoryStore};
use analytics::store::DbValue;
use analytics::ttl::RetryPolicy;
use analytics_api::QuerySpec;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Sink double that keeps the last perf record of each call kind.
#[derive(Default)]
struct RecordingSink {
    last_final_perf: Mutex<Option<QPerfInfo>>,
}

impl ResultSink for RecordingSink {
    fn where_result(&self, _handle: &QueryHandle, _qperf: QPerfInfo, _result: Vec<ResultUnit>) {}

    fn query_result(&self, _handle: &QueryHandle, qperf: QPerfInfo, _buffer: ResultBuffer) {
        *self.last_final_perf.lock().unwrap() = Some(qperf);
    }

    fn query_result_map(&self, _handle: &QueryHandle, qperf: QPerfInfo, _rows: RowMultimap) {
        *self.last_final_perf.lock().unwrap() = Some(qperf);
    }
}

fn quick_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            interval: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

fn core_store() -> MemoryStore {
    MemoryStore::with_column_families(&[
        MESSAGE_TABLE_CF,
        SESSION_TABLE_CF,
        STATS_TABLE_CF,
        SYSTEM_OBJECT_TABLE_CF,
    ])
}

fn now_usec() -> u64 {
    Utc::now().timestamp_micros() as u64
}

fn insert_message(store: &MemoryStore, timestamp: u64, source: &str, message_type: &str) -> Uuid {
    let uuid = Uuid::new_v4();
    store.insert_entry(
        MESSAGE_TABLE_CF,
        MemoryEntry {
            key: vec![DbValue::U64(timestamp >> ROW_TIME_BITS)],
            clustering: vec![DbValue::U64(timestamp & ((1 << ROW_TIME_BITS) - 1))],
            value: vec![DbValue::Uuid(uuid)],
            indexed: HashMap::from([
                ("source".to_string(), source.to_string()),
                ("message_type".to_string(), message_type.to_string()),
            ]),
        },
    );
    store.insert_row(
        MESSAGE_TABLE_CF,
        vec![DbValue::Uuid(uuid)],
        vec![
            ("Source", DbValue::Str(source.to_string())),
            ("Messagetype", DbValue::Str(message_type.to_string())),
        ],
    );
    uuid
}

fn message_query(where_clause: serde_json::Value) -> QueryParams {
    QueryParams {
        qid: "qid-msg".to_string(),
        spec: QuerySpec::from_json(
            &json!({
                "table": "MessageTable",
                "start_time": "now-10m",
                "end_time": "now",
                "select_fields": ["Source", "Messagetype"],
                "where": where_clause,
                "sort": 2,
                "sort_fields": ["Source"],
                "limit": 10
            })
            .to_string(),
        )
        .unwrap(),
        max_chunks: 4,
    }
}

#[test]
fn message_query_filters_sorts_and_projects() {
    let store = Arc::new(core_store());
    let now = now_usec();
    insert_message(&store, now - 60_000_000, "a6s1", "NodeStatus");
    insert_message(&store, now - 50_000_000, "a6s2", "NodeStatus");
    insert_message(&store, now - 40_000_000, "b6s1", "NodeStatus");

    let engine = QueryEngine::new(store, Arc::new(RecordingSink::default()), quick_config());
    let params = message_query(json!([[{"name": "Source", "op": 7, "value": "a6"}]]));
    let handle = QueryHandle::new(&params.qid, 0);
    let output = engine.run(&handle, &params).unwrap();

    let QueryOutput::Buffer(rows) = output else {
        panic!("message queries produce a buffer");
    };
    let sources: Vec<&str> = rows
        .iter()
        .map(|r| r.row.get("Source").unwrap().as_str())
        .collect();
    // descending sort on the projected source column
    assert_eq!(sources, vec!["a6s2", "a6s1"]);
    for row in &rows {
        assert!(row.row.contains_key("Messagetype"));
        assert!(row.row.contains_key("MessageTS"));
    }
}

#[test]
fn disjuncts_union_their_results() {
    let store = Arc::new(core_store());
    let now = now_usec();
    insert_message(&store, now - 60_000_000, "a6s1", "NodeStatus");
    insert_message(&store, now - 50_000_000, "b6s1", "NodeStatus");
    insert_message(&store, now - 40_000_000, "c6s1", "NodeStatus");

    let engine = QueryEngine::new(store, Arc::new(RecordingSink::default()), quick_config());
    let params = message_query(json!([
        [{"name": "Source", "op": 1, "value": "a6s1"}],
        [{"name": "Source", "op": 1, "value": "b6s1"}]
    ]));
    let handle = QueryHandle::new(&params.qid, 0);
    let prepared = engine.prepare(&params).unwrap();
    assert_eq!(prepared.wterms, 2);
    let QueryOutput::Buffer(rows) = engine.run(&handle, &params).unwrap() else {
        panic!("message queries produce a buffer");
    };
    let sources: Vec<&str> = rows
        .iter()
        .map(|r| r.row.get("Source").unwrap().as_str())
        .collect();
    assert_eq!(sources, vec!["b6s1", "a6s1"]);
}

#[test]
fn stat_query_groups_and_aggregates() {
    let store = Arc::new(core_store());
    let now = now_usec();
    let samples = [
        ("frontend", 100u64, now - 60_000_000),
        ("frontend", 200, now - 50_000_000),
        ("backend", 7, now - 40_000_000),
    ];
    let shard = schema::stat_tag_shard("vn");
    let shard_column = schema::stat_tag_shard_column(shard);
    for (vn, bytes, timestamp) in samples {
        let attribs = json!({"vn": vn, "bytes": bytes}).to_string();
        store.insert_entry(
            STATS_TABLE_CF,
            MemoryEntry {
                key: vec![
                    DbValue::U64(timestamp >> ROW_TIME_BITS),
                    DbValue::Str("VnStats".to_string()),
                    DbValue::Str("vn_stats".to_string()),
                ],
                clustering: vec![
                    DbValue::U64(timestamp & ((1 << ROW_TIME_BITS) - 1)),
                    DbValue::Str("collector-1".to_string()),
                ],
                value: vec![DbValue::Str(attribs), DbValue::Uuid(Uuid::new_v4())],
                indexed: HashMap::from([(shard_column.clone(), format!("vn={vn};"))]),
            },
        );
    }

    let engine = QueryEngine::new(store, Arc::new(RecordingSink::default()), quick_config());
    let params = QueryParams {
        qid: "qid-stat".to_string(),
        spec: QuerySpec::from_json(
            &json!({
                "table": "StatTable.VnStats.vn_stats",
                "start_time": "now-10m",
                "end_time": "now",
                "select_fields": ["vn", "SUM(bytes)", "COUNT(bytes)"],
                "where": [[{"name": "vn", "op": 1, "value": "frontend"}]],
                "table_schema": [
                    {"name": "vn", "datatype": "string", "index": true, "suffixes": []},
                    {"name": "bytes", "datatype": "int", "index": false, "suffixes": []}
                ]
            })
            .to_string(),
        )
        .unwrap(),
        max_chunks: 2,
    };
    let handle = QueryHandle::new(&params.qid, 0);
    let prepared = engine.prepare(&params).unwrap();
    assert!(prepared.map_output);
    assert!(prepared.need_merge);

    let QueryOutput::Map(rows) = engine.run(&handle, &params).unwrap() else {
        panic!("stat queries produce a multimap");
    };
    assert_eq!(rows.len(), 1);
    let group = rows.get(&vec!["frontend".to_string()]).unwrap();
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].get("vn").map(String::as_str), Some("frontend"));
    assert_eq!(group[0].get("SUM(bytes)").map(String::as_str), Some("300"));
    assert_eq!(group[0].get("COUNT(bytes)").map(String::as_str), Some("2"));
}

#[test]
fn store_outage_surfaces_partial_result_with_error_code() {
    let store = Arc::new(core_store());
    let sink = Arc::new(RecordingSink::default());
    let engine = QueryEngine::new(store.clone(), sink.clone(), quick_config());

    store.set_unavailable(true);
    let params = message_query(json!([[{"name": "Source", "op": 1, "value": "a6s1"}]]));
    let handle = QueryHandle::new(&params.qid, 0);
    let QueryOutput::Buffer(rows) = engine.run(&handle, &params).unwrap() else {
        panic!("message queries produce a buffer");
    };
    assert!(rows.is_empty());
    let perf = sink.last_final_perf.lock().unwrap().unwrap();
    assert_eq!(perf.error, EIO_CODE);
}

#[test]
fn ttl_row_bounds_the_query_window() {
    let store = Arc::new(core_store());
    store.insert_row(
        SYSTEM_OBJECT_TABLE_CF,
        vec![DbValue::Str("analytics".into())],
        vec![
            ("global_data_ttl", DbValue::U64(1)),
            ("flow_data_ttl", DbValue::U64(1)),
            ("stats_data_ttl", DbValue::U64(1)),
            ("config_audit_ttl", DbValue::U64(1)),
        ],
    );
    let engine = QueryEngine::new(store, Arc::new(RecordingSink::default()), quick_config());
    let params = QueryParams {
        qid: "qid-ttl".to_string(),
        spec: QuerySpec::from_json(
            &json!({
                "table": "MessageTable",
                "start_time": "now-2d",
                "end_time": "now",
                "select_fields": ["Source"]
            })
            .to_string(),
        )
        .unwrap(),
        max_chunks: 4,
    };
    let prepared = engine.prepare(&params).unwrap();
    // a 1 hour ttl clamps the requested 2 day window
    assert!(prepared.time_period_sec <= 3_600);
}
