//! WHERE-clause compiler.
//!
//! Each disjunct of the OR-of-ANDs where clause compiles into one or more
//! sub-queries: a physical table, a row-key suffix, a clustering-key range
//! and a list of indexed-column predicates. Which shape a term takes depends
//! on the target table: message and object logs accumulate predicates,
//! session and flow terms drive the clustering key and direction mapping,
//! stat terms hash into tag shards and may additionally target the legacy
//! tag tables.

use analytics_api::{MatchOp, MatchTerm};
use serde_json::Value;
use tracing::debug;

use super::post_plan::FilterMatch;
use super::{json_value_to_string, QueryError, SessionRole};
use crate::schema::stats::StatSchema;
use crate::schema::{
    self, ColumnType, TableCatalog, TableKind, COL_DEST_IP, COL_DEST_VN, COL_DPORT,
    COL_MESSAGE_TYPE, COL_MODULE, COL_OBJECT_ID, COL_PROTOCOL, COL_SOURCE, COL_SOURCE_IP,
    COL_SOURCE_VN, COL_SPORT, COL_VROUTER, MESSAGE_TABLE_CF, OBJECT_ID_COLUMNS, SESSION_TABLE_CF,
    STATS_KEY_FIELD, STATS_NAME_FIELD, STATS_PROXY_FIELD, STATS_SOURCE_FIELD, STATS_TABLE_CF,
    STATS_TABLE_BY_DBL_TAG, STATS_TABLE_BY_STR_STR_TAG, STATS_TABLE_BY_STR_TAG,
    STATS_TABLE_BY_STR_U64_TAG, STATS_TABLE_BY_U64_STR_TAG, STATS_TABLE_BY_U64_TAG,
    STATS_TABLE_BY_U64_U64_TAG, STAT_TAG_SHARDS,
};
use crate::store::{ClusteringRange, DbValue, IndexPredicate, StoreOp};

const CLUSTER_STR_FLOOR: &str = "\x00";
const CLUSTER_STR_CEILING: &str = "\x7f";
const PREFIX_CEILING: char = '\x7f';
const PORT_CEILING: u64 = 0xffff;

/// Which stats schema generation a sub-query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaGeneration {
    Current,
    Legacy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhereSubQuery {
    pub cf_name: String,
    pub row_key_suffix: Vec<DbValue>,
    pub range: ClusteringRange,
    pub predicates: Vec<IndexPredicate>,
    pub time_only_row: bool,
    pub time_only_column: bool,
    pub generation: SchemaGeneration,
}

impl WhereSubQuery {
    fn new(cf_name: &str) -> Self {
        Self {
            cf_name: cf_name.to_string(),
            row_key_suffix: Vec::new(),
            range: ClusteringRange::default(),
            predicates: Vec::new(),
            time_only_row: false,
            time_only_column: false,
            generation: SchemaGeneration::Current,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WherePlan {
    pub sub_queries: Vec<WhereSubQuery>,
    /// Filter conjuncts spilled from non-indexed flow terms; combined into
    /// the post-processing plan.
    pub filter_list: Vec<Vec<FilterMatch>>,
    /// Columns the spilled filters need in the select output.
    pub additional_select: Vec<String>,
    pub wterms: u32,
}

#[derive(Debug)]
pub struct WhereParams<'a> {
    pub kind: TableKind,
    pub table: &'a str,
    pub stat_name_attr: Option<&'a (String, String)>,
    pub stat_schema: Option<&'a StatSchema>,
    pub session_role: SessionRole,
    pub is_si: u8,
    pub direction_ing: u8,
    pub legacy_stats: bool,
}

/// Compiles the where clause. `or_number` of -1 compiles every disjunct
/// (the prepare phase does this to surface errors early); otherwise only
/// the requested disjunct produces sub-queries.
pub fn compile(
    where_clause: Option<&Vec<Vec<MatchTerm>>>,
    or_number: i32,
    params: &WhereParams,
) -> Result<WherePlan, QueryError> {
    let mut plan = WherePlan::default();
    let Some(disjuncts) = where_clause else {
        plan.wterms = 1;
        compile_default(params, &mut plan)?;
        return Ok(plan);
    };
    plan.wterms = disjuncts.len() as u32;
    for (index, disjunct) in disjuncts.iter().enumerate() {
        if disjunct.is_empty() {
            return Err(QueryError::InvalidArg("empty where conjunction".to_string()));
        }
        if or_number >= 0 && or_number != index as i32 {
            continue;
        }
        compile_disjunct(disjunct, params, &mut plan)?;
    }
    Ok(plan)
}

/// `where *`: table-specific full-scan sub-queries.
fn compile_default(params: &WhereParams, plan: &mut WherePlan) -> Result<(), QueryError> {
    match params.kind {
        TableKind::Message => {
            let mut sq = WhereSubQuery::new(MESSAGE_TABLE_CF);
            sq.time_only_row = true;
            sq.time_only_column = true;
            plan.sub_queries.push(sq);
        }
        TableKind::Object => {
            let mut sq = WhereSubQuery::new(MESSAGE_TABLE_CF);
            sq.time_only_row = true;
            sq.time_only_column = true;
            let catalog = message_catalog();
            plan.sub_queries
                .extend(expand_object_id(sq, params.table, false, catalog)?);
        }
        TableKind::Flow => {
            for role in [SessionRole::Server, SessionRole::Client] {
                plan.sub_queries
                    .push(default_session_sub_query(params.is_si, role));
            }
        }
        TableKind::Session => {
            plan.sub_queries
                .push(default_session_sub_query(params.is_si, params.session_role));
        }
        TableKind::Stat => {
            let (t, a) = stat_name_attr(params)?;
            let mut sq = WhereSubQuery::new(STATS_TABLE_CF);
            sq.row_key_suffix = vec![DbValue::Str(t), DbValue::Str(a)];
            sq.range.start.push(DbValue::Str(CLUSTER_STR_FLOOR.to_string()));
            sq.range
                .finish
                .push(DbValue::Str(CLUSTER_STR_CEILING.to_string()));
            plan.sub_queries.push(sq);
        }
        TableKind::ObjectValue => {}
    }
    Ok(())
}

fn compile_disjunct(
    disjunct: &[MatchTerm],
    params: &WhereParams,
    plan: &mut WherePlan,
) -> Result<(), QueryError> {
    match params.kind {
        TableKind::Message | TableKind::Object => compile_msg_disjunct(disjunct, params, plan),
        TableKind::Session => compile_session_disjunct(disjunct, params, plan),
        TableKind::Flow => compile_flow_disjunct(disjunct, params, plan),
        TableKind::Stat => compile_stat_disjunct(disjunct, params, plan),
        TableKind::ObjectValue => Ok(()),
    }
}

fn message_catalog() -> &'static TableCatalog {
    schema::catalog_for(TableKind::Message).expect("message catalog is static")
}

fn session_catalog() -> &'static TableCatalog {
    schema::catalog_for(TableKind::Session).expect("session catalog is static")
}

fn stats_catalog() -> &'static TableCatalog {
    schema::catalog_for(TableKind::Stat).expect("stats catalog is static")
}

fn stat_name_attr(params: &WhereParams) -> Result<(String, String), QueryError> {
    params
        .stat_name_attr
        .cloned()
        .ok_or_else(|| QueryError::InvalidArg("stat query without stat table name".to_string()))
}

fn default_session_sub_query(is_si: u8, role: SessionRole) -> WhereSubQuery {
    let mut sq = WhereSubQuery::new(SESSION_TABLE_CF);
    sq.row_key_suffix = vec![DbValue::U64(is_si as u64), DbValue::U64(role as u64)];
    sq.range.start.push(DbValue::U64(0));
    sq.range.finish.push(DbValue::U64(PORT_CEILING));
    sq.range.finish.push(DbValue::U64(PORT_CEILING));
    sq
}

fn store_op(op: MatchOp) -> StoreOp {
    match op {
        MatchOp::Prefix => StoreOp::Like,
        _ => StoreOp::Eq,
    }
}

/// Resolves the logical column, applies LIKE decoration and appends the
/// predicate. A predicate reduced to `%` matches everything and is elided.
fn push_predicate(
    catalog: &TableCatalog,
    predicates: &mut Vec<IndexPredicate>,
    logical: &str,
    op: StoreOp,
    value: &str,
) -> Result<(), QueryError> {
    let physical = catalog
        .physical_name(logical)
        .ok_or_else(|| QueryError::InvalidArg(format!("unknown where column `{logical}`")))?;
    let mut value = value.to_string();
    if op == StoreOp::Like {
        value.push('%');
    }
    if value == "%" {
        return Ok(());
    }
    predicates.push(IndexPredicate::new(physical, op, value));
    Ok(())
}

fn require_op(name: &str, op: MatchOp, allowed: &[MatchOp]) -> Result<(), QueryError> {
    if allowed.contains(&op) {
        Ok(())
    } else {
        Err(QueryError::InvalidArg(format!(
            "operator {op:?} is not valid for column `{name}`"
        )))
    }
}

fn range_value2(term: &MatchTerm) -> Result<String, QueryError> {
    term.value2
        .as_ref()
        .map(json_value_to_string)
        .ok_or_else(|| {
            QueryError::Parse(format!("range term `{}` has no value2", term.name))
        })
}

fn parse_port(name: &str, value: &str) -> Result<u64, QueryError> {
    value
        .parse::<u64>()
        .map_err(|_| QueryError::InvalidArg(format!("`{name}` value `{value}` is not numeric")))
}

// ---------------------------------------------------------------------------
// message / object log
// ---------------------------------------------------------------------------

fn compile_msg_disjunct(
    disjunct: &[MatchTerm],
    params: &WhereParams,
    plan: &mut WherePlan,
) -> Result<(), QueryError> {
    let catalog = message_catalog();
    let mut base = WhereSubQuery::new(MESSAGE_TABLE_CF);
    base.time_only_row = true;
    base.time_only_column = true;
    let mut object_id_specified = false;
    let mut filter_and: Vec<FilterMatch> = Vec::new();

    for term in disjunct {
        let value = json_value_to_string(&term.value);
        match term.name.as_str() {
            COL_SOURCE | COL_MODULE | COL_MESSAGE_TYPE => {
                require_op(
                    &term.name,
                    term.op,
                    &[MatchOp::Equal, MatchOp::Prefix, MatchOp::RegexMatch],
                )?;
                // patterns cannot be pushed down to the index
                if term.op == MatchOp::RegexMatch {
                    filter_and.push(FilterMatch::new(term.name.clone(), term.op, value)?);
                    plan.additional_select.push(term.name.clone());
                    continue;
                }
                push_predicate(
                    catalog,
                    &mut base.predicates,
                    &term.name,
                    store_op(term.op),
                    &value,
                )?;
            }
            COL_OBJECT_ID => {
                require_op(&term.name, term.op, &[MatchOp::Equal, MatchOp::Prefix])?;
                // stored as <ObjectType>:<ObjectId>
                let value = format!("{}:{}", params.table, value);
                push_predicate(
                    catalog,
                    &mut base.predicates,
                    "ObjectTypeName1",
                    store_op(term.op),
                    &value,
                )?;
                object_id_specified = true;
            }
            other => {
                return Err(QueryError::InvalidArg(format!(
                    "unknown where column `{other}`"
                )));
            }
        }
    }

    if !filter_and.is_empty() {
        plan.filter_list.push(filter_and);
    }
    if params.kind == TableKind::Object {
        plan.sub_queries
            .extend(expand_object_id(base, params.table, object_id_specified, catalog)?);
    } else {
        plan.sub_queries.push(base);
    }
    Ok(())
}

/// The object id may be stored in any of the object-id columns; one
/// sub-query per column, differing only in the predicate column.
fn expand_object_id(
    mut base: WhereSubQuery,
    table: &str,
    object_id_specified: bool,
    catalog: &TableCatalog,
) -> Result<Vec<WhereSubQuery>, QueryError> {
    if !object_id_specified {
        push_predicate(
            catalog,
            &mut base.predicates,
            "ObjectTypeName1",
            StoreOp::Like,
            &format!("{table}:"),
        )?;
    }
    let first_column = catalog
        .physical_name("ObjectTypeName1")
        .expect("catalog has object id columns");
    let Some(pred_index) = base
        .predicates
        .iter()
        .position(|p| p.column == first_column)
    else {
        return Ok(vec![base]);
    };
    let mut out = Vec::with_capacity(OBJECT_ID_COLUMNS);
    out.push(base.clone());
    for slot in 2..=OBJECT_ID_COLUMNS {
        let column = catalog
            .physical_name(&schema::object_id_column(slot))
            .ok_or_else(|| {
                QueryError::InvalidArg(format!("missing object id column {slot}"))
            })?;
        let mut sq = base.clone();
        sq.predicates[pred_index].column = column.to_string();
        out.push(sq);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RangeTerm {
    op: MatchOp,
    value: u64,
    value2: u64,
}

fn parse_range_term(term: &MatchTerm) -> Result<RangeTerm, QueryError> {
    require_op(&term.name, term.op, &[MatchOp::Equal, MatchOp::InRange])?;
    let value = parse_port(&term.name, &json_value_to_string(&term.value))?;
    let value2 = if term.op == MatchOp::InRange {
        parse_port(&term.name, &range_value2(term)?)?
    } else {
        value
    };
    Ok(RangeTerm {
        op: term.op,
        value,
        value2,
    })
}

fn push_cluster_range(range: &mut ClusteringRange, term: Option<&RangeTerm>, first: bool) {
    match term {
        Some(term) => {
            range.start.push(DbValue::U64(term.value));
            range.finish.push(DbValue::U64(term.value2));
        }
        None => {
            if first {
                range.start.push(DbValue::U64(0));
            }
            range.finish.push(DbValue::U64(PORT_CEILING));
        }
    }
}

fn compile_session_disjunct(
    disjunct: &[MatchTerm],
    params: &WhereParams,
    plan: &mut WherePlan,
) -> Result<(), QueryError> {
    let catalog = session_catalog();
    let mut proto = None;
    let mut sport = None;
    let mut rest: Vec<IndexPredicate> = Vec::new();
    let mut collections: [Vec<IndexPredicate>; 4] = Default::default();
    let mut filter_and: Vec<FilterMatch> = Vec::new();

    for term in disjunct {
        let value = json_value_to_string(&term.value);
        match term.name.as_str() {
            COL_PROTOCOL => proto = Some(parse_range_term(term)?),
            COL_SPORT => sport = Some(parse_range_term(term)?),
            name @ (schema::COL_LABELS
            | schema::COL_REMOTE_LABELS
            | schema::COL_CUSTOM_TAGS
            | schema::COL_REMOTE_CUSTOM_TAGS) => {
                require_op(name, term.op, &[MatchOp::Contains])?;
                let slot = match name {
                    schema::COL_LABELS => 0,
                    schema::COL_REMOTE_LABELS => 1,
                    schema::COL_CUSTOM_TAGS => 2,
                    _ => 3,
                };
                // collection containment compiles to %value%
                push_predicate(
                    catalog,
                    &mut collections[slot],
                    name,
                    StoreOp::Like,
                    &format!("%{value}"),
                )?;
            }
            name => {
                require_op(
                    name,
                    term.op,
                    &[MatchOp::Equal, MatchOp::Prefix, MatchOp::RegexMatch],
                )?;
                if term.op == MatchOp::RegexMatch {
                    filter_and.push(FilterMatch::new(name, term.op, value)?);
                    plan.additional_select.push(name.to_string());
                    continue;
                }
                push_predicate(catalog, &mut rest, name, store_op(term.op), &value)?;
            }
        }
    }
    if !filter_and.is_empty() {
        plan.filter_list.push(filter_and);
    }

    for where_vec in cross_multiply(rest, &collections) {
        let mut sq = default_session_range_sub_query(
            params.is_si,
            params.session_role,
            proto.as_ref(),
            sport.as_ref(),
        );
        sq.predicates = where_vec;
        plan.sub_queries.push(sq);
    }
    Ok(())
}

fn default_session_range_sub_query(
    is_si: u8,
    role: SessionRole,
    proto: Option<&RangeTerm>,
    sport: Option<&RangeTerm>,
) -> WhereSubQuery {
    let mut sq = WhereSubQuery::new(SESSION_TABLE_CF);
    sq.row_key_suffix = vec![DbValue::U64(is_si as u64), DbValue::U64(role as u64)];
    push_cluster_range(&mut sq.range, proto, true);
    push_cluster_range(&mut sq.range, sport, false);
    sq
}

/// Parallel index lists are cross-multiplied by the deepest list: list `i`
/// of the result carries the base predicates plus the `i`th entry of every
/// extra list that is long enough.
fn cross_multiply(
    base: Vec<IndexPredicate>,
    extras: &[Vec<IndexPredicate>],
) -> Vec<Vec<IndexPredicate>> {
    let depth = extras.iter().map(Vec::len).max().unwrap_or(0);
    if depth == 0 {
        return vec![base];
    }
    (0..depth)
        .map(|i| {
            let mut where_vec = base.clone();
            for extra in extras {
                if let Some(predicate) = extra.get(i) {
                    where_vec.push(predicate.clone());
                }
            }
            where_vec
        })
        .collect()
}

// ---------------------------------------------------------------------------
// flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StringTerm {
    op: MatchOp,
    value: String,
}

#[derive(Debug, Default)]
struct FlowTerms {
    proto: Option<RangeTerm>,
    sport: Option<RangeTerm>,
    dport: Option<RangeTerm>,
    source_ip: Option<StringTerm>,
    dest_ip: Option<StringTerm>,
    source_vn: Option<StringTerm>,
    dest_vn: Option<StringTerm>,
    vrouter: Option<StringTerm>,
}

fn compile_flow_disjunct(
    disjunct: &[MatchTerm],
    params: &WhereParams,
    plan: &mut WherePlan,
) -> Result<(), QueryError> {
    let mut terms = FlowTerms::default();
    for term in disjunct {
        let value = json_value_to_string(&term.value);
        match term.name.as_str() {
            COL_PROTOCOL => terms.proto = Some(parse_range_term(term)?),
            COL_SPORT => terms.sport = Some(parse_range_term(term)?),
            COL_DPORT => terms.dport = Some(parse_range_term(term)?),
            COL_SOURCE_IP | COL_DEST_IP => {
                require_op(&term.name, term.op, &[MatchOp::Equal, MatchOp::Prefix])?;
                let parsed = StringTerm {
                    op: term.op,
                    value,
                };
                if term.name == COL_SOURCE_IP {
                    terms.source_ip = Some(parsed);
                } else {
                    terms.dest_ip = Some(parsed);
                }
            }
            COL_SOURCE_VN | COL_DEST_VN => {
                require_op(&term.name, term.op, &[MatchOp::Equal, MatchOp::Prefix])?;
                let parsed = StringTerm {
                    op: term.op,
                    value,
                };
                if term.name == COL_SOURCE_VN {
                    terms.source_vn = Some(parsed);
                } else {
                    terms.dest_vn = Some(parsed);
                }
            }
            COL_VROUTER => {
                require_op(&term.name, term.op, &[MatchOp::Equal, MatchOp::Prefix])?;
                terms.vrouter = Some(StringTerm {
                    op: term.op,
                    value,
                });
            }
            other => {
                return Err(QueryError::InvalidArg(format!(
                    "unknown where column `{other}`"
                )));
            }
        }
    }

    let ingress = params.direction_ing == super::DIRECTION_INGRESS;
    let mut filter_and: Vec<FilterMatch> = Vec::new();
    // the direction-dependent side of the session row is not indexed and
    // must be matched after select
    if let (Some(sip), false) = (&terms.source_ip, ingress) {
        push_flow_filter(&mut filter_and, plan, COL_SOURCE_IP, sip.op, &sip.value, None)?;
    }
    if let (Some(dip), true) = (&terms.dest_ip, ingress) {
        push_flow_filter(&mut filter_and, plan, COL_DEST_IP, dip.op, &dip.value, None)?;
    }
    for (name, port) in [(COL_SPORT, &terms.sport), (COL_DPORT, &terms.dport)] {
        if let Some(port) = port {
            push_flow_filter(
                &mut filter_and,
                plan,
                name,
                port.op,
                &port.value.to_string(),
                (port.op == MatchOp::InRange).then(|| port.value2.to_string()),
            )?;
        }
    }
    if let Some(vrouter) = &terms.vrouter {
        // prefix spills as an unanchored pattern
        let op = match vrouter.op {
            MatchOp::Prefix => MatchOp::RegexMatch,
            other => other,
        };
        push_flow_filter(&mut filter_and, plan, COL_VROUTER, op, &vrouter.value, None)?;
    }
    if !filter_and.is_empty() {
        plan.filter_list.push(filter_and);
    }

    for role in [SessionRole::Client, SessionRole::Server] {
        plan.sub_queries
            .push(flow_role_sub_query(&terms, role, ingress, params)?);
    }
    Ok(())
}

fn push_flow_filter(
    filter_and: &mut Vec<FilterMatch>,
    plan: &mut WherePlan,
    name: &str,
    op: MatchOp,
    value: &str,
    value2: Option<String>,
) -> Result<(), QueryError> {
    let mut filter = FilterMatch::new(name, op, value)?;
    filter.value2 = value2;
    filter_and.push(filter);
    plan.additional_select.push(name.to_string());
    Ok(())
}

/// Builds the session sub-query for one role of a flow query. The queried
/// direction decides which of source/destination is the indexed local side;
/// the port clustering column additionally flips between the roles.
fn flow_role_sub_query(
    terms: &FlowTerms,
    role: SessionRole,
    ingress: bool,
    params: &WhereParams,
) -> Result<WhereSubQuery, QueryError> {
    let catalog = session_catalog();
    let port = match (role, ingress) {
        (SessionRole::Server, true) | (SessionRole::Client, false) => &terms.sport,
        (SessionRole::Client, true) | (SessionRole::Server, false) => &terms.dport,
    };
    let mut sq = default_session_range_sub_query(
        params.is_si,
        role,
        terms.proto.as_ref(),
        port.as_ref(),
    );

    let (local_ip, local_vn, remote_vn) = if ingress {
        (&terms.source_ip, &terms.source_vn, &terms.dest_vn)
    } else {
        (&terms.dest_ip, &terms.dest_vn, &terms.source_vn)
    };
    if let Some(ip) = local_ip {
        push_predicate(
            catalog,
            &mut sq.predicates,
            "local_ip",
            store_op(ip.op),
            &ip.value,
        )?;
    }
    if let Some(vn) = local_vn {
        push_predicate(catalog, &mut sq.predicates, "vn", store_op(vn.op), &vn.value)?;
    }
    if let Some(vn) = remote_vn {
        push_predicate(
            catalog,
            &mut sq.predicates,
            "remote_vn",
            store_op(vn.op),
            &vn.value,
        )?;
    }
    Ok(sq)
}

// ---------------------------------------------------------------------------
// stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StatSuffix {
    sname: String,
    sop: MatchOp,
    sval: DbValue,
    sval2: Option<DbValue>,
}

#[derive(Debug, Clone)]
struct StatTerm {
    pname: String,
    pop: MatchOp,
    pval: DbValue,
    pval2: Option<DbValue>,
    /// Suffix as specified in the query.
    suffix: Option<StatSuffix>,
    /// Schema-declared suffix substituted with its typed sentinel when the
    /// query names none; keeps the two-tag index usable.
    sentinel: Option<(String, DbValue)>,
}

fn json_to_dbvalue(value: &Value) -> Result<DbValue, QueryError> {
    match value {
        Value::String(s) => Ok(DbValue::Str(s.clone())),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(DbValue::U64(u))
            } else if let Some(i) = n.as_i64() {
                Ok(DbValue::U64(i.max(0) as u64))
            } else {
                Ok(DbValue::Double(n.as_f64().unwrap_or(0.0)))
            }
        }
        other => Err(QueryError::Parse(format!(
            "where term value has unsupported type: {other}"
        ))),
    }
}

fn coerce_dbvalue(value: &DbValue, datatype: ColumnType) -> DbValue {
    let text = value.to_string();
    match datatype {
        ColumnType::U64 => DbValue::U64(text.parse().unwrap_or(0)),
        ColumnType::Double => DbValue::Double(text.parse().unwrap_or(0.0)),
        _ => DbValue::Str(text),
    }
}

fn stat_term_parse(
    term: &MatchTerm,
    schema: Option<&StatSchema>,
) -> Result<StatTerm, QueryError> {
    let mut parsed = StatTerm {
        pname: term.name.clone(),
        pop: term.op,
        pval: json_to_dbvalue(&term.value)?,
        pval2: term
            .value2
            .as_ref()
            .map(json_to_dbvalue)
            .transpose()?,
        suffix: None,
        sentinel: None,
    };

    if let Some(suffix) = &term.suffix {
        // a suffix narrows an exact prefix match, nothing else
        if parsed.pop != MatchOp::Equal {
            return Err(QueryError::InvalidArg(
                "suffix terms require an EQUAL prefix".to_string(),
            ));
        }
        if parsed.pval2.is_some() {
            return Err(QueryError::InvalidArg(
                "suffix terms take no prefix value2".to_string(),
            ));
        }
        parsed.suffix = Some(StatSuffix {
            sname: suffix.name.clone(),
            sop: suffix.op,
            sval: json_to_dbvalue(&suffix.value)?,
            sval2: suffix
                .value2
                .as_ref()
                .map(json_to_dbvalue)
                .transpose()?,
        });
    }

    // without a schema (dynamic table, none supplied) terms pass unvalidated
    let Some(schema) = schema else {
        return Ok(parsed);
    };

    let cdesc = schema.column_desc(&parsed.pname).ok_or_else(|| {
        QueryError::InvalidArg(format!("unknown stat column `{}`", parsed.pname))
    })?;
    if !cdesc.index {
        return Err(QueryError::InvalidArg(format!(
            "stat column `{}` is not indexed",
            parsed.pname
        )));
    }
    if cdesc.datatype == ColumnType::List && parsed.pop != MatchOp::Contains {
        return Err(QueryError::InvalidArg(format!(
            "collection column `{}` supports CONTAINS only",
            parsed.pname
        )));
    }
    parsed.pval = coerce_dbvalue(&parsed.pval, cdesc.datatype);
    parsed.pval2 = parsed
        .pval2
        .as_ref()
        .map(|v| coerce_dbvalue(v, cdesc.datatype));

    if cdesc.suffixes.is_empty() {
        if parsed.suffix.is_some() {
            return Err(QueryError::InvalidArg(format!(
                "stat column `{}` declares no suffix",
                parsed.pname
            )));
        }
        return Ok(parsed);
    }

    let suffix_desc_of = |sname: &str| {
        schema
            .column_desc(sname)
            .filter(|desc| matches!(desc.datatype, ColumnType::Str | ColumnType::U64))
            .ok_or_else(|| {
                QueryError::InvalidArg(format!("suffix column `{sname}` is not usable"))
            })
    };
    match &mut parsed.suffix {
        None => {
            let sname = cdesc
                .suffixes
                .iter()
                .next()
                .expect("non-empty suffix set")
                .clone();
            let sdesc = suffix_desc_of(&sname)?;
            let sentinel = match sdesc.datatype {
                ColumnType::U64 => DbValue::U64(0),
                _ => DbValue::Str(String::new()),
            };
            parsed.sentinel = Some((sname, sentinel));
        }
        Some(suffix) => {
            if !cdesc.suffixes.contains(&suffix.sname) {
                return Err(QueryError::InvalidArg(format!(
                    "`{}` is not a suffix of `{}`",
                    suffix.sname, parsed.pname
                )));
            }
            let sdesc = suffix_desc_of(&suffix.sname)?;
            suffix.sval = coerce_dbvalue(&suffix.sval, sdesc.datatype);
            suffix.sval2 = suffix
                .sval2
                .as_ref()
                .map(|v| coerce_dbvalue(v, sdesc.datatype));
        }
    }
    Ok(parsed)
}

fn compile_stat_disjunct(
    disjunct: &[MatchTerm],
    params: &WhereParams,
    plan: &mut WherePlan,
) -> Result<(), QueryError> {
    let (t, a) = stat_name_attr(params)?;
    let mut name_match: Option<(MatchOp, DbValue)> = None;
    let mut where_vec_stats: Vec<IndexPredicate> = Vec::new();
    let mut tag_vecs: [Vec<IndexPredicate>; STAT_TAG_SHARDS] = Default::default();

    for term in disjunct {
        let parsed = stat_term_parse(term, params.stat_schema)?;
        if params.legacy_stats {
            match stat_legacy_sub_query(&parsed, &t, &a) {
                Some(sq) => plan.sub_queries.push(sq),
                None => debug!(term = %parsed.pname, "term has no legacy index, skipping"),
            }
        }

        apply_stat_field(
            &parsed.pname,
            parsed.pop,
            &parsed.pval,
            &mut name_match,
            &mut where_vec_stats,
            &mut tag_vecs,
        )?;
        if let Some(suffix) = &parsed.suffix {
            apply_stat_field(
                &suffix.sname,
                suffix.sop,
                &suffix.sval,
                &mut name_match,
                &mut where_vec_stats,
                &mut tag_vecs,
            )?;
        }
    }

    for where_vec in cross_multiply(where_vec_stats, &tag_vecs) {
        let mut sq = WhereSubQuery::new(STATS_TABLE_CF);
        sq.row_key_suffix = vec![DbValue::Str(t.clone()), DbValue::Str(a.clone())];
        sq.predicates = where_vec;
        match &name_match {
            Some((MatchOp::Equal, value)) => {
                sq.range.start.push(value.clone());
                sq.range.finish.push(value.clone());
            }
            Some((MatchOp::Prefix, value)) => {
                sq.range.start.push(value.clone());
                sq.range
                    .finish
                    .push(DbValue::Str(format!("{value}{PREFIX_CEILING}")));
            }
            Some((op, _)) => {
                return Err(QueryError::InvalidArg(format!(
                    "operator {op:?} is not valid for the stat name column"
                )));
            }
            None => {
                sq.range.start.push(DbValue::Str(CLUSTER_STR_FLOOR.to_string()));
                sq.range
                    .finish
                    .push(DbValue::Str(CLUSTER_STR_CEILING.to_string()));
            }
        }
        plan.sub_queries.push(sq);
    }
    Ok(())
}

/// Routes one stat field to the name clustering range, a well-known index
/// column, or a tag shard.
fn apply_stat_field(
    name: &str,
    op: MatchOp,
    value: &DbValue,
    name_match: &mut Option<(MatchOp, DbValue)>,
    where_vec_stats: &mut Vec<IndexPredicate>,
    tag_vecs: &mut [Vec<IndexPredicate>; STAT_TAG_SHARDS],
) -> Result<(), QueryError> {
    let catalog = stats_catalog();
    if name == STATS_NAME_FIELD {
        *name_match = Some((op, value.clone()));
        return Ok(());
    }
    let well_known = if name.eq_ignore_ascii_case(STATS_SOURCE_FIELD) {
        Some(STATS_SOURCE_FIELD)
    } else if name == STATS_KEY_FIELD || name.ends_with(".key") {
        Some(STATS_KEY_FIELD)
    } else if name == STATS_PROXY_FIELD || name.ends_with(".proxy") {
        Some(STATS_PROXY_FIELD)
    } else {
        None
    };
    if let Some(logical) = well_known {
        require_op(name, op, &[MatchOp::Equal, MatchOp::Prefix])?;
        let text = value.to_string();
        if op == MatchOp::Equal {
            push_predicate(catalog, where_vec_stats, logical, StoreOp::Eq, &text)?;
        } else if !text.is_empty() {
            push_predicate(catalog, where_vec_stats, logical, StoreOp::Like, &text)?;
        }
        return Ok(());
    }
    // everything else indexes through the hashed tag shards
    let shard = schema::stat_tag_shard(name);
    let text = format!("%{name}={value}");
    push_predicate(
        catalog,
        &mut tag_vecs[shard],
        &schema::stat_tag_shard_column(shard),
        StoreOp::Like,
        &text,
    )
}

/// Pushes the `[start, finish]` pair for one legacy clustering column.
fn stat_slicer(
    range: &mut ClusteringRange,
    op: MatchOp,
    value: &DbValue,
    value2: Option<&DbValue>,
) -> bool {
    match value {
        DbValue::Str(s) => {
            if !matches!(op, MatchOp::Equal | MatchOp::Prefix) {
                return false;
            }
            range.start.push(value.clone());
            if op == MatchOp::Prefix {
                range
                    .finish
                    .push(DbValue::Str(format!("{s}{PREFIX_CEILING}")));
            } else {
                range.finish.push(value.clone());
            }
        }
        _ => {
            if !matches!(op, MatchOp::Equal | MatchOp::InRange) {
                return false;
            }
            range.start.push(value.clone());
            if op == MatchOp::InRange {
                let Some(value2) = value2 else {
                    return false;
                };
                range.finish.push(value2.clone());
            } else {
                range.finish.push(value.clone());
            }
        }
    }
    true
}

/// Compiles one term against the legacy per-type tag tables. Terms that do
/// not fit any legacy index yield `None` and are skipped.
fn stat_legacy_sub_query(parsed: &StatTerm, t: &str, a: &str) -> Option<WhereSubQuery> {
    let (sname, sop, sval, sval2) = match (&parsed.suffix, &parsed.sentinel) {
        (Some(suffix), _) => (
            Some(suffix.sname.as_str()),
            Some(suffix.sop),
            Some(&suffix.sval),
            suffix.sval2.as_ref(),
        ),
        (None, Some((sname, sentinel))) => (Some(sname.as_str()), None, Some(sentinel), None),
        (None, None) => (None, None, None, None),
    };

    let cf_name = match sval {
        None => match &parsed.pval {
            DbValue::Str(_) => STATS_TABLE_BY_STR_TAG,
            DbValue::U64(_) => STATS_TABLE_BY_U64_TAG,
            DbValue::Double(_) => STATS_TABLE_BY_DBL_TAG,
            DbValue::Uuid(_) => return None,
        },
        Some(sval) => match (&parsed.pval, sval) {
            (DbValue::Str(_), DbValue::Str(_)) => STATS_TABLE_BY_STR_STR_TAG,
            (DbValue::Str(_), DbValue::U64(_)) => STATS_TABLE_BY_STR_U64_TAG,
            (DbValue::U64(_), DbValue::Str(_)) => STATS_TABLE_BY_U64_STR_TAG,
            (DbValue::U64(_), DbValue::U64(_)) => STATS_TABLE_BY_U64_U64_TAG,
            _ => return None,
        },
    };

    let mut sq = WhereSubQuery::new(cf_name);
    sq.generation = SchemaGeneration::Legacy;
    sq.row_key_suffix = vec![
        DbValue::Str(t.to_string()),
        DbValue::Str(a.to_string()),
        DbValue::Str(parsed.pname.clone()),
    ];
    if let Some(sname) = sname {
        sq.row_key_suffix.push(DbValue::Str(sname.to_string()));
    }

    match (sval, sop) {
        (None, _) => {
            if !stat_slicer(&mut sq.range, parsed.pop, &parsed.pval, parsed.pval2.as_ref()) {
                return None;
            }
        }
        (Some(sval), None) => {
            // sentinel suffix: slice on the prefix, leave the suffix open
            if !stat_slicer(&mut sq.range, parsed.pop, &parsed.pval, parsed.pval2.as_ref()) {
                return None;
            }
            match sval {
                DbValue::U64(_) => {
                    sq.range.start.push(DbValue::U64(0));
                    sq.range.finish.push(DbValue::U64(u64::MAX));
                }
                _ => {
                    sq.range.start.push(DbValue::Str(CLUSTER_STR_FLOOR.to_string()));
                    sq.range
                        .finish
                        .push(DbValue::Str(CLUSTER_STR_CEILING.to_string()));
                }
            }
        }
        (Some(sval), Some(sop)) => {
            // exact prefix, slice on the suffix
            if parsed.pop != MatchOp::Equal {
                return None;
            }
            sq.range.start.push(parsed.pval.clone());
            sq.range.finish.push(parsed.pval.clone());
            if !stat_slicer(&mut sq.range, sop, sval, sval2) {
                return None;
            }
        }
    }
    Some(sq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use analytics_api::SchemaColumn;
    use serde_json::json;

    fn term(name: &str, op: MatchOp, value: Value) -> MatchTerm {
        MatchTerm {
            name: name.into(),
            op,
            value,
            value2: None,
            suffix: None,
        }
    }

    fn range_term(name: &str, value: Value, value2: Value) -> MatchTerm {
        MatchTerm {
            name: name.into(),
            op: MatchOp::InRange,
            value,
            value2: Some(value2),
            suffix: None,
        }
    }

    fn message_params<'a>() -> WhereParams<'a> {
        WhereParams {
            kind: TableKind::Message,
            table: "MessageTable",
            stat_name_attr: None,
            stat_schema: None,
            session_role: SessionRole::Server,
            is_si: 0,
            direction_ing: 1,
            legacy_stats: false,
        }
    }

    fn compile_one(terms: Vec<MatchTerm>, params: &WhereParams) -> WherePlan {
        compile(Some(&vec![terms]), -1, params).unwrap()
    }

    #[test]
    fn prefix_on_indexed_column_becomes_like_predicate() {
        let plan = compile_one(
            vec![term("Source", MatchOp::Prefix, json!("abc"))],
            &message_params(),
        );
        assert_eq!(plan.wterms, 1);
        assert_eq!(plan.sub_queries.len(), 1);
        let sq = &plan.sub_queries[0];
        assert_eq!(sq.cf_name, MESSAGE_TABLE_CF);
        assert_eq!(
            sq.predicates,
            vec![IndexPredicate::new("source", StoreOp::Like, "abc%")]
        );
        assert!(sq.range.start.is_empty());
    }

    #[test]
    fn equal_terms_accumulate_in_one_sub_query() {
        let plan = compile_one(
            vec![
                term("Source", MatchOp::Equal, json!("a6s4")),
                term("Messagetype", MatchOp::Equal, json!("UveTest")),
            ],
            &message_params(),
        );
        assert_eq!(plan.sub_queries.len(), 1);
        assert_eq!(plan.sub_queries[0].predicates.len(), 2);
    }

    #[test]
    fn unknown_column_is_invalid_arg() {
        let result = compile(
            Some(&vec![vec![term("NoSuchCol", MatchOp::Equal, json!("x"))]]),
            -1,
            &message_params(),
        );
        assert!(matches!(result, Err(QueryError::InvalidArg(_))));
    }

    #[test]
    fn unsupported_operator_is_invalid_arg() {
        let result = compile(
            Some(&vec![vec![term("Source", MatchOp::InRange, json!("a"))]]),
            -1,
            &message_params(),
        );
        assert!(matches!(result, Err(QueryError::InvalidArg(_))));
    }

    #[test]
    fn regex_terms_spill_to_post_filters() {
        let plan = compile_one(
            vec![
                term("Source", MatchOp::RegexMatch, json!("^a6.*")),
                term("Messagetype", MatchOp::Equal, json!("UveTest")),
            ],
            &message_params(),
        );
        // only the equality is pushed down
        assert_eq!(plan.sub_queries.len(), 1);
        assert_eq!(
            plan.sub_queries[0].predicates,
            vec![IndexPredicate::new("message_type", StoreOp::Eq, "UveTest")]
        );
        assert_eq!(plan.filter_list.len(), 1);
        assert_eq!(plan.filter_list[0][0].name, "Source");
        assert_eq!(plan.filter_list[0][0].op, MatchOp::RegexMatch);
        assert_eq!(plan.additional_select, vec!["Source".to_string()]);
    }

    #[test]
    fn empty_disjunct_is_invalid_arg() {
        let result = compile(Some(&vec![vec![]]), -1, &message_params());
        assert!(matches!(result, Err(QueryError::InvalidArg(_))));
    }

    #[test]
    fn or_number_selects_a_single_disjunct() {
        let clause = vec![
            vec![term("Source", MatchOp::Equal, json!("a"))],
            vec![term("Source", MatchOp::Equal, json!("b"))],
        ];
        let plan = compile(Some(&clause), 1, &message_params()).unwrap();
        assert_eq!(plan.wterms, 2);
        assert_eq!(plan.sub_queries.len(), 1);
        assert_eq!(plan.sub_queries[0].predicates[0].value, "b");
    }

    #[test]
    fn object_id_fans_out_over_all_slots() {
        let params = WhereParams {
            kind: TableKind::Object,
            table: "ObjectVNTable",
            ..message_params()
        };
        let plan = compile_one(
            vec![term("ObjectId", MatchOp::Equal, json!("vn42"))],
            &params,
        );
        assert_eq!(plan.sub_queries.len(), OBJECT_ID_COLUMNS);
        let columns: Vec<&str> = plan
            .sub_queries
            .iter()
            .map(|sq| sq.predicates[0].column.as_str())
            .collect();
        assert_eq!(
            columns,
            vec![
                "object_value_1",
                "object_value_2",
                "object_value_3",
                "object_value_4",
                "object_value_5",
                "object_value_6"
            ]
        );
        for sq in &plan.sub_queries {
            assert_eq!(sq.predicates[0].value, "ObjectVNTable:vn42");
        }
    }

    #[test]
    fn object_where_star_scans_by_type_prefix() {
        let params = WhereParams {
            kind: TableKind::Object,
            table: "ObjectVNTable",
            ..message_params()
        };
        let plan = compile(None, -1, &params).unwrap();
        assert_eq!(plan.wterms, 1);
        assert_eq!(plan.sub_queries.len(), OBJECT_ID_COLUMNS);
        assert_eq!(plan.sub_queries[0].predicates[0].value, "ObjectVNTable:%");
    }

    fn session_params<'a>() -> WhereParams<'a> {
        WhereParams {
            kind: TableKind::Session,
            table: "SessionRecordTable",
            session_role: SessionRole::Client,
            ..message_params()
        }
    }

    #[test]
    fn numeric_range_becomes_clustering_range() {
        let plan = compile_one(
            vec![range_term("sport", json!("100"), json!("200"))],
            &session_params(),
        );
        assert_eq!(plan.sub_queries.len(), 1);
        let sq = &plan.sub_queries[0];
        assert!(sq.predicates.is_empty());
        // [proto floor, sport low] .. [proto ceiling, sport high]
        assert_eq!(sq.range.start, vec![DbValue::U64(0), DbValue::U64(100)]);
        assert_eq!(
            sq.range.finish,
            vec![DbValue::U64(0xffff), DbValue::U64(200)]
        );
        assert_eq!(
            sq.row_key_suffix,
            vec![DbValue::U64(0), DbValue::U64(SessionRole::Client as u64)]
        );
    }

    #[test]
    fn protocol_equality_pins_the_first_clustering_column() {
        let plan = compile_one(
            vec![
                term("protocol", MatchOp::Equal, json!(6)),
                range_term("sport", json!(100), json!(200)),
            ],
            &session_params(),
        );
        let sq = &plan.sub_queries[0];
        assert_eq!(sq.range.start, vec![DbValue::U64(6), DbValue::U64(100)]);
        assert_eq!(sq.range.finish, vec![DbValue::U64(6), DbValue::U64(200)]);
    }

    #[test]
    fn collection_contains_cross_multiplies() {
        let plan = compile_one(
            vec![
                term("vn", MatchOp::Equal, json!("frontend")),
                term("labels", MatchOp::Contains, json!("tier1")),
                term("labels", MatchOp::Contains, json!("tier2")),
                term("custom_tags", MatchOp::Contains, json!("blue")),
            ],
            &session_params(),
        );
        // the deepest collection list sets the fan-out
        assert_eq!(plan.sub_queries.len(), 2);
        let first = &plan.sub_queries[0].predicates;
        assert!(first.contains(&IndexPredicate::new("vn", StoreOp::Eq, "frontend")));
        assert!(first.contains(&IndexPredicate::new("labels", StoreOp::Like, "%tier1%")));
        assert!(first.contains(&IndexPredicate::new("custom_tags", StoreOp::Like, "%blue%")));
        let second = &plan.sub_queries[1].predicates;
        assert!(second.contains(&IndexPredicate::new("labels", StoreOp::Like, "%tier2%")));
        assert!(!second
            .iter()
            .any(|p| p.column == "custom_tags"));
    }

    #[test]
    fn contains_is_required_on_collections() {
        let result = compile(
            Some(&vec![vec![term("labels", MatchOp::Equal, json!("x"))]]),
            -1,
            &session_params(),
        );
        assert!(matches!(result, Err(QueryError::InvalidArg(_))));
    }

    fn flow_params(direction_ing: u8) -> WhereParams<'static> {
        WhereParams {
            kind: TableKind::Flow,
            table: "FlowSeriesTable",
            direction_ing,
            ..message_params()
        }
    }

    #[test]
    fn flow_compiles_one_sub_query_per_role() {
        let plan = compile_one(
            vec![term("sourceip", MatchOp::Equal, json!("10.0.0.1"))],
            &flow_params(1),
        );
        assert_eq!(plan.sub_queries.len(), 2);
        // ingress: the source is the indexed local endpoint for both roles
        for sq in &plan.sub_queries {
            assert_eq!(
                sq.predicates,
                vec![IndexPredicate::new("local_ip", StoreOp::Eq, "10.0.0.1")]
            );
        }
        // the indexed side needs no post filter
        assert!(plan.filter_list.is_empty());
    }

    #[test]
    fn flow_direction_spills_the_unindexed_side_to_filters() {
        let plan = compile_one(
            vec![term("destip", MatchOp::Equal, json!("10.0.0.9"))],
            &flow_params(1),
        );
        assert_eq!(plan.filter_list.len(), 1);
        assert_eq!(plan.filter_list[0][0].name, "destip");
        assert_eq!(plan.filter_list[0][0].value, "10.0.0.9");
        assert_eq!(plan.additional_select, vec!["destip".to_string()]);
        // the destination is not indexed in an ingress query
        for sq in &plan.sub_queries {
            assert!(sq.predicates.is_empty());
        }
        // with the direction flipped it becomes the indexed local side
        let plan = compile_one(
            vec![term("destip", MatchOp::Equal, json!("10.0.0.9"))],
            &flow_params(0),
        );
        assert!(plan.filter_list.is_empty());
        for sq in &plan.sub_queries {
            assert_eq!(
                sq.predicates,
                vec![IndexPredicate::new("local_ip", StoreOp::Eq, "10.0.0.9")]
            );
        }
    }

    #[test]
    fn flow_ports_always_spill_to_filters() {
        let plan = compile_one(
            vec![
                term("protocol", MatchOp::Equal, json!(17)),
                range_term("sport", json!(1000), json!(2000)),
            ],
            &flow_params(1),
        );
        let filters = &plan.filter_list[0];
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].name, "sport");
        assert_eq!(filters[0].value2.as_deref(), Some("2000"));
        // ingress: sport is the server-local port
        let server = &plan.sub_queries[1];
        assert_eq!(server.range.start, vec![DbValue::U64(17), DbValue::U64(1000)]);
        assert_eq!(server.range.finish, vec![DbValue::U64(17), DbValue::U64(2000)]);
        let client = &plan.sub_queries[0];
        assert_eq!(client.range.finish, vec![DbValue::U64(17), DbValue::U64(0xffff)]);
    }

    #[test]
    fn vrouter_prefix_spills_as_regex_filter() {
        let plan = compile_one(
            vec![term("vrouter", MatchOp::Prefix, json!("compute-"))],
            &flow_params(1),
        );
        assert_eq!(plan.filter_list[0][0].op, MatchOp::RegexMatch);
    }

    fn stat_schema() -> StatSchema {
        StatSchema::from_api(&[
            SchemaColumn {
                name: "T=MyTag".into(),
                datatype: "string".into(),
                index: true,
                suffixes: vec!["source".into()],
            },
            SchemaColumn {
                name: "source".into(),
                datatype: "string".into(),
                index: true,
                suffixes: vec![],
            },
            SchemaColumn {
                name: "vn".into(),
                datatype: "string".into(),
                index: true,
                suffixes: vec![],
            },
            SchemaColumn {
                name: "pkts".into(),
                datatype: "int".into(),
                index: true,
                suffixes: vec![],
            },
        ])
        .unwrap()
    }

    fn stat_params<'a>(
        name_attr: &'a (String, String),
        schema: &'a StatSchema,
        legacy: bool,
    ) -> WhereParams<'a> {
        WhereParams {
            kind: TableKind::Stat,
            table: "StatTable.MyStats.data",
            stat_name_attr: Some(name_attr),
            stat_schema: Some(schema),
            legacy_stats: legacy,
            ..message_params()
        }
    }

    #[test]
    fn stat_suffix_term_hits_shard_and_suffix_column() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let schema = stat_schema();
        let params = stat_params(&name_attr, &schema, false);
        let mut t = term("T=MyTag", MatchOp::Equal, json!("v1"));
        t.suffix = Some(Box::new(term("source", MatchOp::Equal, json!("s1"))));
        let plan = compile_one(vec![t], &params);

        assert_eq!(plan.sub_queries.len(), 1);
        let sq = &plan.sub_queries[0];
        assert_eq!(sq.cf_name, STATS_TABLE_CF);
        assert_eq!(
            sq.row_key_suffix,
            vec![DbValue::Str("MyStats".into()), DbValue::Str("data".into())]
        );
        let shard = schema::stat_tag_shard("T=MyTag");
        let shard_column = schema::stat_tag_shard_column(shard);
        assert!(sq
            .predicates
            .contains(&IndexPredicate::new(shard_column, StoreOp::Like, "%T=MyTag=v1%")));
        assert!(sq
            .predicates
            .contains(&IndexPredicate::new("source", StoreOp::Eq, "s1")));
    }

    #[test]
    fn stat_name_term_drives_the_clustering_range() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let params = WhereParams {
            stat_schema: None,
            ..stat_params(&name_attr, Box::leak(Box::new(stat_schema())), false)
        };
        let plan = compile_one(vec![term("name", MatchOp::Prefix, json!("vn-"))], &params);
        let sq = &plan.sub_queries[0];
        assert_eq!(sq.range.start, vec![DbValue::Str("vn-".into())]);
        assert_eq!(sq.range.finish, vec![DbValue::Str("vn-\x7f".into())]);
    }

    #[test]
    fn stat_unknown_or_unindexed_columns_are_rejected() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let schema = StatSchema::from_api(&[SchemaColumn {
            name: "noidx".into(),
            datatype: "string".into(),
            index: false,
            suffixes: vec![],
        }])
        .unwrap();
        let params = stat_params(&name_attr, &schema, false);
        for name in ["missing", "noidx"] {
            let result = compile(
                Some(&vec![vec![term(name, MatchOp::Equal, json!("x"))]]),
                -1,
                &params,
            );
            assert!(matches!(result, Err(QueryError::InvalidArg(_))), "{name}");
        }
    }

    #[test]
    fn stat_suffix_requires_equal_prefix() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let schema = stat_schema();
        let params = stat_params(&name_attr, &schema, false);
        let mut t = term("T=MyTag", MatchOp::Prefix, json!("v"));
        t.suffix = Some(Box::new(term("source", MatchOp::Equal, json!("s1"))));
        let result = compile(Some(&vec![vec![t]]), -1, &params);
        assert!(matches!(result, Err(QueryError::InvalidArg(_))));
    }

    #[test]
    fn legacy_schema_adds_parallel_legacy_sub_queries() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let schema = stat_schema();
        let params = stat_params(&name_attr, &schema, true);
        let plan = compile_one(vec![term("vn", MatchOp::Equal, json!("frontend"))], &params);

        let legacy: Vec<_> = plan
            .sub_queries
            .iter()
            .filter(|sq| sq.generation == SchemaGeneration::Legacy)
            .collect();
        let current: Vec<_> = plan
            .sub_queries
            .iter()
            .filter(|sq| sq.generation == SchemaGeneration::Current)
            .collect();
        assert_eq!(legacy.len(), 1);
        assert_eq!(current.len(), 1);
        let sq = legacy[0];
        assert_eq!(sq.cf_name, STATS_TABLE_BY_STR_TAG);
        assert_eq!(
            sq.row_key_suffix,
            vec![
                DbValue::Str("MyStats".into()),
                DbValue::Str("data".into()),
                DbValue::Str("vn".into())
            ]
        );
        assert_eq!(sq.range.start, vec![DbValue::Str("frontend".into())]);
        assert_eq!(sq.range.finish, vec![DbValue::Str("frontend".into())]);
    }

    #[test]
    fn legacy_two_tag_table_follows_value_types() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let schema = stat_schema();
        let params = stat_params(&name_attr, &schema, true);
        let mut t = term("T=MyTag", MatchOp::Equal, json!("v1"));
        t.suffix = Some(Box::new(term("source", MatchOp::Equal, json!("s1"))));
        let plan = compile_one(vec![t], &params);
        let legacy: Vec<_> = plan
            .sub_queries
            .iter()
            .filter(|sq| sq.generation == SchemaGeneration::Legacy)
            .collect();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].cf_name, STATS_TABLE_BY_STR_STR_TAG);
        assert_eq!(legacy[0].row_key_suffix.len(), 4);
        assert_eq!(
            legacy[0].range.start,
            vec![DbValue::Str("v1".into()), DbValue::Str("s1".into())]
        );
    }

    #[test]
    fn compile_is_deterministic() {
        let name_attr = ("MyStats".to_string(), "data".to_string());
        let schema = stat_schema();
        let params = stat_params(&name_attr, &schema, true);
        let clause = vec![vec![
            term("vn", MatchOp::Equal, json!("frontend")),
            term("pkts", MatchOp::Equal, json!(5)),
        ]];
        let a = compile(Some(&clause), -1, &params).unwrap();
        let b = compile(Some(&clause), -1, &params).unwrap();
        assert_eq!(a, b);
    }
}
