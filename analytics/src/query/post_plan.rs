//! Post-processing plan: filter, sort, limit.
//!
//! Filters arrive in two JSON shapes, a legacy flat AND-list and the current
//! OR-of-ANDs; both compile to the same structure. Regex filters compile
//! their pattern here so row matching never pays compilation.

use std::cmp::Ordering;

use analytics_api::{MatchOp, QuerySpec, SortOrder};
use regex::Regex;
use serde_json::Value;

use super::{json_value_to_string, QueryError};
use crate::sink::{ResultBuffer, ResultRow, RowMap};

/// One filter term applied to a result row.
#[derive(Debug, Clone)]
pub struct FilterMatch {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    /// Upper bound for range filters.
    pub value2: Option<String>,
    /// Rows missing the column pass instead of failing the filter.
    pub ignore_col_absence: bool,
    regex: Option<Regex>,
}

impl PartialEq for FilterMatch {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.op == other.op
            && self.value == other.value
            && self.value2 == other.value2
            && self.ignore_col_absence == other.ignore_col_absence
    }
}

impl FilterMatch {
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Result<Self, QueryError> {
        let name = name.into();
        let value = value.into();
        let regex = match op {
            MatchOp::RegexMatch => Some(
                Regex::new(&value)
                    .map_err(|err| QueryError::InvalidArg(format!("bad filter regex: {err}")))?,
            ),
            _ => None,
        };
        Ok(Self {
            name,
            op,
            value,
            value2: None,
            ignore_col_absence: false,
            regex,
        })
    }

    pub fn matches(&self, row: &RowMap) -> bool {
        let Some(actual) = row.get(&self.name) else {
            return self.ignore_col_absence;
        };
        match self.op {
            MatchOp::Equal => actual == &self.value,
            MatchOp::NotEqual => actual != &self.value,
            MatchOp::Prefix => actual.starts_with(&self.value),
            MatchOp::RegexMatch => self
                .regex
                .as_ref()
                .is_some_and(|re| re.is_match(actual)),
            MatchOp::InRange => {
                let Some(value2) = &self.value2 else {
                    return false;
                };
                compare_typed(actual, &self.value, "int") != Ordering::Less
                    && compare_typed(actual, value2, "int") != Ordering::Greater
            }
            MatchOp::Leq => compare_typed(actual, &self.value, "int") != Ordering::Greater,
            MatchOp::Geq => compare_typed(actual, &self.value, "int") != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub name: String,
    pub datatype: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostProcessPlan {
    /// OR of ANDs; an empty list admits every row.
    pub filter_list: Vec<Vec<FilterMatch>>,
    pub sorted: bool,
    pub sort_order: SortOrder,
    pub sort_fields: Vec<SortField>,
    pub limit: Option<usize>,
}

impl PostProcessPlan {
    pub fn matches(&self, row: &RowMap) -> bool {
        if self.filter_list.is_empty() {
            return true;
        }
        self.filter_list
            .iter()
            .any(|conjunct| conjunct.iter().all(|f| f.matches(row)))
    }

    pub fn compare_rows(&self, a: &ResultRow, b: &ResultRow) -> Ordering {
        for field in &self.sort_fields {
            let av = a.row.get(&field.name).map(String::as_str).unwrap_or("");
            let bv = b.row.get(&field.name).map(String::as_str).unwrap_or("");
            let ord = compare_typed(av, bv, &field.datatype);
            let ord = match self.sort_order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.metadata.timestamp.cmp(&b.metadata.timestamp)
    }

    /// Applies filter, sort and limit to one chunk's buffer.
    pub fn process(&self, buffer: ResultBuffer) -> ResultBuffer {
        let mut rows: ResultBuffer = buffer
            .into_iter()
            .filter(|r| self.matches(&r.row))
            .collect();
        if self.sorted {
            rows.sort_by(|a, b| self.compare_rows(a, b));
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

fn compare_typed(a: &str, b: &str, datatype: &str) -> Ordering {
    match datatype {
        "int" => {
            let (Ok(an), Ok(bn)) = (a.parse::<u64>(), b.parse::<u64>()) else {
                return a.cmp(b);
            };
            an.cmp(&bn)
        }
        "double" => {
            let (Ok(af), Ok(bf)) = (a.parse::<f64>(), b.parse::<f64>()) else {
                return a.cmp(b);
            };
            af.total_cmp(&bf)
        }
        _ => a.cmp(b),
    }
}

/// Compiles the post-processing members of the descriptor. `datatype_of`
/// resolves a sort column to its datatype for type-aware comparison.
pub fn compile<F>(spec: &QuerySpec, datatype_of: F) -> Result<PostProcessPlan, QueryError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut plan = PostProcessPlan {
        sorted: spec.sort.is_some(),
        sort_order: spec.sort.unwrap_or_default(),
        limit: spec.limit,
        ..Default::default()
    };

    if let Some(fields) = &spec.sort_fields {
        for name in fields {
            let datatype = datatype_of(name).unwrap_or_else(|| "string".to_string());
            plan.sort_fields.push(SortField {
                name: name.clone(),
                datatype,
            });
        }
    }
    // sort fields without an explicit order sort ascending
    if !plan.sort_fields.is_empty() && !plan.sorted {
        plan.sorted = true;
        plan.sort_order = SortOrder::Ascending;
    }

    if let Some(filter) = &spec.filter {
        plan.filter_list = parse_filter(filter)?;
    }
    Ok(plan)
}

fn parse_filter(filter: &Value) -> Result<Vec<Vec<FilterMatch>>, QueryError> {
    let Some(list) = filter.as_array() else {
        return Err(QueryError::Parse("filter is not an array".to_string()));
    };
    if list.is_empty() {
        return Ok(vec![]);
    }
    // legacy shape: a flat list of terms, all ANDed
    if !list[0].is_array() {
        return Ok(vec![parse_filter_conjunct(list)?]);
    }
    let mut out = Vec::with_capacity(list.len());
    for conjunct in list {
        let Some(terms) = conjunct.as_array() else {
            return Err(QueryError::Parse("filter conjunct is not an array".to_string()));
        };
        out.push(parse_filter_conjunct(terms)?);
    }
    Ok(out)
}

fn parse_filter_conjunct(terms: &[Value]) -> Result<Vec<FilterMatch>, QueryError> {
    let mut out = Vec::with_capacity(terms.len());
    for term in terms {
        let name = term
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Parse("filter term has no name".to_string()))?;
        let op_code = term
            .get("op")
            .and_then(Value::as_i64)
            .ok_or_else(|| QueryError::Parse("filter term has no op".to_string()))?;
        let op = MatchOp::try_from(op_code)
            .map_err(|err| QueryError::InvalidArg(err.to_string()))?;
        let value = term
            .get("value")
            .map(json_value_to_string)
            .ok_or_else(|| QueryError::Parse("filter term has no value".to_string()))?;
        let mut filter = FilterMatch::new(name, op, value)?;
        filter.value2 = term.get("value2").map(json_value_to_string);
        out.push(filter);
    }
    Ok(out)
}
