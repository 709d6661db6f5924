//! Wire-level query API shared between the analytics engine and its clients.
//!
//! A query is a JSON document naming a logical table, a time window, a WHERE
//! clause (an OR-list of AND-lists of match terms), a SELECT list and the
//! post-processing directives (filter / sort / limit). Match operators travel
//! as integer codes; the enum here is the single definition used on both
//! sides of the wire.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ApiError {
    #[error("unknown match operator code: `{0}`")]
    UnknownMatchOp(i64),
    #[error("unknown sort order code: `{0}`")]
    UnknownSortOrder(i64),
}

/// Match operators, by wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum MatchOp {
    Equal = 1,
    NotEqual = 2,
    InRange = 3,
    NotInRange = 4,
    Leq = 5,
    Geq = 6,
    Prefix = 7,
    RegexMatch = 8,
    Contains = 9,
}

impl MatchOp {
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for MatchOp {
    type Error = ApiError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MatchOp::Equal),
            2 => Ok(MatchOp::NotEqual),
            3 => Ok(MatchOp::InRange),
            4 => Ok(MatchOp::NotInRange),
            5 => Ok(MatchOp::Leq),
            6 => Ok(MatchOp::Geq),
            7 => Ok(MatchOp::Prefix),
            8 => Ok(MatchOp::RegexMatch),
            9 => Ok(MatchOp::Contains),
            other => Err(ApiError::UnknownMatchOp(other)),
        }
    }
}

impl Serialize for MatchOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for MatchOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        MatchOp::try_from(code).map_err(de::Error::custom)
    }
}

/// Result ordering requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i64)]
pub enum SortOrder {
    #[default]
    Ascending = 1,
    Descending = 2,
}

impl TryFrom<i64> for SortOrder {
    type Error = ApiError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(SortOrder::Ascending),
            2 => Ok(SortOrder::Descending),
            other => Err(ApiError::UnknownSortOrder(other)),
        }
    }
}

impl Serialize for SortOrder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(*self as i64)
    }
}

impl<'de> Deserialize<'de> for SortOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        SortOrder::try_from(code).map_err(de::Error::custom)
    }
}

/// One term of a WHERE conjunction.
///
/// `value2` is only meaningful for range operators. Stat-table terms may
/// carry a `suffix` term addressing the secondary clustering column of the
/// two-tag index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchTerm {
    pub name: String,
    pub op: MatchOp,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<Box<MatchTerm>>,
}

/// Column description for dynamic stat-table schemas, sent by clients under
/// `table_schema` when querying a table the server has no static schema for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    pub datatype: String,
    pub index: bool,
    #[serde(default)]
    pub suffixes: Vec<String>,
}

/// Session endpoint role selector for session-table queries.
pub const SESSION_TYPE_CLIENT: &str = "client";
pub const SESSION_TYPE_SERVER: &str = "server";

/// The JSON query descriptor.
///
/// `start_time` / `end_time` accept either microsecond timestamps or
/// relative expressions such as `"now-1h"`; they are kept as raw JSON values
/// here and resolved by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    pub start_time: serde_json::Value,
    pub end_time: serde_json::Value,
    #[serde(default)]
    pub select_fields: Vec<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Vec<Vec<MatchTerm>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_dir: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_is_si: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_schema: Option<Vec<SchemaColumn>>,
}

impl QuerySpec {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
