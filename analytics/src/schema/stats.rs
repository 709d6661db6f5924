//! Stat-table schemas.
//!
//! Stat tables are named `StatTable.<T>.<A>`; `(T, A)` becomes the row-key
//! suffix of every stat sub-query. A handful of stat streams have static
//! schemas registered here (notably the collector's own structured-syslog
//! stream); everything else is dynamic and described per query through the
//! `table_schema` member of the descriptor.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use analytics_api::SchemaColumn;
use thiserror::Error;

use super::{ColumnType, STAT_TABLE_PREFIX};

#[derive(Error, Debug, PartialEq)]
pub enum StatSchemaError {
    #[error("unknown column datatype: `{0}`")]
    UnknownDatatype(String),
    #[error("stat schema column `{0}` is incomplete")]
    IncompleteColumn(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatColumn {
    pub datatype: ColumnType,
    pub index: bool,
    pub suffixes: BTreeSet<String>,
}

/// Schema of one stat stream: attribute name to column description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatSchema {
    columns: HashMap<String, StatColumn>,
}

impl StatSchema {
    pub fn from_api(columns: &[SchemaColumn]) -> Result<Self, StatSchemaError> {
        let mut out = HashMap::new();
        for col in columns {
            if col.name.is_empty() {
                return Err(StatSchemaError::IncompleteColumn(col.name.clone()));
            }
            let datatype = ColumnType::parse(&col.datatype)
                .ok_or_else(|| StatSchemaError::UnknownDatatype(col.datatype.clone()))?;
            out.insert(
                col.name.clone(),
                StatColumn {
                    datatype,
                    index: col.index,
                    suffixes: col.suffixes.iter().cloned().collect(),
                },
            );
        }
        Ok(Self { columns: out })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column description for an attribute name. Map-typed attributes are
    /// declared as `a.b.*`, so `a.b.c` falls back to the map entry.
    pub fn column_desc(&self, name: &str) -> Option<&StatColumn> {
        if let Some(desc) = self.columns.get(name) {
            return Some(desc);
        }
        let pos = name.rfind('.')?;
        let map_name = format!("{}.*", &name[..pos]);
        self.columns.get(&map_name)
    }
}

/// Splits `StatTable.<T>.<A>` into `(T, A)`. `A` may itself contain dots.
pub fn parse_stat_table_name(table: &str) -> Option<(String, String)> {
    let rest = table.strip_prefix(STAT_TABLE_PREFIX)?;
    let (t, a) = rest.split_once('.')?;
    if t.is_empty() || a.is_empty() {
        return None;
    }
    Some((t.to_string(), a.to_string()))
}

/// The stat stream emitted by the structured-syslog collector.
pub const STRUCTURED_LOG_STAT_TABLE: &str = "StatTable.StructuredLog.data";

static STRUCTURED_LOG_SCHEMA: LazyLock<StatSchema> = LazyLock::new(|| {
    let mut columns = HashMap::new();
    let mut add = |name: &str, datatype: ColumnType, index: bool, suffixes: &[&str]| {
        columns.insert(
            name.to_string(),
            StatColumn {
                datatype,
                index,
                suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
            },
        );
    };
    add("Source", ColumnType::Str, true, &[]);
    add("data.hostname", ColumnType::Str, true, &["data.tag"]);
    add("data.tag", ColumnType::Str, true, &[]);
    add("data.tenant", ColumnType::Str, true, &[]);
    add("data.location", ColumnType::Str, true, &[]);
    add("data.source-address", ColumnType::Str, true, &[]);
    add("data.destination-address", ColumnType::Str, true, &[]);
    add("data.application", ColumnType::Str, true, &[]);
    add("data.source-port", ColumnType::U64, false, &[]);
    add("data.destination-port", ColumnType::U64, false, &[]);
    add("data.total-bytes", ColumnType::U64, false, &[]);
    StatSchema { columns }
});

/// Static schema for a stat table, when the platform ships one.
pub fn static_stat_schema(table: &str) -> Option<&'static StatSchema> {
    if table == STRUCTURED_LOG_STAT_TABLE {
        Some(&STRUCTURED_LOG_SCHEMA)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_table_names() {
        assert_eq!(
            parse_stat_table_name("StatTable.VRouter.stats"),
            Some(("VRouter".to_string(), "stats".to_string()))
        );
        // the attribute part keeps its dots
        assert_eq!(
            parse_stat_table_name("StatTable.Node.cpu.info"),
            Some(("Node".to_string(), "cpu.info".to_string()))
        );
        assert_eq!(parse_stat_table_name("MessageTable"), None);
        assert_eq!(parse_stat_table_name("StatTable.only"), None);
    }

    #[test]
    fn dynamic_schema_from_api() {
        let cols = vec![
            SchemaColumn {
                name: "vn".into(),
                datatype: "string".into(),
                index: true,
                suffixes: vec!["vm".into()],
            },
            SchemaColumn {
                name: "vm".into(),
                datatype: "string".into(),
                index: false,
                suffixes: vec![],
            },
            SchemaColumn {
                name: "cpu_info.*".into(),
                datatype: "map".into(),
                index: true,
                suffixes: vec![],
            },
        ];
        let schema = StatSchema::from_api(&cols).unwrap();
        let vn = schema.column_desc("vn").unwrap();
        assert!(vn.index);
        assert!(vn.suffixes.contains("vm"));
        // map fallback
        let entry = schema.column_desc("cpu_info.share").unwrap();
        assert_eq!(entry.datatype, ColumnType::MapElem);
        assert!(schema.column_desc("no_such").is_none());
    }

    #[test]
    fn bad_datatype_is_rejected() {
        let cols = vec![SchemaColumn {
            name: "x".into(),
            datatype: "tensor".into(),
            index: false,
            suffixes: vec![],
        }];
        assert_eq!(
            StatSchema::from_api(&cols),
            Err(StatSchemaError::UnknownDatatype("tensor".into()))
        );
    }

    #[test]
    fn structured_log_schema_is_registered() {
        let schema = static_stat_schema(STRUCTURED_LOG_STAT_TABLE).unwrap();
        let host = schema.column_desc("data.hostname").unwrap();
        assert!(host.index);
        assert!(host.suffixes.contains("data.tag"));
        assert!(static_stat_schema("StatTable.Nope.data").is_none());
    }
}
