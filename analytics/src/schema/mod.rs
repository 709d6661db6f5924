//! Schema catalog for the analytic tables.
//!
//! The catalog is the data contract shared by the collector (which writes
//! stat streams) and the query engine (which compiles WHERE plans against
//! it). Message, session and stats catalogs are static; stat tables may in
//! addition carry a dynamic schema supplied per query (see [`stats`]).

pub mod stats;

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

// Logical table names of the query API.
pub const MESSAGE_TABLE: &str = "MessageTable";
pub const OBJECT_VALUE_TABLE: &str = "ObjectValueTable";
pub const FLOW_RECORD_TABLE: &str = "FlowRecordTable";
pub const FLOW_SERIES_TABLE: &str = "FlowSeriesTable";
pub const SESSION_RECORD_TABLE: &str = "SessionRecordTable";
pub const SESSION_SERIES_TABLE: &str = "SessionSeriesTable";
pub const STAT_TABLE_PREFIX: &str = "StatTable.";
pub const STAT_FIELDNAMES_PREFIX: &str = "StatTable.FieldNames";

// Physical column families.
pub const MESSAGE_TABLE_CF: &str = "MessageTablev2";
pub const SESSION_TABLE_CF: &str = "SessionTable";
pub const STATS_TABLE_CF: &str = "StatTablev4";
pub const SYSTEM_OBJECT_TABLE_CF: &str = "SystemObjectTable";

/// Row key of the system object holding analytics-wide settings (TTLs).
pub const SYSTEM_OBJECT_ANALYTICS_ROW: &str = "analytics";
pub const SYSTEM_OBJECT_GLOBAL_DATA_TTL: &str = "global_data_ttl";
pub const SYSTEM_OBJECT_FLOW_DATA_TTL: &str = "flow_data_ttl";
pub const SYSTEM_OBJECT_STATS_DATA_TTL: &str = "stats_data_ttl";
pub const SYSTEM_OBJECT_CONFIG_AUDIT_TTL: &str = "config_audit_ttl";

/// Legacy per-type stat tag index tables. Present only on clusters that
/// carry data written by earlier releases; bring-up probes for them.
pub const STATS_TABLE_BY_STR_TAG: &str = "StatTableByStrTag";
pub const STATS_TABLE_BY_U64_TAG: &str = "StatTableByU64Tag";
pub const STATS_TABLE_BY_DBL_TAG: &str = "StatTableByDblTag";
pub const STATS_TABLE_BY_STR_STR_TAG: &str = "StatTableByStrStrTag";
pub const STATS_TABLE_BY_STR_U64_TAG: &str = "StatTableByStrU64Tag";
pub const STATS_TABLE_BY_U64_STR_TAG: &str = "StatTableByU64StrTag";
pub const STATS_TABLE_BY_U64_U64_TAG: &str = "StatTableByU64U64Tag";

pub const LEGACY_STAT_TABLES: [&str; 7] = [
    STATS_TABLE_BY_STR_TAG,
    STATS_TABLE_BY_U64_TAG,
    STATS_TABLE_BY_DBL_TAG,
    STATS_TABLE_BY_STR_STR_TAG,
    STATS_TABLE_BY_STR_U64_TAG,
    STATS_TABLE_BY_U64_STR_TAG,
    STATS_TABLE_BY_U64_U64_TAG,
];

/// Row keys bucket timestamps by their top bits; the low `ROW_TIME_BITS`
/// bits of the microsecond timestamp live in the clustering key.
pub const ROW_TIME_BITS: u32 = 23;
/// Additional window bits for the stat fieldnames cache tables.
pub const CACHE_TIME_ADDITIONAL_BITS: u32 = 4;

/// Number of columns stat tag strings are hashed into.
pub const STAT_TAG_SHARDS: usize = 4;
/// Number of columns an object id may be indexed in.
pub const OBJECT_ID_COLUMNS: usize = 6;

// Well-known logical column names.
pub const COL_SOURCE: &str = "Source";
pub const COL_MODULE: &str = "ModuleId";
pub const COL_MESSAGE_TYPE: &str = "Messagetype";
pub const COL_OBJECT_ID: &str = "ObjectId";
pub const OBJECT_TYPE_NAME_PREFIX: &str = "ObjectTypeName";

// Session/flow logical column names.
pub const COL_PROTOCOL: &str = "protocol";
pub const COL_SPORT: &str = "sport";
pub const COL_DPORT: &str = "dport";
pub const COL_SOURCE_IP: &str = "sourceip";
pub const COL_DEST_IP: &str = "destip";
pub const COL_SOURCE_VN: &str = "sourcevn";
pub const COL_DEST_VN: &str = "destvn";
pub const COL_VROUTER: &str = "vrouter";
pub const COL_LABELS: &str = "labels";
pub const COL_REMOTE_LABELS: &str = "remote_labels";
pub const COL_CUSTOM_TAGS: &str = "custom_tags";
pub const COL_REMOTE_CUSTOM_TAGS: &str = "remote_custom_tags";

// Stat table well-known fields.
pub const STATS_NAME_FIELD: &str = "name";
pub const STATS_SOURCE_FIELD: &str = "Source";
pub const STATS_KEY_FIELD: &str = "key";
pub const STATS_PROXY_FIELD: &str = "proxy";
pub const STATS_TAGS_FIELD: &str = "tags";

/// Data type of a catalog column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Str,
    U64,
    Double,
    Uuid,
    MapElem,
    List,
}

impl ColumnType {
    pub fn parse(name: &str) -> Option<ColumnType> {
        match name {
            "string" => Some(ColumnType::Str),
            "int" => Some(ColumnType::U64),
            "double" => Some(ColumnType::Double),
            "uuid" => Some(ColumnType::Uuid),
            "map" => Some(ColumnType::MapElem),
            "set" | "list" => Some(ColumnType::List),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Str => "string",
            ColumnType::U64 => "int",
            ColumnType::Double => "double",
            ColumnType::Uuid => "uuid",
            ColumnType::MapElem => "map",
            ColumnType::List => "list",
        }
    }
}

/// Description of one logical column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDesc {
    pub datatype: ColumnType,
    pub index: bool,
    pub physical: &'static str,
    pub suffixes: BTreeSet<String>,
}

impl ColumnDesc {
    fn new(datatype: ColumnType, index: bool, physical: &'static str) -> Self {
        Self {
            datatype,
            index,
            physical,
            suffixes: BTreeSet::new(),
        }
    }
}

/// Catalog of one physical table: its columns and clustering key order.
#[derive(Debug)]
pub struct TableCatalog {
    pub physical: &'static str,
    columns: HashMap<&'static str, ColumnDesc>,
    pub clustering_keys: Vec<&'static str>,
}

impl TableCatalog {
    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnDesc)> {
        self.columns.iter().map(|(k, v)| (*k, v))
    }

    pub fn column(&self, logical: &str) -> Option<&ColumnDesc> {
        self.columns.get(logical)
    }

    pub fn column_datatype(&self, logical: &str) -> Option<ColumnType> {
        self.columns.get(logical).map(|c| c.datatype)
    }

    pub fn is_indexed(&self, logical: &str) -> bool {
        self.columns.get(logical).map(|c| c.index).unwrap_or(false)
    }

    /// Physical column backing a logical query column; `None` means the
    /// column is unknown and the caller must reject the query.
    pub fn physical_name(&self, logical: &str) -> Option<&'static str> {
        self.columns.get(logical).map(|c| c.physical)
    }

    pub fn is_clustering_key(&self, logical: &str) -> bool {
        self.clustering_keys.contains(&logical)
    }
}

static MESSAGE_CATALOG: LazyLock<TableCatalog> = LazyLock::new(|| {
    let mut columns = HashMap::new();
    columns.insert(COL_SOURCE, ColumnDesc::new(ColumnType::Str, true, "source"));
    columns.insert(COL_MODULE, ColumnDesc::new(ColumnType::Str, true, "module"));
    columns.insert(
        COL_MESSAGE_TYPE,
        ColumnDesc::new(ColumnType::Str, true, "message_type"),
    );
    columns.insert(
        "Category",
        ColumnDesc::new(ColumnType::Str, false, "category"),
    );
    columns.insert("Level", ColumnDesc::new(ColumnType::U64, false, "level"));
    columns.insert(
        "ObjectTypeName1",
        ColumnDesc::new(ColumnType::Str, true, "object_value_1"),
    );
    columns.insert(
        "ObjectTypeName2",
        ColumnDesc::new(ColumnType::Str, true, "object_value_2"),
    );
    columns.insert(
        "ObjectTypeName3",
        ColumnDesc::new(ColumnType::Str, true, "object_value_3"),
    );
    columns.insert(
        "ObjectTypeName4",
        ColumnDesc::new(ColumnType::Str, true, "object_value_4"),
    );
    columns.insert(
        "ObjectTypeName5",
        ColumnDesc::new(ColumnType::Str, true, "object_value_5"),
    );
    columns.insert(
        "ObjectTypeName6",
        ColumnDesc::new(ColumnType::Str, true, "object_value_6"),
    );
    TableCatalog {
        physical: MESSAGE_TABLE_CF,
        columns,
        clustering_keys: vec![],
    }
});

static SESSION_CATALOG: LazyLock<TableCatalog> = LazyLock::new(|| {
    let mut columns = HashMap::new();
    columns.insert(
        COL_PROTOCOL,
        ColumnDesc::new(ColumnType::U64, false, "protocol"),
    );
    columns.insert(COL_SPORT, ColumnDesc::new(ColumnType::U64, false, "sport"));
    columns.insert(
        "local_ip",
        ColumnDesc::new(ColumnType::Str, true, "local_ip"),
    );
    columns.insert("vn", ColumnDesc::new(ColumnType::Str, true, "vn"));
    columns.insert(
        "remote_vn",
        ColumnDesc::new(ColumnType::Str, true, "remote_vn"),
    );
    columns.insert(
        COL_LABELS,
        ColumnDesc::new(ColumnType::List, true, "labels"),
    );
    columns.insert(
        COL_REMOTE_LABELS,
        ColumnDesc::new(ColumnType::List, true, "remote_labels"),
    );
    columns.insert(
        COL_CUSTOM_TAGS,
        ColumnDesc::new(ColumnType::List, true, "custom_tags"),
    );
    columns.insert(
        COL_REMOTE_CUSTOM_TAGS,
        ColumnDesc::new(ColumnType::List, true, "remote_custom_tags"),
    );
    TableCatalog {
        physical: SESSION_TABLE_CF,
        columns,
        clustering_keys: vec![COL_PROTOCOL, COL_SPORT],
    }
});

static STATS_CATALOG: LazyLock<TableCatalog> = LazyLock::new(|| {
    let mut columns = HashMap::new();
    columns.insert(
        STATS_NAME_FIELD,
        ColumnDesc::new(ColumnType::Str, true, "name"),
    );
    columns.insert(
        STATS_SOURCE_FIELD,
        ColumnDesc::new(ColumnType::Str, true, "source"),
    );
    columns.insert(STATS_KEY_FIELD, ColumnDesc::new(ColumnType::Str, true, "key"));
    columns.insert(
        STATS_PROXY_FIELD,
        ColumnDesc::new(ColumnType::Str, true, "proxy"),
    );
    columns.insert("tags0", ColumnDesc::new(ColumnType::Str, true, "tags0"));
    columns.insert("tags1", ColumnDesc::new(ColumnType::Str, true, "tags1"));
    columns.insert("tags2", ColumnDesc::new(ColumnType::Str, true, "tags2"));
    columns.insert("tags3", ColumnDesc::new(ColumnType::Str, true, "tags3"));
    TableCatalog {
        physical: STATS_TABLE_CF,
        columns,
        clustering_keys: vec![STATS_NAME_FIELD],
    }
});

/// Classification of a logical table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Message,
    Object,
    ObjectValue,
    Flow,
    Session,
    Stat,
}

pub fn classify(table: &str) -> TableKind {
    if table == MESSAGE_TABLE {
        TableKind::Message
    } else if table == OBJECT_VALUE_TABLE {
        TableKind::ObjectValue
    } else if table == FLOW_RECORD_TABLE || table == FLOW_SERIES_TABLE {
        TableKind::Flow
    } else if table == SESSION_RECORD_TABLE || table == SESSION_SERIES_TABLE {
        TableKind::Session
    } else if is_stat_table(table) {
        TableKind::Stat
    } else {
        TableKind::Object
    }
}

pub fn is_stat_table(table: &str) -> bool {
    table.starts_with(STAT_TABLE_PREFIX)
}

pub fn is_stat_fieldnames_table(table: &str) -> bool {
    table.starts_with(STAT_FIELDNAMES_PREFIX)
}

/// The static catalog backing a logical table, if its kind has one.
pub fn catalog_for(kind: TableKind) -> Option<&'static TableCatalog> {
    match kind {
        TableKind::Message | TableKind::Object => Some(&MESSAGE_CATALOG),
        TableKind::Flow | TableKind::Session => Some(&SESSION_CATALOG),
        TableKind::Stat => Some(&STATS_CATALOG),
        TableKind::ObjectValue => None,
    }
}

/// Physical column for the Nth object-id slot (1-based).
pub fn object_id_column(slot: usize) -> String {
    format!("{OBJECT_TYPE_NAME_PREFIX}{slot}")
}

/// The shard the given stat tag name indexes into.
pub fn stat_tag_shard(tag_name: &str) -> usize {
    (djb_hash(tag_name) as usize) % STAT_TAG_SHARDS
}

/// Physical column name of a stat tag shard.
pub fn stat_tag_shard_column(shard: usize) -> String {
    format!("{STATS_TAGS_FIELD}{shard}")
}

pub(crate) fn djb_hash(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(b as u32);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_tables() {
        assert_eq!(classify(MESSAGE_TABLE), TableKind::Message);
        assert_eq!(classify(FLOW_SERIES_TABLE), TableKind::Flow);
        assert_eq!(classify(SESSION_RECORD_TABLE), TableKind::Session);
        assert_eq!(classify("StatTable.VRouter.stats"), TableKind::Stat);
        assert_eq!(classify(OBJECT_VALUE_TABLE), TableKind::ObjectValue);
        // anything else is an object log table
        assert_eq!(classify("ObjectVNTable"), TableKind::Object);
    }

    #[test]
    fn fieldnames_tables_are_stat_tables() {
        assert!(is_stat_table("StatTable.FieldNames.fields"));
        assert!(is_stat_fieldnames_table("StatTable.FieldNames.fields"));
        assert!(!is_stat_fieldnames_table("StatTable.VRouter.stats"));
    }

    #[test]
    fn physical_name_lookup() {
        let cat = catalog_for(TableKind::Message).unwrap();
        assert_eq!(cat.physical_name(COL_SOURCE), Some("source"));
        assert_eq!(cat.physical_name("NoSuchColumn"), None);
        assert!(cat.is_indexed("ObjectTypeName3"));
        assert!(!cat.is_indexed("Category"));
    }

    #[test]
    fn session_clustering_keys_are_ordered() {
        let cat = catalog_for(TableKind::Session).unwrap();
        assert_eq!(cat.clustering_keys, vec![COL_PROTOCOL, COL_SPORT]);
        assert!(cat.is_clustering_key(COL_SPORT));
        assert!(!cat.is_clustering_key("local_ip"));
    }

    #[test]
    fn djb_hash_matches_reference_values() {
        // djb2: hash(c) = hash * 33 + c, seeded with 5381
        let mut expected: u32 = 5381;
        for b in "vn".bytes() {
            expected = expected.wrapping_mul(33).wrapping_add(b as u32);
        }
        assert_eq!(djb_hash("vn"), expected);
        assert!(stat_tag_shard("vn") < STAT_TAG_SHARDS);
    }
}
