use std::collections::BTreeMap;
use std::time::Duration;

use crate::backend::{BackendType, DialectVersion, QueryLanguage, QueryOperation};
use crate::registry::{
    BackendFeatures, ChildMethod, DialectVocabulary, Hierarchy, Level, NodeTypeInfo,
    QueryCapabilities, VersionFeatures,
};

const ALL_OPERATIONS: [QueryOperation; 5] = QueryOperation::ALL;
const READ_OPERATIONS: [QueryOperation; 3] = [
    QueryOperation::Select,
    QueryOperation::Show,
    QueryOperation::Describe,
];

const INFLUXQL_KEYWORDS: [&str; 40] = [
    "SELECT",
    "FROM",
    "WHERE",
    "GROUP BY",
    "ORDER BY",
    "LIMIT",
    "OFFSET",
    "SLIMIT",
    "SOFFSET",
    "FILL",
    "INTO",
    "AND",
    "OR",
    "AS",
    "ASC",
    "DESC",
    "TZ",
    "SHOW",
    "DATABASES",
    "MEASUREMENTS",
    "FIELD KEYS",
    "TAG KEYS",
    "TAG VALUES",
    "SERIES",
    "RETENTION POLICIES",
    "CONTINUOUS QUERIES",
    "CREATE",
    "DROP",
    "DELETE",
    "DATABASE",
    "MEASUREMENT",
    "RETENTION POLICY",
    "EXPLAIN",
    "ANALYZE",
    "WITH KEY",
    "ON",
    "INSERT",
    "time",
    "DURATION",
    "SHARD DURATION",
];

const INFLUXQL_FUNCTIONS: [&str; 20] = [
    "COUNT",
    "DISTINCT",
    "INTEGRAL",
    "MEAN",
    "MEDIAN",
    "MODE",
    "SPREAD",
    "STDDEV",
    "SUM",
    "BOTTOM",
    "FIRST",
    "LAST",
    "MAX",
    "MIN",
    "PERCENTILE",
    "SAMPLE",
    "TOP",
    "DERIVATIVE",
    "DIFFERENCE",
    "MOVING_AVERAGE",
];

const INFLUXQL_OPERATORS: [&str; 8] = ["=", "!=", "<>", "<", "<=", ">", ">=", "=~"];

const FLUX_KEYWORDS: [&str; 8] = [
    "import", "from", "and", "or", "not", "return", "exists", "if",
];

const FLUX_FUNCTIONS: [&str; 18] = [
    "range",
    "filter",
    "map",
    "aggregateWindow",
    "mean",
    "sum",
    "count",
    "max",
    "min",
    "last",
    "first",
    "group",
    "pivot",
    "sort",
    "limit",
    "yield",
    "keep",
    "drop",
];

const FLUX_OPERATORS: [&str; 8] = ["==", "!=", "<", "<=", ">", ">=", "=~", "!~"];

const INFLUX_SQL_KEYWORDS: [&str; 22] = [
    "SELECT",
    "FROM",
    "WHERE",
    "GROUP BY",
    "ORDER BY",
    "LIMIT",
    "OFFSET",
    "HAVING",
    "AND",
    "OR",
    "NOT",
    "AS",
    "ASC",
    "DESC",
    "IN",
    "BETWEEN",
    "LIKE",
    "SHOW",
    "TABLES",
    "COLUMNS",
    "EXPLAIN",
    "time",
];

const INFLUX_SQL_FUNCTIONS: [&str; 10] = [
    "COUNT",
    "AVG",
    "SUM",
    "MIN",
    "MAX",
    "DATE_BIN",
    "DATE_BIN_GAPFILL",
    "NOW",
    "SELECTOR_FIRST",
    "SELECTOR_LAST",
];

const SQL_OPERATORS: [&str; 8] = ["=", "!=", "<>", "<", "<=", ">", ">=", "LIKE"];

const IOTDB_KEYWORDS: [&str; 28] = [
    "SELECT",
    "FROM",
    "WHERE",
    "GROUP BY",
    "ORDER BY",
    "LIMIT",
    "OFFSET",
    "SLIMIT",
    "SOFFSET",
    "FILL",
    "ALIGN BY DEVICE",
    "AND",
    "OR",
    "NOT",
    "AS",
    "ASC",
    "DESC",
    "SHOW",
    "TIMESERIES",
    "DEVICES",
    "CHILD PATHS",
    "CREATE",
    "DELETE",
    "DROP",
    "INSERT INTO",
    "VALUES",
    "COUNT",
    "time",
];

const IOTDB_FUNCTIONS: [&str; 12] = [
    "COUNT",
    "AVG",
    "SUM",
    "MAX_VALUE",
    "MIN_VALUE",
    "MAX_TIME",
    "MIN_TIME",
    "FIRST_VALUE",
    "LAST_VALUE",
    "EXTREME",
    "DIFF",
    "TOP_K",
];

const IOTDB_OPERATORS: [&str; 9] = ["=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "REGEXP"];

const IOTDB_LEGACY_KEYWORDS: [&str; 3] = ["STORAGE GROUP", "SET STORAGE GROUP TO", "TTL"];
const IOTDB_MODERN_KEYWORDS: [&str; 3] = ["DATABASE", "DATABASES", "TTL"];

fn vocabulary_with(
    base: &[&str],
    extra: &[&str],
    functions: &[&str],
    operators: &[&str],
) -> DialectVocabulary {
    let keywords = base.iter().chain(extra).copied().collect::<Vec<_>>();
    DialectVocabulary::from_static(&keywords, functions, operators)
}

fn node(label: &str, icon: &str, actions: &[&str]) -> NodeTypeInfo {
    NodeTypeInfo {
        label: label.to_string(),
        icon: icon.to_string(),
        actions: actions.iter().map(|action| (*action).to_string()).collect(),
    }
}

fn endpoints(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, path)| ((*name).to_string(), (*path).to_string()))
        .collect()
}

#[must_use]
pub fn influxdb_features() -> BackendFeatures {
    let influxql = DialectVocabulary::from_static(
        &INFLUXQL_KEYWORDS,
        &INFLUXQL_FUNCTIONS,
        &INFLUXQL_OPERATORS,
    );

    let mut version_features = BTreeMap::new();
    version_features.insert(
        DialectVersion::new("1.x"),
        VersionFeatures {
            languages: vec![QueryLanguage::InfluxQl],
            supported_operations: None,
            vocabulary: influxql.clone(),
            endpoints: endpoints(&[("query", "/query"), ("write", "/write"), ("ping", "/ping")]),
            limitations: Vec::new(),
        },
    );
    version_features.insert(
        DialectVersion::new("2.x"),
        VersionFeatures {
            languages: vec![QueryLanguage::Flux, QueryLanguage::InfluxQl],
            supported_operations: Some(READ_OPERATIONS.to_vec()),
            vocabulary: DialectVocabulary::from_static(
                &FLUX_KEYWORDS,
                &FLUX_FUNCTIONS,
                &FLUX_OPERATORS,
            ),
            endpoints: endpoints(&[
                ("query", "/api/v2/query"),
                ("write", "/api/v2/write"),
                ("buckets", "/api/v2/buckets"),
                ("health", "/health"),
            ]),
            limitations: vec![
                "databases are buckets managed through the HTTP API".to_string(),
                "InfluxQL is only available through the v1 compatibility endpoint".to_string(),
            ],
        },
    );
    version_features.insert(
        DialectVersion::new("3.x"),
        VersionFeatures {
            languages: vec![QueryLanguage::Sql, QueryLanguage::InfluxQl],
            supported_operations: Some(READ_OPERATIONS.to_vec()),
            vocabulary: DialectVocabulary::from_static(
                &INFLUX_SQL_KEYWORDS,
                &INFLUX_SQL_FUNCTIONS,
                &SQL_OPERATORS,
            ),
            endpoints: endpoints(&[
                ("query", "/api/v3/query_sql"),
                ("influxql", "/api/v3/query_influxql"),
                ("write", "/api/v3/write_lp"),
            ]),
            limitations: vec!["schema changes are implicit on write".to_string()],
        },
    );

    BackendFeatures {
        backend: BackendType::InfluxDb,
        display_name: "InfluxDB".to_string(),
        default_port: BackendType::InfluxDb.default_port(),
        hierarchy: Hierarchy::new(vec![
            Level::branch("database", ChildMethod::ListChildren),
            Level::branch("measurement", ChildMethod::ListFields),
            Level::leaf("field"),
        ]),
        query_capabilities: QueryCapabilities {
            languages: vec![QueryLanguage::InfluxQl],
            supported_operations: ALL_OPERATIONS.to_vec(),
            max_query_size: 1024 * 1024,
            timeout: Duration::from_secs(30),
            supports_batch: true,
            supports_async: false,
            vocabulary: influxql,
        },
        version_features,
        node_type_mapping: BTreeMap::from([
            (
                "database".to_string(),
                node("Database", "database", &["refresh", "new_query", "drop"]),
            ),
            (
                "measurement".to_string(),
                node("Measurement", "table", &["preview", "describe", "drop"]),
            ),
            ("field".to_string(), node("Field", "column", &["select"])),
        ]),
    }
}

#[must_use]
pub fn iotdb_features() -> BackendFeatures {
    let legacy = vocabulary_with(
        &IOTDB_KEYWORDS,
        &IOTDB_LEGACY_KEYWORDS,
        &IOTDB_FUNCTIONS,
        &IOTDB_OPERATORS,
    );
    let modern = vocabulary_with(
        &IOTDB_KEYWORDS,
        &IOTDB_MODERN_KEYWORDS,
        &IOTDB_FUNCTIONS,
        &IOTDB_OPERATORS,
    );

    let mut version_features = BTreeMap::new();
    version_features.insert(
        DialectVersion::new("0.13.x"),
        VersionFeatures {
            languages: vec![QueryLanguage::IotdbSql],
            supported_operations: None,
            vocabulary: legacy,
            endpoints: endpoints(&[("rest_query", "/rest/v1/query")]),
            limitations: vec!["schema containers are called storage groups".to_string()],
        },
    );
    version_features.insert(
        DialectVersion::new("1.x"),
        VersionFeatures {
            languages: vec![QueryLanguage::IotdbSql],
            supported_operations: None,
            vocabulary: modern.clone(),
            endpoints: endpoints(&[
                ("rest_query", "/rest/v2/query"),
                ("rest_nonquery", "/rest/v2/nonQuery"),
            ]),
            limitations: Vec::new(),
        },
    );

    BackendFeatures {
        backend: BackendType::IoTDb,
        display_name: "Apache IoTDB".to_string(),
        default_port: BackendType::IoTDb.default_port(),
        hierarchy: Hierarchy::new(vec![
            Level::branch("storage_group", ChildMethod::ListChildren),
            Level::branch("device", ChildMethod::ListFields),
            Level::leaf("timeseries"),
        ]),
        query_capabilities: QueryCapabilities {
            languages: vec![QueryLanguage::IotdbSql],
            supported_operations: ALL_OPERATIONS.to_vec(),
            max_query_size: 512 * 1024,
            timeout: Duration::from_secs(60),
            supports_batch: true,
            supports_async: true,
            vocabulary: modern,
        },
        version_features,
        node_type_mapping: BTreeMap::from([
            (
                "storage_group".to_string(),
                node("Database", "database", &["refresh", "new_query", "drop"]),
            ),
            (
                "device".to_string(),
                node("Device", "device", &["preview", "describe", "drop"]),
            ),
            (
                "timeseries".to_string(),
                node("Timeseries", "column", &["select", "drop"]),
            ),
        ]),
    }
}
