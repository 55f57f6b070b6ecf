use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::backend::{BackendType, DialectVersion, QueryLanguage, QueryOperation};
use crate::object_path::{join, leaf_name};
use crate::query_engine::{
    bound_sql_read, finish_result, positional_row, rewrite_keywords, time_condition, EngineCore,
    EngineError, QueryDefaults, QueryEngine, QueryParams, QueryResult,
};
use crate::registry::BackendFeatures;
use crate::transport::{Transport, TransportResponse};

const ROOT: &str = "root";
const DEFAULT_DATA_TYPE: &str = "DOUBLE";

static SET_STORAGE_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bset\s+storage\s+group\s+to\b").expect("valid pattern"));
static DELETE_STORAGE_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bdelete\s+storage\s+group\b").expect("valid pattern"));
static SHOW_STORAGE_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshow\s+storage\s+group\b").expect("valid pattern"));
static COUNT_STORAGE_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcount\s+storage\s+group\b").expect("valid pattern"));
static CREATE_DATABASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcreate\s+database\b").expect("valid pattern"));
static DROP_DATABASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bdrop\s+database\b").expect("valid pattern"));
static SHOW_DATABASES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshow\s+databases\b").expect("valid pattern"));
static COUNT_DATABASES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcount\s+databases\b").expect("valid pattern"));

/// Engine for Apache IoTDB. 0.x releases speak of storage groups, 1.x and
/// later of databases.
#[derive(Debug)]
pub struct IoTDbEngine {
    core: EngineCore,
    legacy: bool,
}

impl IoTDbEngine {
    pub(crate) fn new(
        base: BackendFeatures,
        version: DialectVersion,
        defaults: QueryDefaults,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let legacy = is_legacy(&version);
        Self {
            core: EngineCore::new(base, version, defaults, transport),
            legacy,
        }
    }

    fn device_path(params: &QueryParams) -> Result<String, EngineError> {
        let device = params.table().ok_or_else(|| {
            EngineError::InvalidIntent("a device path is required".to_string())
        })?;
        Ok(match params.database() {
            Some(database) => join(&database_path(database), device),
            None => device.to_string(),
        })
    }

    fn build(&self, operation: QueryOperation, params: &QueryParams) -> Result<String, EngineError> {
        match operation {
            QueryOperation::Select => {
                let device = Self::device_path(params)?;
                let measurement = params.field().map_or("*", leaf_name);
                let condition = time_condition(Some(params), &self.core.defaults, |window| {
                    format!("time > now() - {window}")
                });
                Ok(format!(
                    "SELECT {measurement} FROM {device} WHERE {condition} LIMIT {}",
                    params.limit.unwrap_or(self.core.defaults.row_limit)
                ))
            }
            QueryOperation::Show => {
                if params.table().is_some() {
                    let device = Self::device_path(params)?;
                    return Ok(match params.field() {
                        Some(field) => format!("SHOW TIMESERIES {}", join(&device, field)),
                        None => format!("SHOW TIMESERIES {device}.*"),
                    });
                }
                Ok(match params.database() {
                    Some(database) => format!("SHOW DEVICES {}.**", database_path(database)),
                    None if self.legacy => "SHOW STORAGE GROUP".to_string(),
                    None => "SHOW DATABASES".to_string(),
                })
            }
            QueryOperation::Describe => {
                Ok(format!("SHOW TIMESERIES {}.**", Self::device_path(params)?))
            }
            QueryOperation::Create => match (params.table(), params.field()) {
                (Some(_), Some(field)) => {
                    let path = join(&Self::device_path(params)?, field);
                    let data_type = params
                        .data_type
                        .as_deref()
                        .map(str::trim)
                        .filter(|data_type| !data_type.is_empty())
                        .unwrap_or(DEFAULT_DATA_TYPE)
                        .to_ascii_uppercase();
                    let encoding = encoding_for(&data_type).ok_or_else(|| {
                        EngineError::InvalidIntent(format!("unsupported data type `{data_type}`"))
                    })?;
                    Ok(format!(
                        "CREATE TIMESERIES {path} WITH DATATYPE={data_type}, ENCODING={encoding}"
                    ))
                }
                (Some(_), None) => Err(EngineError::InvalidIntent(
                    "devices are created with their first timeseries; a field is required"
                        .to_string(),
                )),
                (None, _) => {
                    let database = database_path(params.database().ok_or_else(|| {
                        EngineError::InvalidIntent("a database is required".to_string())
                    })?);
                    Ok(if self.legacy {
                        format!("SET STORAGE GROUP TO {database}")
                    } else {
                        format!("CREATE DATABASE {database}")
                    })
                }
            },
            QueryOperation::Drop => {
                if params.table().is_some() {
                    let device = Self::device_path(params)?;
                    return Ok(match params.field() {
                        Some(field) => format!("DELETE TIMESERIES {}", join(&device, field)),
                        None => format!("DELETE TIMESERIES {device}.**"),
                    });
                }
                let database = database_path(params.database().ok_or_else(|| {
                    EngineError::InvalidIntent("drop needs a database or a device".to_string())
                })?);
                Ok(if self.legacy {
                    format!("DELETE STORAGE GROUP {database}")
                } else {
                    format!("DROP DATABASE {database}")
                })
            }
        }
    }
}

#[async_trait]
impl QueryEngine for IoTDbEngine {
    fn backend_type(&self) -> BackendType {
        BackendType::IoTDb
    }

    fn version(&self) -> &DialectVersion {
        &self.core.version
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::IotdbSql
    }

    fn transport(&self) -> &dyn Transport {
        self.core.transport.as_ref()
    }

    fn build_query(
        &self,
        operation: QueryOperation,
        params: &QueryParams,
    ) -> Result<String, EngineError> {
        self.core.ensure_supported(operation)?;
        self.build(operation, params)
    }

    fn adapt_query(&self, query: &str, target: &DialectVersion) -> String {
        match (self.legacy, is_legacy(target)) {
            (true, false) => rewrite_keywords(
                query,
                &[
                    (&*SET_STORAGE_GROUP, "CREATE DATABASE"),
                    (&*DELETE_STORAGE_GROUP, "DROP DATABASE"),
                    (&*SHOW_STORAGE_GROUP, "SHOW DATABASES"),
                    (&*COUNT_STORAGE_GROUP, "COUNT DATABASES"),
                ],
            ),
            (false, true) => rewrite_keywords(
                query,
                &[
                    (&*CREATE_DATABASE, "SET STORAGE GROUP TO"),
                    (&*DROP_DATABASE, "DELETE STORAGE GROUP"),
                    (&*SHOW_DATABASES, "SHOW STORAGE GROUP"),
                    (&*COUNT_DATABASES, "COUNT STORAGE GROUP"),
                ],
            ),
            _ => query.to_string(),
        }
    }

    fn optimize_query(&self, query: &str, params: Option<&QueryParams>) -> String {
        let limit = params
            .and_then(|params| params.limit)
            .unwrap_or(self.core.defaults.row_limit);
        let condition = time_condition(params, &self.core.defaults, |window| {
            format!("time > now() - {window}")
        });
        bound_sql_read(query, &condition, limit)
    }

    fn normalize_response(&self, response: TransportResponse) -> Result<QueryResult, EngineError> {
        let width = response.columns.len();
        let rows = response
            .rows
            .iter()
            .enumerate()
            .map(|(index, row)| match row {
                Value::Array(cells) => positional_row(&self.core, index, cells, width),
                _ => Err(self
                    .core
                    .unexpected(format!("row {index} is not a positional array"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        finish_result(
            &self.core,
            response.columns,
            rows,
            response.row_count,
            response.execution_time_ms,
        )
    }

    fn shutdown(&self) {
        tracing::debug!(version = %self.core.version, "iotdb engine shut down");
    }
}

/// Whether `version` predates the database vocabulary (0.x releases).
fn is_legacy(version: &DialectVersion) -> bool {
    version
        .as_str()
        .split('.')
        .next()
        .and_then(|major| major.trim_start_matches(['v', 'V']).parse::<u32>().ok())
        == Some(0)
}

fn database_path(database: &str) -> String {
    join(ROOT, database)
}

fn encoding_for(data_type: &str) -> Option<&'static str> {
    match data_type {
        "BOOLEAN" => Some("RLE"),
        "INT32" | "INT64" => Some("TS_2DIFF"),
        "FLOAT" | "DOUBLE" => Some("GORILLA"),
        "TEXT" => Some("PLAIN"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::IoTDbEngine;
    use crate::backend::{DialectVersion, QueryOperation};
    use crate::builtin_backends::iotdb_features;
    use crate::query_engine::{EngineError, QueryDefaults, QueryEngine, QueryParams};
    use crate::test_transport::{rows_response, ScriptedTransport};

    fn engine(version: &str) -> IoTDbEngine {
        IoTDbEngine::new(
            iotdb_features(),
            DialectVersion::new(version),
            QueryDefaults::default(),
            Arc::new(ScriptedTransport::new()),
        )
    }

    fn build(engine: &IoTDbEngine, operation: QueryOperation, params: &QueryParams) -> String {
        engine
            .build_query(operation, params)
            .expect("query should build")
    }

    #[test]
    fn select_joins_paths_without_duplication() {
        let engine = engine("1.x");
        let short = QueryParams::new()
            .with_database("sg1")
            .with_table("d1")
            .with_field("temperature");
        let qualified = QueryParams::new()
            .with_database("root.sg1")
            .with_table("root.sg1.d1")
            .with_field("temperature");

        let expected = "SELECT temperature FROM root.sg1.d1 WHERE time > now() - 1h LIMIT 1000";
        assert_eq!(build(&engine, QueryOperation::Select, &short), expected);
        assert_eq!(build(&engine, QueryOperation::Select, &qualified), expected);
    }

    #[test]
    fn show_uses_version_vocabulary() {
        assert_eq!(
            build(&engine("0.13.x"), QueryOperation::Show, &QueryParams::new()),
            "SHOW STORAGE GROUP"
        );
        assert_eq!(
            build(&engine("1.x"), QueryOperation::Show, &QueryParams::new()),
            "SHOW DATABASES"
        );
        assert_eq!(
            build(
                &engine("1.x"),
                QueryOperation::Show,
                &QueryParams::new().with_database("root.sg1")
            ),
            "SHOW DEVICES root.sg1.**"
        );
        assert_eq!(
            build(
                &engine("1.x"),
                QueryOperation::Describe,
                &QueryParams::new().with_database("root.sg1").with_table("d1")
            ),
            "SHOW TIMESERIES root.sg1.d1.**"
        );
    }

    #[test]
    fn create_picks_encoding_from_data_type() {
        let params = QueryParams::new()
            .with_database("root.sg1")
            .with_table("d1")
            .with_field("status")
            .with_data_type("boolean");
        assert_eq!(
            build(&engine("1.x"), QueryOperation::Create, &params),
            "CREATE TIMESERIES root.sg1.d1.status WITH DATATYPE=BOOLEAN, ENCODING=RLE"
        );

        let unknown = params.with_data_type("BLOB");
        assert!(matches!(
            engine("1.x").build_query(QueryOperation::Create, &unknown),
            Err(EngineError::InvalidIntent(_))
        ));
    }

    #[test]
    fn create_and_drop_database_per_generation() {
        let params = QueryParams::new().with_database("sg1");
        assert_eq!(
            build(&engine("0.13.x"), QueryOperation::Create, &params),
            "SET STORAGE GROUP TO root.sg1"
        );
        assert_eq!(
            build(&engine("1.2.0"), QueryOperation::Create, &params),
            "CREATE DATABASE root.sg1"
        );
        assert_eq!(
            build(&engine("0.13.x"), QueryOperation::Drop, &params),
            "DELETE STORAGE GROUP root.sg1"
        );
        assert_eq!(
            build(&engine("1.x"), QueryOperation::Drop, &params),
            "DROP DATABASE root.sg1"
        );
        assert_eq!(
            build(
                &engine("1.x"),
                QueryOperation::Drop,
                &params.clone().with_table("d1")
            ),
            "DELETE TIMESERIES root.sg1.d1.**"
        );
    }

    #[test]
    fn device_without_field_cannot_be_created() {
        let params = QueryParams::new().with_database("sg1").with_table("d1");
        assert!(matches!(
            engine("1.x").build_query(QueryOperation::Create, &params),
            Err(EngineError::InvalidIntent(_))
        ));
    }

    #[test]
    fn adapt_rewrites_between_generations() {
        let legacy = engine("0.13.x");
        assert_eq!(
            legacy.adapt_query(
                "SET STORAGE GROUP TO root.sg1; show storage group",
                &DialectVersion::new("1.x")
            ),
            "CREATE DATABASE root.sg1; SHOW DATABASES"
        );

        let modern = engine("1.x");
        assert_eq!(
            modern.adapt_query("DROP DATABASE root.sg1", &DialectVersion::new("0.13.x")),
            "DELETE STORAGE GROUP root.sg1"
        );
        assert_eq!(
            modern.adapt_query("SHOW DATABASES", &DialectVersion::new("1.x")),
            "SHOW DATABASES"
        );
    }

    #[test]
    fn optimize_places_limit_before_align_by() {
        assert_eq!(
            engine("1.x").optimize_query("SELECT s1 FROM root.sg1.d1 ALIGN BY DEVICE", None),
            "SELECT s1 FROM root.sg1.d1 WHERE time > now() - 1h LIMIT 1000 ALIGN BY DEVICE"
        );
    }

    #[test]
    fn normalize_requires_positional_rows() {
        let engine = engine("1.x");
        let result = engine
            .normalize_response(rows_response(
                &["Time", "root.sg1.d1.s1"],
                vec![json!([1_700_000_000_000_i64, 21.5]), json!([1_700_000_001_000_i64, null])],
            ))
            .expect("array rows should normalize");
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[1].values, vec!["1700000001000", "NULL"]);

        let keyed = engine.normalize_response(rows_response(&["Time"], vec![json!({"Time": 1})]));
        assert!(matches!(keyed, Err(EngineError::UnexpectedResponse { .. })));
    }

    #[test]
    fn reported_row_count_below_rows_is_rejected() {
        let mut response = rows_response(&["Time"], vec![json!([1]), json!([2])]);
        response.row_count = Some(1);
        assert!(matches!(
            engine("1.x").normalize_response(response),
            Err(EngineError::UnexpectedResponse { .. })
        ));
    }
}
