use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::backend::{BackendType, DialectVersion, QueryLanguage, QueryOperation};
use crate::query_engine::{
    bound_sql_read, finish_result, keyed_row, parse_window, positional_row, rewrite_keywords,
    time_condition, EngineCore, EngineError, QueryDefaults, QueryEngine, QueryParams, QueryResult,
};
use crate::registry::BackendFeatures;
use crate::statement_splitter::mask_literals;
use crate::transport::{Transport, TransportResponse};

const FLUX_SCHEMA_IMPORT: &str = "import \"influxdata/influxdb/schema\"";

static SHOW_MEASUREMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshow\s+measurements\b").expect("valid pattern"));
static SHOW_FIELD_KEYS_FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshow\s+field\s+keys\s+from\b").expect("valid pattern"));
static SHOW_TABLES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshow\s+tables\b").expect("valid pattern"));
static SHOW_COLUMNS_FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshow\s+columns\s+from\b").expect("valid pattern"));

static FLUX_FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bfrom\s*\(").expect("valid pattern"));
static FLUX_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|>\s*range\s*\(").expect("valid pattern"));
static FLUX_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|>\s*(limit|tail)\s*\(").expect("valid pattern"));
static FLUX_YIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|>\s*yield\s*\(").expect("valid pattern"));

/// Engine for InfluxDB: InfluxQL on 1.x, Flux on 2.x and SQL on 3.x.
#[derive(Debug)]
pub struct InfluxDbEngine {
    core: EngineCore,
    language: QueryLanguage,
}

impl InfluxDbEngine {
    pub(crate) fn new(
        base: BackendFeatures,
        version: DialectVersion,
        defaults: QueryDefaults,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let core = EngineCore::new(base, version, defaults, transport);
        let language = core
            .features
            .query_capabilities
            .primary_language()
            .unwrap_or(QueryLanguage::InfluxQl);
        Self { core, language }
    }

    fn limit(&self, params: &QueryParams) -> usize {
        params.limit.unwrap_or(self.core.defaults.row_limit)
    }

    fn build_influxql(
        &self,
        operation: QueryOperation,
        params: &QueryParams,
    ) -> Result<String, EngineError> {
        let on_database = params
            .database()
            .map(|database| format!(" ON {}", quote_ident(database)))
            .unwrap_or_default();

        match operation {
            QueryOperation::Select => {
                let measurement = require_table(params)?;
                let source = match params.database() {
                    Some(database) => {
                        format!("{}..{}", quote_ident(database), quote_ident(measurement))
                    }
                    None => quote_ident(measurement),
                };
                let condition = time_condition(Some(params), &self.core.defaults, |window| {
                    format!("time > now() - {window}")
                });
                Ok(format!(
                    "SELECT {} FROM {source} WHERE {condition} LIMIT {}",
                    select_list(params),
                    self.limit(params)
                ))
            }
            QueryOperation::Show => Ok(match (params.table(), params.field()) {
                (Some(measurement), Some(field)) => format!(
                    "SHOW TAG VALUES{on_database} FROM {} WITH KEY = {}",
                    quote_ident(measurement),
                    quote_ident(field)
                ),
                (Some(measurement), None) => {
                    format!("SHOW FIELD KEYS{on_database} FROM {}", quote_ident(measurement))
                }
                (None, _) if params.database().is_some() => {
                    format!("SHOW MEASUREMENTS{on_database}")
                }
                (None, _) => "SHOW DATABASES".to_string(),
            }),
            QueryOperation::Describe => {
                let measurement = quote_ident(require_table(params)?);
                Ok(format!(
                    "SHOW FIELD KEYS{on_database} FROM {measurement}; \
                     SHOW TAG KEYS{on_database} FROM {measurement}"
                ))
            }
            QueryOperation::Create => {
                if params.table().is_some() {
                    return Err(EngineError::InvalidIntent(
                        "measurements are created implicitly on write".to_string(),
                    ));
                }
                let database = require_database(params)?;
                Ok(format!("CREATE DATABASE {}", quote_ident(database)))
            }
            QueryOperation::Drop => match (params.table(), params.database()) {
                (Some(measurement), _) => Ok(format!("DROP MEASUREMENT {}", quote_ident(measurement))),
                (None, Some(database)) => Ok(format!("DROP DATABASE {}", quote_ident(database))),
                (None, None) => Err(EngineError::InvalidIntent(
                    "drop needs a database or a measurement".to_string(),
                )),
            },
        }
    }

    fn build_flux(
        &self,
        operation: QueryOperation,
        params: &QueryParams,
    ) -> Result<String, EngineError> {
        match operation {
            QueryOperation::Select => {
                let bucket = require_database(params)?;
                let measurement = require_table(params)?;
                let mut pipeline = vec![
                    format!("from(bucket: {})", flux_string(bucket)),
                    flux_range(params, &self.core.defaults),
                    format!(
                        "|> filter(fn: (r) => r._measurement == {})",
                        flux_string(measurement)
                    ),
                ];
                if let Some(field) = params.field() {
                    pipeline.push(format!(
                        "|> filter(fn: (r) => r._field == {})",
                        flux_string(field)
                    ));
                }
                pipeline.push(format!("|> limit(n: {})", self.limit(params)));
                Ok(pipeline.join("\n  "))
            }
            QueryOperation::Show => Ok(match (params.database(), params.table()) {
                (None, _) => "buckets()".to_string(),
                (Some(bucket), None) => format!(
                    "{FLUX_SCHEMA_IMPORT}\n\nschema.measurements(bucket: {})",
                    flux_string(bucket)
                ),
                (Some(bucket), Some(measurement)) => format!(
                    "{FLUX_SCHEMA_IMPORT}\n\nschema.measurementFieldKeys(bucket: {}, measurement: {})",
                    flux_string(bucket),
                    flux_string(measurement)
                ),
            }),
            QueryOperation::Describe => {
                let bucket = require_database(params)?;
                let measurement = require_table(params)?;
                Ok(format!(
                    "{FLUX_SCHEMA_IMPORT}\n\nschema.measurementTagKeys(bucket: {}, measurement: {})",
                    flux_string(bucket),
                    flux_string(measurement)
                ))
            }
            QueryOperation::Create | QueryOperation::Drop => Err(self.unsupported(operation)),
        }
    }

    fn build_sql(
        &self,
        operation: QueryOperation,
        params: &QueryParams,
    ) -> Result<String, EngineError> {
        match operation {
            QueryOperation::Select => {
                let table = require_table(params)?;
                let condition = time_condition(Some(params), &self.core.defaults, sql_interval);
                Ok(format!(
                    "SELECT {} FROM {} WHERE {condition} LIMIT {}",
                    select_list(params),
                    quote_ident(table),
                    self.limit(params)
                ))
            }
            QueryOperation::Show => Ok(match params.table() {
                Some(table) => format!("SHOW COLUMNS FROM {}", quote_ident(table)),
                None => "SHOW TABLES".to_string(),
            }),
            QueryOperation::Describe => Ok(format!(
                "SHOW COLUMNS FROM {}",
                quote_ident(require_table(params)?)
            )),
            QueryOperation::Create | QueryOperation::Drop => Err(self.unsupported(operation)),
        }
    }

    fn unsupported(&self, operation: QueryOperation) -> EngineError {
        EngineError::UnsupportedOperation {
            backend: BackendType::InfluxDb,
            version: self.core.version.clone(),
            operation,
        }
    }

    fn bound_flux(&self, query: &str, params: Option<&QueryParams>) -> String {
        let mut bounded = query.trim_end().to_string();
        let masked = mask_literals(&bounded);
        let Some(from) = FLUX_FROM.find(&masked) else {
            return query.to_string();
        };

        if !FLUX_RANGE.is_match(&masked) {
            let Some(close) = matching_paren(&masked, from.end() - 1) else {
                return query.to_string();
            };
            let range = params.map_or_else(
                || flux_range(&QueryParams::default(), &self.core.defaults),
                |params| flux_range(params, &self.core.defaults),
            );
            bounded.insert_str(close + 1, &format!("\n  {range}"));
        }

        let masked = mask_literals(&bounded);
        if !FLUX_LIMIT.is_match(&masked) {
            let limit = params
                .and_then(|params| params.limit)
                .unwrap_or(self.core.defaults.row_limit);
            match FLUX_YIELD.find(&masked) {
                Some(found) => {
                    bounded.insert_str(found.start(), &format!("|> limit(n: {limit})\n  "));
                }
                None => bounded.push_str(&format!("\n  |> limit(n: {limit})")),
            }
        }
        bounded
    }

    fn normalize(&self, response: TransportResponse) -> Result<QueryResult, EngineError> {
        let TransportResponse {
            mut columns,
            rows,
            row_count,
            execution_time_ms,
        } = response;

        if columns.is_empty() {
            if let Some(Value::Object(first)) = rows.first() {
                columns = first.keys().cloned().collect();
            }
        }

        let rows = rows
            .iter()
            .enumerate()
            .map(|(index, row)| match row {
                Value::Array(cells) => positional_row(&self.core, index, cells, columns.len()),
                Value::Object(record) => keyed_row(&self.core, index, record, &columns),
                _ => Err(self
                    .core
                    .unexpected(format!("row {index} is neither an array nor an object"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        finish_result(&self.core, columns, rows, row_count, execution_time_ms)
    }
}

#[async_trait]
impl QueryEngine for InfluxDbEngine {
    fn backend_type(&self) -> BackendType {
        BackendType::InfluxDb
    }

    fn version(&self) -> &DialectVersion {
        &self.core.version
    }

    fn language(&self) -> QueryLanguage {
        self.language
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
        match self.language {
            QueryLanguage::Flux => self.build_flux(operation, params),
            QueryLanguage::Sql => self.build_sql(operation, params),
            QueryLanguage::InfluxQl | QueryLanguage::IotdbSql => {
                self.build_influxql(operation, params)
            }
        }
    }

    fn adapt_query(&self, query: &str, target: &DialectVersion) -> String {
        let Some(target_language) = self.core.language_of(target) else {
            return query.to_string();
        };
        match (self.language, target_language) {
            (from, to) if from == to => query.to_string(),
            (QueryLanguage::InfluxQl, QueryLanguage::Sql) => rewrite_keywords(
                query,
                &[
                    (&*SHOW_MEASUREMENTS, "SHOW TABLES"),
                    (&*SHOW_FIELD_KEYS_FROM, "SHOW COLUMNS FROM"),
                ],
            ),
            (QueryLanguage::Sql, QueryLanguage::InfluxQl) => rewrite_keywords(
                query,
                &[
                    (&*SHOW_TABLES, "SHOW MEASUREMENTS"),
                    (&*SHOW_COLUMNS_FROM, "SHOW FIELD KEYS FROM"),
                ],
            ),
            (from, to) => {
                tracing::debug!(
                    ?from,
                    ?to,
                    target = %target,
                    "no rewrite between query languages, returning query unchanged"
                );
                query.to_string()
            }
        }
    }

    fn optimize_query(&self, query: &str, params: Option<&QueryParams>) -> String {
        let limit = params
            .and_then(|params| params.limit)
            .unwrap_or(self.core.defaults.row_limit);
        match self.language {
            QueryLanguage::Flux => self.bound_flux(query, params),
            QueryLanguage::Sql => bound_sql_read(
                query,
                &time_condition(params, &self.core.defaults, sql_interval),
                limit,
            ),
            QueryLanguage::InfluxQl | QueryLanguage::IotdbSql => bound_sql_read(
                query,
                &time_condition(params, &self.core.defaults, |window| {
                    format!("time > now() - {window}")
                }),
                limit,
            ),
        }
    }

    fn normalize_response(&self, response: TransportResponse) -> Result<QueryResult, EngineError> {
        self.normalize(response)
    }

    fn shutdown(&self) {
        tracing::debug!(version = %self.core.version, "influxdb engine shut down");
    }
}

fn require_table(params: &QueryParams) -> Result<&str, EngineError> {
    params
        .table()
        .ok_or_else(|| EngineError::InvalidIntent("a measurement is required".to_string()))
}

fn require_database(params: &QueryParams) -> Result<&str, EngineError> {
    params
        .database()
        .ok_or_else(|| EngineError::InvalidIntent("a database is required".to_string()))
}

fn select_list(params: &QueryParams) -> String {
    params.field().map_or_else(|| "*".to_string(), quote_ident)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\\\""))
}

fn flux_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn flux_range(params: &QueryParams, defaults: &QueryDefaults) -> String {
    match &params.time_range {
        Some(range) => match &range.end {
            Some(end) => format!("|> range(start: {}, stop: {end})", range.start),
            None => format!("|> range(start: {})", range.start),
        },
        None => format!("|> range(start: -{})", defaults.time_window),
    }
}

fn sql_interval(window: &str) -> String {
    match parse_window(window) {
        Some((amount, unit)) => {
            let unit = match unit {
                "ms" => "millisecond",
                "s" => "second",
                "m" => "minute",
                "d" => "day",
                "w" => "week",
                _ => "hour",
            };
            let plural = if amount == 1 { "" } else { "s" };
            format!("time >= now() - INTERVAL '{amount} {unit}{plural}'")
        }
        None => format!("time >= now() - INTERVAL '{window}'"),
    }
}

/// Byte offset of the `)` matching the `(` at `open`.
fn matching_paren(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0_usize;
    for (offset, ch) in masked[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}
