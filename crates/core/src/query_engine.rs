use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::backend::{BackendType, DialectVersion, QueryLanguage, QueryOperation};
use crate::registry::BackendFeatures;
use crate::statement_splitter::{code_end, mask_literals, split_statements, StatementType};
use crate::transport::{Transport, TransportError, TransportResponse};

pub const DEFAULT_ROW_LIMIT: usize = 1000;
pub const DEFAULT_TIME_WINDOW: &str = "1h";

static TIME_BOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\btime\s*(>=|<=|<>|!=|>|<|=|\bbetween\b|\bin\b))|((>=|<=|>|<|=)\s*time\b)")
        .expect("time bound pattern is valid")
});
static LIMIT_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blimit\s+\d+").expect("limit pattern is valid"));
static WHERE_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bwhere\b").expect("where pattern is valid"));
static FROM_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfrom\b").expect("from pattern is valid"));
static AFTER_FILTER_CLAUSES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(group\s+by|order\s+by|having|fill|limit|slimit|offset|soffset|align\s+by|tz\s*\()",
    )
    .expect("trailing clause pattern is valid")
});
static AFTER_LIMIT_CLAUSES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(offset|slimit|soffset|align\s+by|tz\s*\()")
        .expect("post-limit clause pattern is valid")
});
static WINDOW_SHORTHAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d|w)$").expect("window pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    /// Lower bound as a dialect literal, e.g. `'2024-01-01T00:00:00Z'` or `now() - 6h`.
    pub start: String,
    pub end: Option<String>,
}

impl TimeRange {
    #[must_use]
    pub fn since(start: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    #[must_use]
    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
        }
    }
}

/// Structured parameters of a query intent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct QueryParams {
    pub database: Option<String>,
    pub table: Option<String>,
    pub field: Option<String>,
    pub data_type: Option<String>,
    pub time_range: Option<TimeRange>,
    pub limit: Option<usize>,
}

impl QueryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    #[must_use]
    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = Some(time_range);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn database(&self) -> Option<&str> {
        non_blank(self.database.as_deref())
    }

    pub(crate) fn table(&self) -> Option<&str> {
        non_blank(self.table.as_deref())
    }

    pub(crate) fn field(&self) -> Option<&str> {
        non_blank(self.field.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRow {
    pub values: Vec<String>,
}

impl QueryRow {
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<QueryRow>,
    pub row_count: usize,
    pub execution_time: Duration,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation `{operation}` is not supported by {backend} {version}")]
    UnsupportedOperation {
        backend: BackendType,
        version: DialectVersion,
        operation: QueryOperation,
    },
    #[error("invalid query intent: {0}")]
    InvalidIntent(String),
    #[error("query failed: {source} (query: `{query}`)")]
    Transport {
        query: String,
        params: Option<QueryParams>,
        #[source]
        source: TransportError,
    },
    #[error("unexpected {backend} response: {reason}")]
    UnexpectedResponse {
        backend: BackendType,
        reason: String,
    },
}

/// Defaults applied by `optimize_query` when a read query is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefaults {
    pub row_limit: usize,
    pub time_window: String,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            time_window: DEFAULT_TIME_WINDOW.to_string(),
        }
    }
}

/// State shared by every engine: its binding, the backend features it was
/// created from and the transport it talks through.
pub(crate) struct EngineCore {
    pub(crate) version: DialectVersion,
    pub(crate) base: BackendFeatures,
    pub(crate) features: BackendFeatures,
    pub(crate) defaults: QueryDefaults,
    pub(crate) transport: Arc<dyn Transport>,
}

impl fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCore")
            .field("backend", &self.base.backend)
            .field("version", &self.version)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl EngineCore {
    pub(crate) fn new(
        base: BackendFeatures,
        version: DialectVersion,
        defaults: QueryDefaults,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let features = base.for_version(&version);
        Self {
            version,
            base,
            features,
            defaults,
            transport,
        }
    }

    pub(crate) fn backend(&self) -> BackendType {
        self.base.backend
    }

    pub(crate) fn ensure_supported(&self, operation: QueryOperation) -> Result<(), EngineError> {
        if self
            .features
            .query_capabilities
            .supports_operation(operation)
        {
            return Ok(());
        }
        Err(EngineError::UnsupportedOperation {
            backend: self.backend(),
            version: self.version.clone(),
            operation,
        })
    }

    /// Primary language of `version` for this backend.
    pub(crate) fn language_of(&self, version: &DialectVersion) -> Option<QueryLanguage> {
        self.base
            .for_version(version)
            .query_capabilities
            .primary_language()
    }

    pub(crate) fn unexpected(&self, reason: impl Into<String>) -> EngineError {
        EngineError::UnexpectedResponse {
            backend: self.backend(),
            reason: reason.into(),
        }
    }
}

/// Dialect-specific query handling for one backend version.
///
/// Engines are created and owned by [`crate::engine_factory::QueryEngineFactory`].
#[async_trait]
pub trait QueryEngine: Send + Sync + fmt::Debug {
    fn backend_type(&self) -> BackendType;

    fn version(&self) -> &DialectVersion;

    fn language(&self) -> QueryLanguage;

    fn transport(&self) -> &dyn Transport;

    fn build_query(
        &self,
        operation: QueryOperation,
        params: &QueryParams,
    ) -> Result<String, EngineError>;

    /// Best-effort rewrite of `query` for `target` of the same backend.
    /// Queries that cannot be rewritten are returned unchanged.
    fn adapt_query(&self, query: &str, target: &DialectVersion) -> String;

    fn optimize_query(&self, query: &str, params: Option<&QueryParams>) -> String;

    fn normalize_response(&self, response: TransportResponse) -> Result<QueryResult, EngineError>;

    async fn execute_query(
        &self,
        connection_id: &str,
        query: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, EngineError> {
        let optimized = self.optimize_query(query, params);
        let database = params.and_then(QueryParams::database);
        let started_at = Instant::now();

        let response = match self
            .transport()
            .execute_query(connection_id, &optimized, database)
            .await
        {
            Ok(response) => response,
            Err(source) => {
                tracing::warn!(
                    backend = %self.backend_type(),
                    version = %self.version(),
                    connection_id,
                    error = %source,
                    "query execution failed"
                );
                return Err(EngineError::Transport {
                    query: optimized,
                    params: params.cloned(),
                    source,
                });
            }
        };

        tracing::debug!(
            backend = %self.backend_type(),
            connection_id,
            elapsed = ?started_at.elapsed(),
            "query executed"
        );
        self.normalize_response(response)
    }

    /// Splits `text` into statements and runs them in order, stopping at the
    /// first failure.
    async fn execute_batch(
        &self,
        connection_id: &str,
        text: &str,
        params: Option<&QueryParams>,
    ) -> Result<Vec<QueryResult>, EngineError> {
        let statements = if self.language().is_statement_delimited() {
            split_statements(text)
                .into_iter()
                .filter(|statement| !statement.is_empty)
                .map(|statement| statement.cleaned)
                .collect::<Vec<_>>()
        } else if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![text.trim().to_string()]
        };

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.execute_query(connection_id, &statement, params).await?);
        }
        Ok(results)
    }

    /// Teardown hook invoked by the factory on eviction and cleanup.
    fn shutdown(&self) {}
}

pub(crate) fn is_read_query(masked: &str) -> bool {
    StatementType::detect(masked) == StatementType::Select
}

pub(crate) fn has_time_bound(masked: &str) -> bool {
    TIME_BOUND.is_match(masked)
}

pub(crate) fn has_limit(masked: &str) -> bool {
    LIMIT_CLAUSE.is_match(masked)
}

/// `WHERE`-clause condition for the requested range or the default window.
pub(crate) fn time_condition(
    params: Option<&QueryParams>,
    defaults: &QueryDefaults,
    recent_window: impl Fn(&str) -> String,
) -> String {
    match params.and_then(|params| params.time_range.as_ref()) {
        Some(range) => match &range.end {
            Some(end) => format!("time >= {} AND time <= {end}", range.start),
            None => format!("time >= {}", range.start),
        },
        None => recent_window(&defaults.time_window),
    }
}

/// Adds the time bound and row limit to an unbounded `SELECT` in any of the
/// SQL-shaped dialects. Everything else is returned unchanged.
pub(crate) fn bound_sql_read(query: &str, time_condition: &str, limit: usize) -> String {
    let (code, trailing_comment) = split_trailing_comment(query.trim());
    let (body, terminator) = match code.strip_suffix(';') {
        Some(body) => (body, ";"),
        None => (code, ""),
    };
    // A comment can also sit between the body and its `;`.
    let (body, inner_comment) = split_trailing_comment(body);

    let masked = mask_literals(body);
    if !is_read_query(&masked) {
        return query.to_string();
    }

    let mut bounded = body.to_string();
    if !has_time_bound(&masked) {
        bounded = inject_time_condition(&bounded, &masked, time_condition);
    }

    let masked = mask_literals(&bounded);
    if !has_limit(&masked) {
        let insert_at = AFTER_LIMIT_CLAUSES
            .find(&masked)
            .map_or(bounded.len(), |found| found.start());
        bounded = splice(&bounded, insert_at, &format!("LIMIT {limit}"));
    }

    format!("{bounded}{inner_comment}{terminator}{trailing_comment}")
}

/// Splits off trailing comments so clauses appended to the code stay
/// outside of them.
fn split_trailing_comment(text: &str) -> (&str, &str) {
    text.split_at(code_end(text))
}

fn inject_time_condition(body: &str, masked: &str, condition: &str) -> String {
    let from_end = FROM_CLAUSE.find(masked).map_or(0, |found| found.end());
    let insert_at = AFTER_FILTER_CLAUSES
        .find_at(masked, from_end)
        .map_or(body.len(), |found| found.start());

    let head = body[..insert_at].trim_end();
    let tail = body[insert_at..].trim_start();

    let filtered = match WHERE_CLAUSE
        .find(&masked[..head.len()])
        .filter(|found| found.start() >= from_end)
    {
        Some(found) => format!(
            "{} ({}) AND {condition}",
            head[..found.end()].trim_end(),
            head[found.end()..].trim()
        ),
        None => format!("{head} WHERE {condition}"),
    };

    if tail.is_empty() {
        filtered
    } else {
        format!("{filtered} {tail}")
    }
}

fn splice(text: &str, at: usize, clause: &str) -> String {
    let head = text[..at].trim_end();
    let tail = text[at..].trim_start();
    if tail.is_empty() {
        format!("{head} {clause}")
    } else {
        format!("{head} {clause} {tail}")
    }
}

/// Applies `(pattern, replacement)` rewrites outside literals and comments.
pub(crate) fn rewrite_keywords(query: &str, rules: &[(&Regex, &str)]) -> String {
    let mut rewritten = query.to_string();
    for (pattern, replacement) in rules {
        let masked = mask_literals(&rewritten);
        let ranges = pattern
            .find_iter(&masked)
            .map(|found| found.range())
            .collect::<Vec<_>>();
        for range in ranges.into_iter().rev() {
            rewritten.replace_range(range, replacement);
        }
    }
    rewritten
}

/// Splits a window shorthand such as `1h` into its amount and unit.
pub(crate) fn parse_window(window: &str) -> Option<(u64, &str)> {
    let captures = WINDOW_SHORTHAND.captures(window.trim())?;
    let amount = captures.get(1)?.as_str().parse().ok()?;
    Some((amount, captures.get(2)?.as_str()))
}

fn cell_to_string(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => Some("NULL".to_string()),
        Value::Bool(value) => Some(value.to_string()),
        Value::Number(value) => Some(value.to_string()),
        Value::String(value) => Some(value.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Converts a positional row, failing on width mismatches and nested cells.
pub(crate) fn positional_row(
    core: &EngineCore,
    index: usize,
    cells: &[Value],
    width: usize,
) -> Result<QueryRow, EngineError> {
    if cells.len() != width {
        return Err(core.unexpected(format!(
            "row {index} has {} cells but {width} columns were declared",
            cells.len()
        )));
    }
    cells
        .iter()
        .enumerate()
        .map(|(column, cell)| {
            cell_to_string(cell).ok_or_else(|| {
                core.unexpected(format!("row {index} column {column} holds a nested value"))
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(QueryRow::new)
}

/// Converts a keyed row by looking up each declared column.
pub(crate) fn keyed_row(
    core: &EngineCore,
    index: usize,
    record: &serde_json::Map<String, Value>,
    columns: &[String],
) -> Result<QueryRow, EngineError> {
    columns
        .iter()
        .map(|column| match record.get(column) {
            None => Ok("NULL".to_string()),
            Some(cell) => cell_to_string(cell).ok_or_else(|| {
                core.unexpected(format!("row {index} column `{column}` holds a nested value"))
            }),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(QueryRow::new)
}

pub(crate) fn finish_result(
    core: &EngineCore,
    columns: Vec<String>,
    rows: Vec<QueryRow>,
    reported_count: Option<usize>,
    execution_time_ms: u64,
) -> Result<QueryResult, EngineError> {
    let row_count = reported_count.unwrap_or(rows.len());
    if row_count < rows.len() {
        return Err(core.unexpected(format!(
            "reported row count {row_count} is smaller than the {} rows returned",
            rows.len()
        )));
    }
    Ok(QueryResult {
        columns,
        rows,
        row_count,
        execution_time: Duration::from_millis(execution_time_ms),
    })
}
