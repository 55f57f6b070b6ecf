use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tsq_core::backend::{BackendType, DialectVersion, QueryOperation};
use tsq_core::completion_engine::CompletionEngine;
use tsq_core::engine_factory::{FactoryError, QueryEngineFactory};
use tsq_core::profiles::{ConnectionProfile, FileProfilesStore, ProfilesError};
use tsq_core::query_engine::{EngineError, QueryParams};
use tsq_core::registry::{BackendRegistry, RegistryError};
use tsq_core::schema_cache::SchemaCache;
use tsq_core::settings::{CoreSettings, SettingsError};
use tsq_core::statement_splitter::split_statements;
use tsq_core::transport::{
    ConnectionTestResult, FieldDescriptor, TagDescriptor, Transport, TransportError,
    TransportResponse,
};

const LOG_ENV: &str = "TSQ_LOG";
const OFFLINE_CONNECTION: &str = "offline";

const USAGE: &str = "usage:
  tsq backends
  tsq profiles
  tsq validate <target>
  tsq split                                   < statements
  tsq build <target> <operation> [--database D] [--table T] [--field F] [--type TYPE] [--limit N]
  tsq optimize <target> [--limit N] < query
  tsq adapt <backend> <source-version> <target-version> < query
  tsq complete <target> [--database D] [--cursor N] < text

<target> is either `<backend> <version>` or `--profile NAME`";

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}\n\n{USAGE}")]
    Usage(String),
    #[error("failed to read stdin: {0}")]
    Input(#[from] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn usage(message: impl Into<String>) -> CliError {
    CliError::Usage(message.into())
}

/// Transport for commands that never reach a server.
#[derive(Debug, Default)]
struct OfflineTransport;

impl OfflineTransport {
    fn unavailable() -> TransportError {
        TransportError::new("no server connection in offline mode")
    }
}

#[async_trait]
impl Transport for OfflineTransport {
    async fn test_connection(
        &self,
        _profile: &ConnectionProfile,
    ) -> Result<ConnectionTestResult, TransportError> {
        Ok(ConnectionTestResult {
            success: false,
            latency: Duration::ZERO,
            server_version: None,
            error: Some(Self::unavailable().to_string()),
        })
    }

    async fn execute_query(
        &self,
        _connection_id: &str,
        _query: &str,
        _database: Option<&str>,
    ) -> Result<TransportResponse, TransportError> {
        Err(Self::unavailable())
    }

    async fn list_child_objects(
        &self,
        _connection_id: &str,
        _parent_path: &str,
    ) -> Result<Vec<String>, TransportError> {
        Err(Self::unavailable())
    }

    async fn list_fields(
        &self,
        _connection_id: &str,
        _object_path: &str,
    ) -> Result<Vec<FieldDescriptor>, TransportError> {
        Err(Self::unavailable())
    }

    async fn list_tags(
        &self,
        _connection_id: &str,
        _object_path: &str,
    ) -> Result<Vec<TagDescriptor>, TransportError> {
        Err(Self::unavailable())
    }
}

#[derive(Debug, Default)]
struct Flags {
    params: QueryParams,
    cursor: Option<usize>,
}

fn parse_flags(args: &[String]) -> Result<Flags, CliError> {
    let mut flags = Flags::default();
    let mut args = args.iter();
    while let Some(flag) = args.next() {
        let value = args
            .next()
            .ok_or_else(|| usage(format!("missing value for `{flag}`")))?;
        match flag.as_str() {
            "--database" => flags.params.database = Some(value.clone()),
            "--table" => flags.params.table = Some(value.clone()),
            "--field" => flags.params.field = Some(value.clone()),
            "--type" => flags.params.data_type = Some(value.clone()),
            "--limit" => flags.params.limit = Some(parse_number(flag, value)?),
            "--cursor" => flags.cursor = Some(parse_number(flag, value)?),
            _ => return Err(usage(format!("unknown flag `{flag}`"))),
        }
    }
    Ok(flags)
}

fn parse_number(flag: &str, value: &str) -> Result<usize, CliError> {
    value
        .parse()
        .map_err(|_| usage(format!("`{flag}` expects a number, got `{value}`")))
}

fn parse_backend(raw: Option<&String>) -> Result<BackendType, CliError> {
    let raw = raw.ok_or_else(|| usage("missing backend"))?;
    raw.parse::<BackendType>().map_err(|error| usage(error.to_string()))
}

fn parse_version(raw: Option<&String>) -> Result<DialectVersion, CliError> {
    raw.map(|version| DialectVersion::new(version.as_str()))
        .ok_or_else(|| usage("missing version"))
}

/// Backend version a command runs against, optionally taken from a stored
/// connection profile.
#[derive(Debug)]
struct Target {
    backend: BackendType,
    version: DialectVersion,
    connection_id: String,
    database: Option<String>,
}

impl From<&ConnectionProfile> for Target {
    fn from(profile: &ConnectionProfile) -> Self {
        Self {
            backend: profile.backend,
            version: profile.version.clone(),
            connection_id: profile.connection_id().to_string(),
            database: profile.database.clone(),
        }
    }
}

struct App {
    registry: Arc<BackendRegistry>,
    factory: QueryEngineFactory,
    settings: CoreSettings,
    profiles: Option<FileProfilesStore>,
}

impl App {
    fn new(settings: CoreSettings, profiles: Option<FileProfilesStore>) -> Self {
        let registry = Arc::new(BackendRegistry::with_builtin_backends());
        let factory = QueryEngineFactory::new(Arc::clone(&registry), Arc::new(OfflineTransport))
            .with_defaults(settings.query_defaults());
        Self {
            registry,
            factory,
            settings,
            profiles,
        }
    }

    /// Reads the leading `<backend> <version>` or `--profile NAME` and
    /// returns the remaining arguments.
    fn target<'a>(&self, args: &'a [String]) -> Result<(Target, &'a [String]), CliError> {
        let rest = args.get(2..).unwrap_or_default();
        if args.first().map(String::as_str) != Some("--profile") {
            let target = Target {
                backend: parse_backend(args.first())?,
                version: parse_version(args.get(1))?,
                connection_id: OFFLINE_CONNECTION.to_string(),
                database: None,
            };
            return Ok((target, rest));
        }

        let name = args
            .get(1)
            .ok_or_else(|| usage("missing value for `--profile`"))?;
        let profile = self
            .profiles
            .as_ref()
            .and_then(|store| store.profile(name))
            .ok_or_else(|| usage(format!("unknown profile `{name}`")))?;
        Ok((Target::from(profile), rest))
    }

    /// Parses the flags after the target; the profile database applies
    /// unless `--database` overrides it.
    fn target_flags(target: &Target, args: &[String]) -> Result<Flags, CliError> {
        let mut flags = parse_flags(args)?;
        if flags.params.database.is_none() {
            flags.params.database.clone_from(&target.database);
        }
        Ok(flags)
    }

    fn backends(&self) -> Result<Value, CliError> {
        self.registry
            .registered_types()
            .into_iter()
            .map(|backend| -> Result<Value, CliError> {
                let features = self.registry.base_features(backend)?;
                Ok(json!({
                    "backend": backend,
                    "display_name": features.display_name,
                    "default_port": features.default_port,
                    "versions": features.version_features.keys().collect::<Vec<_>>(),
                    "hierarchy": features
                        .hierarchy
                        .levels
                        .iter()
                        .map(|level| level.name.as_str())
                        .collect::<Vec<_>>(),
                }))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    async fn run(
        &self,
        args: &[String],
        read_input: impl FnOnce() -> io::Result<String>,
    ) -> Result<Value, CliError> {
        let (command, rest) = args
            .split_first()
            .ok_or_else(|| usage("missing command"))?;

        match command.as_str() {
            "backends" => self.backends(),
            "profiles" => Ok(json!(self
                .profiles
                .as_ref()
                .map(FileProfilesStore::profiles)
                .unwrap_or_default())),
            "validate" => {
                let (target, _) = self.target(rest)?;
                Ok(json!(self
                    .factory
                    .validate_engine(target.backend, &target.version)))
            }
            "split" => Ok(json!(split_statements(&read_input()?))),
            "build" => {
                let (target, rest) = self.target(rest)?;
                let operation = rest
                    .first()
                    .ok_or_else(|| usage("missing operation"))?
                    .parse::<QueryOperation>()
                    .map_err(usage)?;
                let flags = Self::target_flags(&target, rest.get(1..).unwrap_or_default())?;
                let engine = self.factory.create(target.backend, &target.version)?;
                let query = engine.build_query(operation, &flags.params)?;
                Ok(json!({ "language": engine.language(), "query": query }))
            }
            "optimize" => {
                let (target, rest) = self.target(rest)?;
                let flags = Self::target_flags(&target, rest)?;
                let engine = self.factory.create(target.backend, &target.version)?;
                let query = engine.optimize_query(&read_input()?, Some(&flags.params));
                Ok(json!({ "language": engine.language(), "query": query }))
            }
            "adapt" => {
                let backend = parse_backend(rest.first())?;
                let source = parse_version(rest.get(1))?;
                let target = parse_version(rest.get(2))?;
                let engine = self.factory.create(backend, &source)?;
                Ok(json!({ "query": engine.adapt_query(&read_input()?, &target) }))
            }
            "complete" => {
                let (target, rest) = self.target(rest)?;
                let flags = Self::target_flags(&target, rest)?;
                let text = read_input()?;
                let cursor = flags.cursor.unwrap_or(text.len());

                let schema_cache = Arc::new(
                    SchemaCache::new(Arc::new(OfflineTransport), self.settings.schema_ttl())
                        .with_max_objects(self.settings.max_schema_objects),
                );
                let completion = CompletionEngine::new(
                    &self.registry,
                    schema_cache,
                    target.backend,
                    target.version,
                )?
                .with_max_suggestions(self.settings.max_suggestions);
                let suggestions = completion
                    .generate_suggestions(
                        &target.connection_id,
                        flags.params.database.as_deref(),
                        &text,
                        cursor,
                    )
                    .await;
                Ok(json!(suggestions))
            }
            other => Err(usage(format!("unknown command `{other}`"))),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_settings() -> Result<CoreSettings, SettingsError> {
    match CoreSettings::load_default() {
        Err(SettingsError::ConfigDirUnavailable) => Ok(CoreSettings::default()),
        loaded => loaded,
    }
}

fn load_profiles() -> Result<Option<FileProfilesStore>, ProfilesError> {
    match FileProfilesStore::load_default() {
        Err(ProfilesError::ConfigDirUnavailable) => Ok(None),
        loaded => loaded.map(Some),
    }
}

fn read_stdin() -> io::Result<String> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(input)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let app = App::new(load_settings()?, load_profiles()?);

    tracing::debug!(command = ?args.first(), "running command");
    let output = app.run(&args, read_stdin).await;
    app.factory.cleanup();
    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;
    use tempfile::TempDir;
    use tsq_core::profiles::FileProfilesStore;
    use tsq_core::settings::CoreSettings;

    use super::{App, CliError};

    const PROFILES: &str = r#"
[[profiles]]
name = "plant"
backend = "iotdb"
version = "0.13.x"
host = "10.0.0.5"
port = 6667
database = "sg1"

[[profiles]]
name = "metrics"
backend = "influxdb"
version = "2.x"
host = "localhost"
port = 8086
"#;

    fn app_with_profiles(temp_dir: &TempDir) -> App {
        let path = temp_dir.path().join("profiles.toml");
        fs::write(&path, PROFILES).expect("failed to write profiles");
        let store = FileProfilesStore::load_from_path(path).expect("profiles should load");
        App::new(CoreSettings::default(), Some(store))
    }

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| (*arg).to_string()).collect()
    }

    async fn run(raw: &[&str], input: &str) -> Result<Value, CliError> {
        let app = App::new(CoreSettings::default(), None);
        let input = input.to_string();
        app.run(&args(raw), move || Ok(input)).await
    }

    #[tokio::test]
    async fn backends_lists_builtin_registrations() {
        let output = run(&["backends"], "").await.expect("backends should list");
        let backends = output.as_array().expect("array output");

        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0]["backend"], "influxdb");
        assert_eq!(backends[1]["hierarchy"][0], "storage_group");
    }

    #[tokio::test]
    async fn build_renders_dialect_query() {
        let output = run(
            &["build", "iotdb", "0.13.x", "create", "--database", "sg1"],
            "",
        )
        .await
        .expect("build should succeed");
        assert_eq!(output["query"], "SET STORAGE GROUP TO root.sg1");
    }

    #[tokio::test]
    async fn optimize_reads_query_from_input() {
        let output = run(&["optimize", "influx", "1.x", "--limit", "20"], "SELECT * FROM cpu")
            .await
            .expect("optimize should succeed");
        assert_eq!(
            output["query"],
            "SELECT * FROM cpu WHERE time > now() - 1h LIMIT 20"
        );
    }

    #[tokio::test]
    async fn split_reports_statement_types() {
        let output = run(&["split"], "SHOW DATABASES; SELECT 'a;b' FROM t")
            .await
            .expect("split should succeed");
        assert_eq!(output[0]["statement_type"], "show");
        assert_eq!(output[1]["statement_type"], "select");
    }

    #[tokio::test]
    async fn complete_without_server_suggests_keywords() {
        let output = run(&["complete", "influxdb", "1.x", "--database", "db"], "SEL")
            .await
            .expect("completion should succeed offline");
        assert_eq!(output[0]["label"], "SELECT");
        assert_eq!(output[0]["kind"], "keyword");
    }

    #[tokio::test]
    async fn bad_arguments_are_usage_errors() {
        assert!(matches!(run(&[], "").await, Err(CliError::Usage(_))));
        assert!(matches!(run(&["frobnicate"], "").await, Err(CliError::Usage(_))));
        assert!(matches!(
            run(&["build", "mysql", "8", "select"], "").await,
            Err(CliError::Usage(_))
        ));
        assert!(matches!(
            run(&["build", "influxdb", "2.x", "drop", "--database", "x"], "").await,
            Err(CliError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn profile_supplies_backend_version_and_database() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let app = app_with_profiles(&temp_dir);

        let output = app
            .run(&args(&["build", "--profile", "plant", "show"]), || {
                Ok(String::new())
            })
            .await
            .expect("build should succeed");
        assert_eq!(output["query"], "SHOW DEVICES root.sg1.**");

        let output = app
            .run(
                &args(&["build", "--profile", "plant", "show", "--database", "sg2"]),
                || Ok(String::new()),
            )
            .await
            .expect("build should succeed");
        assert_eq!(output["query"], "SHOW DEVICES root.sg2.**");

        let output = app
            .run(&args(&["validate", "--profile", "metrics"]), || {
                Ok(String::new())
            })
            .await
            .expect("validate should succeed");
        assert_eq!(output["valid"], true);
    }

    #[tokio::test]
    async fn profiles_command_lists_store_and_rejects_unknown_names() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let app = app_with_profiles(&temp_dir);

        let output = app
            .run(&args(&["profiles"]), || Ok(String::new()))
            .await
            .expect("profiles should list");
        assert_eq!(output[0]["name"], "metrics");
        assert_eq!(output[1]["backend"], "iotdb");

        let error = app
            .run(&args(&["optimize", "--profile", "missing"]), || {
                Ok(String::new())
            })
            .await
            .expect_err("unknown profile");
        assert!(matches!(error, CliError::Usage(message) if message.contains("missing")));

        let output = run(&["profiles"], "").await.expect("profiles should list");
        assert_eq!(output, Value::Array(Vec::new()));
    }

    #[test]
    fn settings_file_feeds_engine_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("settings.toml");
        fs::write(&path, "default_limit = 5\n").expect("failed to write settings");

        let settings = CoreSettings::load_from_path(&path).expect("settings should load");
        let app = App::new(settings, None);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime should build");
        let output = runtime
            .block_on(app.run(&args(&["optimize", "iotdb", "1.x"]), || {
                Ok("SELECT s1 FROM root.sg1.d1".to_string())
            }))
            .expect("optimize should succeed");

        assert_eq!(
            output["query"],
            "SELECT s1 FROM root.sg1.d1 WHERE time > now() - 1h LIMIT 5"
        );
    }
}
