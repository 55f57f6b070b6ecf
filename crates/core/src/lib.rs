pub mod backend;
pub mod builtin_backends;
pub mod completion_context;
pub mod completion_engine;
pub mod engine_factory;
pub mod influxdb_engine;
pub mod iotdb_engine;
pub mod object_path;
pub mod profiles;
pub mod query_engine;
pub mod registry;
pub mod schema_cache;
pub mod settings;
pub mod statement_splitter;
pub mod transport;

#[cfg(test)]
mod test_transport;

#[must_use]
pub fn domain_name() -> &'static str {
    "tsq-core"
}
