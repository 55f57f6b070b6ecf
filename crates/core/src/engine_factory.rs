use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::backend::{BackendType, DialectVersion};
use crate::influxdb_engine::InfluxDbEngine;
use crate::iotdb_engine::IoTDbEngine;
use crate::query_engine::{QueryDefaults, QueryEngine};
use crate::registry::BackendRegistry;
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("backend `{0}` is not supported")]
    UnsupportedBackend(BackendType),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EngineValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Cache key owning one engine per backend version.
#[must_use]
pub fn engine_cache_key(backend: BackendType, version: &DialectVersion) -> String {
    format!("{backend}:{version}")
}

/// Creates and caches one [`QueryEngine`] per `(backend, version)`.
pub struct QueryEngineFactory {
    registry: Arc<BackendRegistry>,
    transport: Arc<dyn Transport>,
    defaults: QueryDefaults,
    engines: Mutex<HashMap<String, Arc<dyn QueryEngine>>>,
}

impl fmt::Debug for QueryEngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngineFactory")
            .field("registry", &self.registry)
            .field("defaults", &self.defaults)
            .field("engines", &self.cached_keys())
            .finish_non_exhaustive()
    }
}

impl QueryEngineFactory {
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            defaults: QueryDefaults::default(),
            engines: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn QueryEngine>>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached engine for `backend`/`version`, creating it on
    /// first use.
    pub fn create(
        &self,
        backend: BackendType,
        version: &DialectVersion,
    ) -> Result<Arc<dyn QueryEngine>, FactoryError> {
        let key = engine_cache_key(backend, version);
        let mut engines = self.engines();
        if let Some(engine) = engines.get(&key) {
            return Ok(Arc::clone(engine));
        }

        let base = self
            .registry
            .base_features(backend)
            .map_err(|_| FactoryError::UnsupportedBackend(backend))?
            .clone();
        let transport = Arc::clone(&self.transport);
        let defaults = self.defaults.clone();
        let version = version.clone();

        let engine: Arc<dyn QueryEngine> = match backend {
            BackendType::InfluxDb => {
                Arc::new(InfluxDbEngine::new(base, version, defaults, transport))
            }
            BackendType::IoTDb => Arc::new(IoTDbEngine::new(base, version, defaults, transport)),
        };
        tracing::info!(
            %key,
            language = ?engine.language(),
            "created query engine"
        );

        engines.insert(key, Arc::clone(&engine));
        Ok(engine)
    }

    #[must_use]
    pub fn get(
        &self,
        backend: BackendType,
        version: &DialectVersion,
    ) -> Option<Arc<dyn QueryEngine>> {
        self.engines()
            .get(&engine_cache_key(backend, version))
            .map(Arc::clone)
    }

    /// Checks that an engine could be built for `backend`/`version` without
    /// building one.
    #[must_use]
    pub fn validate_engine(
        &self,
        backend: BackendType,
        version: &DialectVersion,
    ) -> EngineValidation {
        let mut validation = EngineValidation::default();

        match self.registry.get_features(backend, Some(version)) {
            Ok(features) => {
                if features.query_capabilities.languages.is_empty() {
                    validation
                        .errors
                        .push(format!("{backend} {version} declares no query language"));
                }
                if features.hierarchy.levels.is_empty() {
                    validation
                        .errors
                        .push(format!("{backend} declares an empty object hierarchy"));
                }
                if features.resolve_version(version).is_none() {
                    validation.warnings.push(format!(
                        "no feature set registered for {backend} {version}, base features apply"
                    ));
                }
            }
            Err(error) => validation.errors.push(error.to_string()),
        }

        validation.valid = validation.errors.is_empty();
        validation
    }

    /// Tears down the cached engine, if any, and creates a fresh one.
    pub fn reload(
        &self,
        backend: BackendType,
        version: &DialectVersion,
    ) -> Result<Arc<dyn QueryEngine>, FactoryError> {
        let key = engine_cache_key(backend, version);
        let evicted = self.engines().remove(&key);
        if let Some(engine) = evicted {
            engine.shutdown();
            tracing::debug!(%key, "evicted query engine");
        }
        self.create(backend, version)
    }

    /// Tears down every cached engine and empties the cache.
    pub fn cleanup(&self) {
        let evicted = self.engines().drain().collect::<Vec<_>>();
        for (_, engine) in &evicted {
            engine.shutdown();
        }
        tracing::info!(engines = evicted.len(), "query engines cleaned up");
    }

    #[must_use]
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys = self.engines().keys().cloned().collect::<Vec<_>>();
        keys.sort_unstable();
        keys
    }
}
