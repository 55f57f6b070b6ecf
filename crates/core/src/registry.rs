use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::backend::{BackendType, DialectVersion, QueryLanguage, QueryOperation};
use crate::builtin_backends::{influxdb_features, iotdb_features};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildMethod {
    /// Enumerate children through `list_child_objects`.
    ListChildren,
    /// Enumerate children through `list_fields`/`list_tags`.
    ListFields,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Level {
    pub name: String,
    pub has_children: bool,
    pub child_method: ChildMethod,
}

impl Level {
    #[must_use]
    pub fn branch(name: &str, child_method: ChildMethod) -> Self {
        Self {
            name: name.to_string(),
            has_children: true,
            child_method,
        }
    }

    #[must_use]
    pub fn leaf(name: &str) -> Self {
        Self {
            name: name.to_string(),
            has_children: false,
            child_method: ChildMethod::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hierarchy {
    pub levels: Vec<Level>,
    pub max_depth: usize,
}

impl Hierarchy {
    #[must_use]
    pub fn new(levels: Vec<Level>) -> Self {
        let max_depth = levels.len();
        Self { levels, max_depth }
    }

    #[must_use]
    pub fn root(&self) -> Option<&Level> {
        self.levels.first()
    }

    #[must_use]
    pub fn leaf(&self) -> Option<&Level> {
        self.levels.last()
    }

    #[must_use]
    pub fn level(&self, name: &str) -> Option<&Level> {
        self.levels.iter().find(|level| level.name == name)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.levels.is_empty() {
            return Err("hierarchy has no levels".to_string());
        }
        if self.max_depth != self.levels.len() {
            return Err(format!(
                "max depth {} does not match level count {}",
                self.max_depth,
                self.levels.len()
            ));
        }

        let mut seen = HashSet::new();
        for level in &self.levels {
            if !seen.insert(level.name.as_str()) {
                return Err(format!("duplicate level `{}`", level.name));
            }
        }

        let leaves = self
            .levels
            .iter()
            .filter(|level| !level.has_children)
            .count();
        if leaves != 1 {
            return Err(format!("expected exactly one leaf level, found {leaves}"));
        }
        if self.leaf().is_some_and(|level| level.has_children) {
            return Err("the last level must be the leaf".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DialectVocabulary {
    pub keywords: Vec<String>,
    pub functions: Vec<String>,
    pub operators: Vec<String>,
}

impl DialectVocabulary {
    #[must_use]
    pub fn from_static(keywords: &[&str], functions: &[&str], operators: &[&str]) -> Self {
        let owned = |items: &[&str]| -> Vec<String> {
            items.iter().map(|item| (*item).to_string()).collect()
        };
        Self {
            keywords: owned(keywords),
            functions: owned(functions),
            operators: owned(operators),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.functions.is_empty() && self.operators.is_empty()
    }

    #[must_use]
    pub fn is_keyword(&self, word: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| keyword.eq_ignore_ascii_case(word))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryCapabilities {
    pub languages: Vec<QueryLanguage>,
    pub supported_operations: Vec<QueryOperation>,
    pub max_query_size: usize,
    pub timeout: Duration,
    pub supports_batch: bool,
    pub supports_async: bool,
    pub vocabulary: DialectVocabulary,
}

impl QueryCapabilities {
    #[must_use]
    pub fn primary_language(&self) -> Option<QueryLanguage> {
        self.languages.first().copied()
    }

    #[must_use]
    pub fn supports_operation(&self, operation: QueryOperation) -> bool {
        self.supported_operations.contains(&operation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionFeatures {
    pub languages: Vec<QueryLanguage>,
    pub supported_operations: Option<Vec<QueryOperation>>,
    pub vocabulary: DialectVocabulary,
    pub endpoints: BTreeMap<String, String>,
    pub limitations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTypeInfo {
    pub label: String,
    pub icon: String,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFeatures {
    pub backend: BackendType,
    pub display_name: String,
    pub default_port: u16,
    pub hierarchy: Hierarchy,
    pub query_capabilities: QueryCapabilities,
    pub version_features: BTreeMap<DialectVersion, VersionFeatures>,
    pub node_type_mapping: BTreeMap<String, NodeTypeInfo>,
}

impl BackendFeatures {
    /// Resolves `version` against the registered version keys.
    #[must_use]
    pub fn resolve_version(&self, version: &DialectVersion) -> Option<&DialectVersion> {
        version.lookup_keys().into_iter().find_map(|key| {
            self.version_features
                .get_key_value(&DialectVersion::new(key))
                .map(|(resolved, _)| resolved)
        })
    }

    /// Features with the override for `version` merged in, or a plain copy
    /// when no override is registered for it.
    #[must_use]
    pub fn for_version(&self, version: &DialectVersion) -> Self {
        match self
            .resolve_version(version)
            .and_then(|resolved| self.version_features.get(resolved))
        {
            Some(overrides) => self.merged_with(overrides),
            None => self.clone(),
        }
    }

    fn merged_with(&self, overrides: &VersionFeatures) -> Self {
        let mut merged = self.clone();
        let capabilities = &mut merged.query_capabilities;
        if !overrides.languages.is_empty() {
            capabilities.languages.clone_from(&overrides.languages);
        }
        if let Some(operations) = &overrides.supported_operations {
            capabilities.supported_operations.clone_from(operations);
        }
        if !overrides.vocabulary.is_empty() {
            capabilities.vocabulary.clone_from(&overrides.vocabulary);
        }
        merged
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("backend `{0}` is not supported")]
    UnsupportedBackend(BackendType),
    #[error("invalid hierarchy for backend `{backend}`: {reason}")]
    InvalidHierarchy {
        backend: BackendType,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct BackendRegistry {
    entries: HashMap<BackendType, BackendFeatures>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_builtin_backends() -> Self {
        let mut registry = Self::new();
        for features in [influxdb_features(), iotdb_features()] {
            let backend = features.backend;
            if let Err(error) = registry.register(features) {
                tracing::error!(%backend, %error, "built-in backend failed validation");
            }
        }
        registry
    }

    pub fn register(&mut self, features: BackendFeatures) -> Result<(), RegistryError> {
        features
            .hierarchy
            .validate()
            .map_err(|reason| RegistryError::InvalidHierarchy {
                backend: features.backend,
                reason,
            })?;

        let backend = features.backend;
        if self.entries.insert(backend, features).is_some() {
            tracing::debug!(%backend, "replaced registered backend");
        }
        Ok(())
    }

    #[must_use]
    pub fn supports(&self, backend: BackendType) -> bool {
        self.entries.contains_key(&backend)
    }

    #[must_use]
    pub fn registered_types(&self) -> Vec<BackendType> {
        let mut types = self.entries.keys().copied().collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    /// Base features for `backend`, without any version override.
    pub fn base_features(&self, backend: BackendType) -> Result<&BackendFeatures, RegistryError> {
        self.entries
            .get(&backend)
            .ok_or(RegistryError::UnsupportedBackend(backend))
    }

    pub fn get_features(
        &self,
        backend: BackendType,
        version: Option<&DialectVersion>,
    ) -> Result<BackendFeatures, RegistryError> {
        let base = self.base_features(backend)?;
        let Some(version) = version else {
            return Ok(base.clone());
        };

        if base.resolve_version(version).is_none() {
            tracing::debug!(%backend, %version, "no version override, using base features");
        }
        Ok(base.for_version(version))
    }

    pub fn get_hierarchy(
        &self,
        backend: BackendType,
        version: Option<&DialectVersion>,
    ) -> Result<Vec<Level>, RegistryError> {
        Ok(self.get_features(backend, version)?.hierarchy.levels)
    }

    pub fn resolve_version(
        &self,
        backend: BackendType,
        version: &DialectVersion,
    ) -> Result<Option<DialectVersion>, RegistryError> {
        Ok(self.base_features(backend)?.resolve_version(version).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendRegistry, ChildMethod, Hierarchy, Level, RegistryError};
    use crate::backend::{BackendType, DialectVersion, QueryLanguage, QueryOperation};
    use crate::builtin_backends::influxdb_features;

    #[test]
    fn unregistered_backend_is_rejected() {
        let registry = BackendRegistry::new();
        let err = registry
            .get_features(BackendType::IoTDb, None)
            .expect_err("empty registry should not resolve");
        assert_eq!(err, RegistryError::UnsupportedBackend(BackendType::IoTDb));
        assert!(!registry.supports(BackendType::IoTDb));
    }

    #[test]
    fn unknown_version_falls_back_to_base_features() {
        let registry = BackendRegistry::with_builtin_backends();
        let base = registry
            .get_features(BackendType::InfluxDb, None)
            .expect("influxdb is built in");
        let unknown = registry
            .get_features(BackendType::InfluxDb, Some(&DialectVersion::new("9.9.x")))
            .expect("unknown versions degrade gracefully");
        assert_eq!(unknown, base);
    }

    #[test]
    fn version_override_replaces_only_dialect_fields() {
        let registry = BackendRegistry::with_builtin_backends();
        let base = registry
            .get_features(BackendType::InfluxDb, None)
            .expect("influxdb is built in");
        let flux = registry
            .get_features(BackendType::InfluxDb, Some(&DialectVersion::new("2.x")))
            .expect("2.x is registered");

        assert_eq!(
            flux.query_capabilities.primary_language(),
            Some(QueryLanguage::Flux)
        );
        assert!(!flux
            .query_capabilities
            .supports_operation(QueryOperation::Create));
        assert_eq!(flux.hierarchy, base.hierarchy);
        assert_eq!(flux.node_type_mapping, base.node_type_mapping);
        assert_eq!(
            flux.query_capabilities.max_query_size,
            base.query_capabilities.max_query_size
        );
    }

    #[test]
    fn concrete_release_resolves_to_wildcard_override() {
        let registry = BackendRegistry::with_builtin_backends();
        let resolved = registry
            .resolve_version(BackendType::IoTDb, &DialectVersion::new("0.13.4"))
            .expect("iotdb is built in");
        assert_eq!(resolved, Some(DialectVersion::new("0.13.x")));
    }

    #[test]
    fn register_is_idempotent_by_type() {
        let mut registry = BackendRegistry::new();
        registry
            .register(influxdb_features())
            .expect("valid features");
        let mut renamed = influxdb_features();
        renamed.display_name = "Influx (custom)".to_string();
        registry.register(renamed).expect("valid features");

        assert_eq!(registry.registered_types(), vec![BackendType::InfluxDb]);
        let features = registry
            .get_features(BackendType::InfluxDb, None)
            .expect("registered");
        assert_eq!(features.display_name, "Influx (custom)");
    }

    #[test]
    fn register_rejects_hierarchy_with_two_leaves() {
        let mut registry = BackendRegistry::new();
        let mut features = influxdb_features();
        features.hierarchy = Hierarchy::new(vec![
            Level::branch("database", ChildMethod::ListChildren),
            Level::leaf("measurement"),
            Level::leaf("field"),
        ]);

        let err = registry
            .register(features)
            .expect_err("two leaves violate the hierarchy invariant");
        assert!(matches!(err, RegistryError::InvalidHierarchy { .. }));
        assert!(!registry.supports(BackendType::InfluxDb));
    }

    #[test]
    fn builtin_hierarchies_have_single_root_and_leaf() {
        let registry = BackendRegistry::with_builtin_backends();
        for backend in registry.registered_types() {
            let levels = registry
                .get_hierarchy(backend, None)
                .expect("registered backend");
            assert!(levels.len() >= 2);
            assert!(levels[..levels.len() - 1]
                .iter()
                .all(|level| level.has_children));
            assert!(!levels[levels.len() - 1].has_children);
        }
    }
}
