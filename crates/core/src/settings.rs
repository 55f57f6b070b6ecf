use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::completion_engine::DEFAULT_MAX_SUGGESTIONS;
use crate::profiles::config_dir;
use crate::query_engine::{parse_window, QueryDefaults, DEFAULT_ROW_LIMIT, DEFAULT_TIME_WINDOW};
use crate::schema_cache::{DEFAULT_MAX_SCHEMA_OBJECTS, DEFAULT_SCHEMA_TTL};

/// Tunables shared by the engines, the schema cache and completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub schema_ttl_secs: u64,
    pub max_schema_objects: usize,
    pub default_limit: usize,
    pub default_time_window: String,
    pub max_suggestions: usize,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            schema_ttl_secs: DEFAULT_SCHEMA_TTL.as_secs(),
            max_schema_objects: DEFAULT_MAX_SCHEMA_OBJECTS,
            default_limit: DEFAULT_ROW_LIMIT,
            default_time_window: DEFAULT_TIME_WINDOW.to_string(),
            max_suggestions: DEFAULT_MAX_SUGGESTIONS,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl CoreSettings {
    pub fn load_default() -> Result<Self, SettingsError> {
        let path = default_settings_path()?;
        Self::load_from_path(&path)
    }

    /// Missing files and missing keys fall back to defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let settings: Self = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.default_limit == 0 {
            return Err(SettingsError::Invalid {
                key: "default_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_suggestions == 0 {
            return Err(SettingsError::Invalid {
                key: "max_suggestions",
                reason: "must be greater than zero".to_string(),
            });
        }
        if parse_window(&self.default_time_window).is_none() {
            return Err(SettingsError::Invalid {
                key: "default_time_window",
                reason: format!(
                    "`{}` is not a duration like 30m, 1h or 7d",
                    self.default_time_window
                ),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn schema_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_ttl_secs)
    }

    #[must_use]
    pub fn query_defaults(&self) -> QueryDefaults {
        QueryDefaults {
            row_limit: self.default_limit,
            time_window: self.default_time_window.trim().to_string(),
        }
    }
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    config_dir()
        .map(|dir| dir.join("settings.toml"))
        .ok_or(SettingsError::ConfigDirUnavailable)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{CoreSettings, SettingsError};

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let settings = CoreSettings::load_from_path(&temp_dir.path().join("settings.toml"))
            .expect("missing file should load defaults");

        assert_eq!(settings, CoreSettings::default());
        assert_eq!(settings.schema_ttl(), Duration::from_secs(300));
        assert_eq!(settings.max_schema_objects, 50);
        assert_eq!(settings.query_defaults().row_limit, 1000);
        assert_eq!(settings.query_defaults().time_window, "1h");
        assert_eq!(settings.max_suggestions, 100);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("settings.toml");
        fs::write(&path, "default_limit = 250\ndefault_time_window = \"15m\"\n")
            .expect("failed to write settings");

        let settings = CoreSettings::load_from_path(&path).expect("settings should load");
        assert_eq!(settings.default_limit, 250);
        assert_eq!(settings.default_time_window, "15m");
        assert_eq!(settings.schema_ttl_secs, 300);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("settings.toml");

        fs::write(&path, "default_time_window = \"soon\"\n").expect("failed to write settings");
        assert!(matches!(
            CoreSettings::load_from_path(&path),
            Err(SettingsError::Invalid {
                key: "default_time_window",
                ..
            })
        ));

        fs::write(&path, "default_limit = \"many\"\n").expect("failed to write settings");
        assert!(matches!(
            CoreSettings::load_from_path(&path),
            Err(SettingsError::Parse { .. })
        ));
    }
}
