use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendType, DialectVersion};

pub const CONFIG_DIR_ENV: &str = "TSQ_CONFIG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub name: String,
    pub backend: BackendType,
    pub version: DialectVersion,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl ConnectionProfile {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        backend: BackendType,
        version: impl Into<DialectVersion>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            version: version.into(),
            host: host.into(),
            port: backend.default_port(),
            user: None,
            database: None,
            read_only: false,
        }
    }

    /// Identifier transports and caches key this connection by.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Error)]
pub enum ProfilesError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read profiles file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse profiles file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize profiles: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write profiles file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfilesDocument {
    #[serde(default)]
    profiles: Vec<ConnectionProfile>,
}

impl ProfilesDocument {
    /// Last definition of a name wins; output is sorted by name.
    fn normalize(&mut self) {
        let mut by_name = std::collections::BTreeMap::new();
        for profile in self.profiles.drain(..) {
            by_name.insert(profile.name.clone(), profile);
        }
        self.profiles = by_name.into_values().collect();
    }
}

#[derive(Debug, Clone)]
pub struct FileProfilesStore {
    path: PathBuf,
    profiles: Vec<ConnectionProfile>,
}

impl FileProfilesStore {
    pub fn load_default() -> Result<Self, ProfilesError> {
        Self::load_from_path(default_profiles_path()?)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, ProfilesError> {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(ProfilesError::Read { path, source }),
        };

        if raw.trim().is_empty() {
            return Ok(Self {
                path,
                profiles: Vec::new(),
            });
        }

        let mut doc: ProfilesDocument =
            toml::from_str(&raw).map_err(|source| ProfilesError::Parse {
                path: path.clone(),
                source,
            })?;
        doc.normalize();
        tracing::debug!(path = %path.display(), profiles = doc.profiles.len(), "loaded profiles");

        Ok(Self {
            path,
            profiles: doc.profiles,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    /// Profiles targeting `backend`, in name order.
    pub fn profiles_for(&self, backend: BackendType) -> impl Iterator<Item = &ConnectionProfile> {
        self.profiles
            .iter()
            .filter(move |profile| profile.backend == backend)
    }

    pub fn upsert_profile(&mut self, profile: ConnectionProfile) {
        if let Some(existing) = self
            .profiles
            .iter_mut()
            .find(|existing| existing.name == profile.name)
        {
            *existing = profile;
        } else {
            self.profiles.push(profile);
            self.profiles.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        }
    }

    #[must_use]
    pub fn delete_profile(&mut self, name: &str) -> bool {
        let original_len = self.profiles.len();
        self.profiles.retain(|profile| profile.name != name);
        self.profiles.len() != original_len
    }

    pub fn persist(&self) -> Result<(), ProfilesError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| ProfilesError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let doc = ProfilesDocument {
            profiles: self.profiles.clone(),
        };
        let rendered =
            toml::to_string_pretty(&doc).map_err(|source| ProfilesError::Serialize { source })?;

        fs::write(&self.path, rendered).map_err(|source| ProfilesError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// `$TSQ_CONFIG_DIR`, `%APPDATA%` on Windows, otherwise the XDG config home,
/// each with a `tsq` subdirectory except the explicit override.
#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    if let Some(custom) = env::var_os(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(custom));
    }
    let base_dir = if cfg!(target_os = "windows") {
        PathBuf::from(env::var_os("APPDATA")?)
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        PathBuf::from(env::var_os("HOME")?).join(".config")
    };
    Some(base_dir.join("tsq"))
}

pub fn default_profiles_path() -> Result<PathBuf, ProfilesError> {
    config_dir()
        .map(|dir| dir.join("profiles.toml"))
        .ok_or(ProfilesError::ConfigDirUnavailable)
}
