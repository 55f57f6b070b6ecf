use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    #[serde(rename = "influxdb")]
    InfluxDb,
    #[serde(rename = "iotdb")]
    IoTDb,
}

impl BackendType {
    pub const ALL: [BackendType; 2] = [BackendType::InfluxDb, BackendType::IoTDb];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InfluxDb => "influxdb",
            Self::IoTDb => "iotdb",
        }
    }

    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::InfluxDb => 8086,
            Self::IoTDb => 6667,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown backend type `{0}`")]
pub struct ParseBackendTypeError(String);

impl FromStr for BackendType {
    type Err = ParseBackendTypeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "influxdb" | "influx" => Ok(Self::InfluxDb),
            "iotdb" => Ok(Self::IoTDb),
            _ => Err(ParseBackendTypeError(raw.to_string())),
        }
    }
}

/// Version tag of a backend dialect, e.g. `1.x` or `0.13.x`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialectVersion(String);

impl DialectVersion {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into().trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wildcard keys this version may be registered under, most specific first.
    ///
    /// `1.8.10` yields `1.8.10`, `1.8.x`, `1.x`.
    #[must_use]
    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = vec![self.0.clone()];
        let numeric = self
            .0
            .trim_start_matches(['v', 'V'])
            .split('.')
            .take_while(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
            .collect::<Vec<_>>();

        for depth in (1..=numeric.len().min(2)).rev() {
            let key = format!("{}.x", numeric[..depth].join("."));
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

impl fmt::Display for DialectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DialectVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DialectVersion {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryLanguage {
    InfluxQl,
    Flux,
    Sql,
    IotdbSql,
}

impl QueryLanguage {
    /// Whether statements in this language are `;`-delimited.
    #[must_use]
    pub fn is_statement_delimited(self) -> bool {
        !matches!(self, Self::Flux)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperation {
    Select,
    Show,
    Describe,
    Create,
    Drop,
}

impl QueryOperation {
    pub const ALL: [QueryOperation; 5] = [
        QueryOperation::Select,
        QueryOperation::Show,
        QueryOperation::Describe,
        QueryOperation::Create,
        QueryOperation::Drop,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Show => "show",
            Self::Describe => "describe",
            Self::Create => "create",
            Self::Drop => "drop",
        }
    }
}

impl fmt::Display for QueryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryOperation {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| format!("unknown query operation `{raw}`"))
    }
}
