use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::profiles::ConnectionProfile;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub latency: Duration,
    pub server_version: Option<String>,
    pub error: Option<String>,
}

/// Raw query response as handed over by a transport.
///
/// Rows are untyped JSON; each backend's engine owns the adapter that turns
/// them into a [`crate::query_engine::QueryResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    #[serde(default)]
    pub row_count: Option<usize>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Wire access to a backend, keyed by connection id.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<ConnectionTestResult, TransportError>;

    async fn execute_query(
        &self,
        connection_id: &str,
        query: &str,
        database: Option<&str>,
    ) -> Result<TransportResponse, TransportError>;

    async fn list_child_objects(
        &self,
        connection_id: &str,
        parent_path: &str,
    ) -> Result<Vec<String>, TransportError>;

    async fn list_fields(
        &self,
        connection_id: &str,
        object_path: &str,
    ) -> Result<Vec<FieldDescriptor>, TransportError>;

    async fn list_tags(
        &self,
        connection_id: &str,
        object_path: &str,
    ) -> Result<Vec<TagDescriptor>, TransportError>;
}
