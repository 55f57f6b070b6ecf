use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::profiles::ConnectionProfile;
use crate::transport::{
    ConnectionTestResult, FieldDescriptor, TagDescriptor, Transport, TransportError,
    TransportResponse,
};

/// In-memory transport that replays queued responses and serves a fixed
/// schema.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    executed: Mutex<Vec<String>>,
    children: HashMap<String, Vec<String>>,
    fields: HashMap<String, Vec<FieldDescriptor>>,
    tags: HashMap<String, Vec<TagDescriptor>>,
    failing_paths: HashSet<String>,
    pub(crate) listing_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(self, response: TransportResponse) -> Self {
        self.push(Ok(response));
        self
    }

    pub(crate) fn fail(self, message: &str) -> Self {
        self.push(Err(TransportError::new(message)));
        self
    }

    fn push(&self, outcome: Result<TransportResponse, TransportError>) {
        self.responses
            .lock()
            .expect("responses lock")
            .push_back(outcome);
    }

    pub(crate) fn with_children(mut self, parent: &str, children: &[&str]) -> Self {
        self.children.insert(
            parent.to_string(),
            children.iter().map(|child| (*child).to_string()).collect(),
        );
        self
    }

    pub(crate) fn with_fields(mut self, path: &str, fields: &[&str]) -> Self {
        self.fields.insert(
            path.to_string(),
            fields
                .iter()
                .map(|name| FieldDescriptor {
                    name: (*name).to_string(),
                    data_type: Some("float".to_string()),
                })
                .collect(),
        );
        self
    }

    pub(crate) fn with_tags(mut self, path: &str, tags: &[&str]) -> Self {
        self.tags.insert(
            path.to_string(),
            tags.iter()
                .map(|name| TagDescriptor {
                    name: (*name).to_string(),
                    values: Vec::new(),
                })
                .collect(),
        );
        self
    }

    pub(crate) fn failing_at(mut self, path: &str) -> Self {
        self.failing_paths.insert(path.to_string());
        self
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed lock").clone()
    }

    fn check_path(&self, path: &str) -> Result<(), TransportError> {
        if self.failing_paths.contains(path) {
            return Err(TransportError::new(format!("cannot read `{path}`")));
        }
        Ok(())
    }
}

pub(crate) fn rows_response(columns: &[&str], rows: Vec<Value>) -> TransportResponse {
    TransportResponse {
        columns: columns.iter().map(|column| (*column).to_string()).collect(),
        rows,
        row_count: None,
        execution_time_ms: 7,
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn test_connection(
        &self,
        _profile: &ConnectionProfile,
    ) -> Result<ConnectionTestResult, TransportError> {
        Ok(ConnectionTestResult {
            success: true,
            latency: Duration::from_millis(1),
            server_version: Some("scripted".to_string()),
            error: None,
        })
    }

    async fn execute_query(
        &self,
        _connection_id: &str,
        query: &str,
        _database: Option<&str>,
    ) -> Result<TransportResponse, TransportError> {
        self.executed
            .lock()
            .expect("executed lock")
            .push(query.to_string());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Ok(rows_response(&[], Vec::new())))
    }

    async fn list_child_objects(
        &self,
        _connection_id: &str,
        parent_path: &str,
    ) -> Result<Vec<String>, TransportError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.check_path(parent_path)?;
        Ok(self.children.get(parent_path).cloned().unwrap_or_default())
    }

    async fn list_fields(
        &self,
        _connection_id: &str,
        object_path: &str,
    ) -> Result<Vec<FieldDescriptor>, TransportError> {
        self.check_path(object_path)?;
        Ok(self.fields.get(object_path).cloned().unwrap_or_default())
    }

    async fn list_tags(
        &self,
        _connection_id: &str,
        object_path: &str,
    ) -> Result<Vec<TagDescriptor>, TransportError> {
        self.check_path(object_path)?;
        Ok(self.tags.get(object_path).cloned().unwrap_or_default())
    }
}
