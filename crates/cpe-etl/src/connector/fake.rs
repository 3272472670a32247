//! Deterministic connector for dry runs and tests

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use super::SourceConnector;
use crate::error::{EtlError, Result};
use crate::model::{QueryOutput, QueryRef, SourceKind};

/// Rows returned for a query with no configured response
pub const MOCK_ROW_COUNT: usize = 5;

#[derive(Debug, Clone)]
enum Response {
    Rows(QueryOutput),
    ConnectionFailure(String),
    QueryFailure(String),
}

/// Connector that answers from a fixed table of responses
///
/// Responses are keyed by the query reference. Unconfigured queries get
/// [`MOCK_ROW_COUNT`] mock rows.
#[derive(Debug)]
pub struct FakeConnector {
    kind: SourceKind,
    responses: HashMap<String, Response>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            responses: HashMap::new(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_output(mut self, query: &QueryRef, output: QueryOutput) -> Self {
        self.responses
            .insert(query.display_name(), Response::Rows(output));
        self
    }

    /// Respond with `count` generated rows
    pub fn with_rows(self, query: &QueryRef, count: usize) -> Self {
        self.with_output(query, generated_rows(count))
    }

    pub fn with_connection_failure(mut self, query: &QueryRef, msg: impl Into<String>) -> Self {
        self.responses
            .insert(query.display_name(), Response::ConnectionFailure(msg.into()));
        self
    }

    pub fn with_query_failure(mut self, query: &QueryRef, msg: impl Into<String>) -> Self {
        self.responses
            .insert(query.display_name(), Response::QueryFailure(msg.into()));
        self
    }

    /// Sleep before answering every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queries executed so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl SourceConnector for FakeConnector {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn execute(&self, query: &QueryRef) -> Result<QueryOutput> {
        let key = query.display_name();
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(key.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.responses.get(&key) {
            Some(Response::Rows(output)) => Ok(output.clone()),
            Some(Response::ConnectionFailure(msg)) => Err(EtlError::connection(msg.clone())),
            Some(Response::QueryFailure(msg)) => Err(EtlError::query(msg.clone())),
            None => {
                info!("MANUAL MODE: returning {} mock rows for {}", MOCK_ROW_COUNT, key);
                Ok(generated_rows(MOCK_ROW_COUNT))
            },
        }
    }
}

/// Rows shaped like a small CRM extract
pub fn generated_rows(count: usize) -> QueryOutput {
    QueryOutput::new(
        vec!["Id".to_string(), "Name".to_string(), "CreatedDate".to_string()],
        (0..count)
            .map(|i| {
                vec![
                    json!(format!("mock-{:06}", i + 1)),
                    json!(format!("Mock record {}", i + 1)),
                    json!("2024-01-01 00:00:00"),
                ]
            })
            .collect(),
    )
}
