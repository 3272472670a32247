//! Source connectors
//!
//! One [`SourceConnector`] per [`SourceKind`]. A connector is a plain
//! executor: it loads the referenced query, runs it, and returns rows. It
//! never retries, and it releases its session on every exit path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EtlError, Result};
use crate::model::{QueryOutput, QueryRef, SourceKind};

pub mod crm;
pub mod fake;
pub mod normalize;
pub mod warehouse;

pub use crm::CrmConnector;
pub use fake::FakeConnector;
pub use warehouse::WarehouseConnector;

/// Executes a query against one kind of source system
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Run the referenced query
    ///
    /// Fails with `Connection` for reachability, authentication and timeout
    /// problems, and with `Query` when the source rejects the query itself.
    async fn execute(&self, query: &QueryRef) -> Result<QueryOutput>;
}

/// Connectors keyed by the source kind they serve
#[derive(Clone, Default)]
pub struct ConnectorSet {
    connectors: HashMap<SourceKind, Arc<dyn SourceConnector>>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its own kind, replacing any previous one
    pub fn with(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<dyn SourceConnector>> {
        self.connectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| EtlError::configuration(format!("no connector for source '{kind}'")))
    }

    pub fn contains(&self, kind: SourceKind) -> bool {
        self.connectors.contains_key(&kind)
    }
}

impl std::fmt::Debug for ConnectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<SourceKind> = self.connectors.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ConnectorSet").field("kinds", &kinds).finish()
    }
}
