use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use graph::Row;

use crate::policy::Policy;
use crate::request::{Identity, PrivacyRequest};
use crate::task::{ActionType, RequestTask};

use super::{ExecutionNode, NodeInput};

/// Failures and signals a connector can report.
///
/// `Connection`, `Auth` and `Other` are retried. The remaining variants
/// change the task's outcome without a retry.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Other(String),
    #[error("Paused: {0}")]
    Paused(String),
    #[error("Erasure must be requested manually: {0}")]
    ErasureNotificationRequired(String),
    #[error("Waiting for the connector to finish")]
    AwaitingCallback { polling: bool },
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Auth(_) | Self::Other(_))
    }
}

/// Result of asking a connector about an async task.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Complete {
        rows: Vec<Row>,
        rows_masked: Option<u64>,
    },
    Failed(String),
}

/// Renders the query a connector would run for a node.
pub trait QueryConfig {
    /// Query for `values` (typed input keyed by dotted path), or `None`
    /// if there is nothing to query with.
    fn generate_query(&self, values: &BTreeMap<String, Vec<Value>>, policy: &Policy)
        -> Option<String>;

    /// Query with placeholders instead of values, for display.
    fn dry_run_query(&self) -> Option<String>;
}

/// Everything the engine needs from a data store or service.
pub trait Connector: Send + Sync {
    /// Key that datasets use to name this connector.
    fn key(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn supports(&self, _action: ActionType) -> bool {
        true
    }

    fn test_connection(&self) -> Result<(), ConnectorError>;

    fn query_config(&self, node: &ExecutionNode) -> Box<dyn QueryConfig>;

    fn retrieve_data(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        request: &PrivacyRequest,
        input: &NodeInput,
    ) -> Result<Vec<Row>, ConnectorError>;

    /// Mask the matching fields of `rows`. Returns the number of rows updated.
    fn mask_data(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        request: &PrivacyRequest,
        rows: &[Row],
        input: &NodeInput,
    ) -> Result<u64, ConnectorError>;

    /// Send the request's consent preferences. Returns false if there was
    /// nothing to send for this identity.
    fn run_consent_request(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        request: &PrivacyRequest,
        identity: &Identity,
    ) -> Result<bool, ConnectorError>;

    /// Check on the async job `task` is waiting for. `input` is the input
    /// the job was started with.
    fn poll_status(
        &self,
        node: &ExecutionNode,
        policy: &Policy,
        request: &PrivacyRequest,
        task: &RequestTask,
        input: &NodeInput,
    ) -> Result<PollStatus, ConnectorError>;

    fn close(&self) {}
}

/// Connectors by key.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Add `connector`, replacing any connector with the same key.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        let key = connector.key().to_owned();
        if self.connectors.insert(key.clone(), connector).is_some() {
            log::warn!("Replacing connector {key}");
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.connectors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }

    pub fn close_all(&self) {
        for connector in self.connectors.values() {
            connector.close();
        }
    }
}
