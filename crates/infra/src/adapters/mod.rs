//! Narrow interfaces to external collaborators.
//!
//! The core only ever talks to object storage, the vector store and the LLM
//! through these traits. In-memory implementations back tests and dev setups.

pub mod llm;
pub mod object_store;
pub mod vector_store;

pub use llm::LlmClient;
pub use object_store::{InMemoryObjectStore, ObjectCategory, ObjectStore};
pub use vector_store::{InMemoryVectorStore, VectorMatch, VectorRecord, VectorStore};

use courseforge_core::CoreError;

/// Error returned by an external adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The target does not exist. Compensation treats this as success.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    /// Upstream 5xx / connection failure.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The request itself was refused (4xx other than not-found).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl AdapterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }
}

impl From<AdapterError> for CoreError {
    fn from(value: AdapterError) -> Self {
        match value {
            AdapterError::NotFound(_) => CoreError::NotFound,
            AdapterError::Timeout(msg) | AdapterError::Unavailable(msg) => CoreError::Transient(msg),
            AdapterError::Rejected(msg) => CoreError::Fatal(msg),
        }
    }
}

/// Ordered record of adapter calls, used by the in-memory adapters so tests
/// can assert on call order across adapters.
pub type CallLog = std::sync::Arc<std::sync::Mutex<Vec<String>>>;

pub(crate) fn record_call(log: &CallLog, entry: String) {
    if let Ok(mut calls) = log.lock() {
        calls.push(entry);
    }
}
