//! Status sink trait abstraction.

use async_trait::async_trait;
use testrig_core::{RunId, StatusRecord};
use tokio::sync::Mutex;
use std::collections::BTreeMap;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Persistent destination for status records.
///
/// Only an upsert-by-key contract is required; the layout behind it is up to
/// the implementation.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Create or replace the record stored under its run id.
    async fn upsert(&self, record: &StatusRecord) -> Result<()>;

    /// Load a record by run id.
    async fn load(&self, run_id: &RunId) -> Result<Option<StatusRecord>>;

    /// List all stored records.
    async fn list(&self) -> Result<Vec<StatusRecord>>;
}

/// In-memory sink, for monitors living in the same process and for tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<RunId, StatusRecord>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserts received.
    pub async fn writes(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl StatusSink for MemorySink {
    async fn upsert(&self, record: &StatusRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.run_id.clone(), record.clone());
        *self.writes.lock().await += 1;
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<StatusRecord>> {
        Ok(self.records.lock().await.get(run_id).cloned())
    }

    async fn list(&self) -> Result<Vec<StatusRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
