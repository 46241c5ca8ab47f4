/*!
Storage back-end contract and the in-memory implementation.

A back-end is a dumb keyed store: it persists checkpoints by id and scans
them back. Policy — size caps, retention, fallback, validation — lives in the
store, so back-ends stay interchangeable.
*/

use std::sync::Mutex;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::types::Checkpoint;

/// Failures a back-end can report.
#[derive(Debug, Error, Diagnostic)]
pub enum BackendError {
    #[error("storage I/O failed: {source}")]
    #[diagnostic(code(cairn::checkpoint::backend_io))]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("stored checkpoint {checkpoint_id} is not valid JSON: {source}")]
    #[diagnostic(
        code(cairn::checkpoint::backend_decode),
        help("The on-disk bytes were corrupted or written by something else.")
    )]
    Decode {
        checkpoint_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage backend unavailable: {message}")]
    #[diagnostic(code(cairn::checkpoint::backend_unavailable))]
    Unavailable { message: String },
}

impl From<std::io::Error> for BackendError {
    fn from(source: std::io::Error) -> Self {
        BackendError::Io { source }
    }
}

/// Keyed checkpoint storage.
///
/// Implementations must be safe for concurrent use; writers of distinct ids
/// never conflict.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist a checkpoint under its id, replacing any previous value.
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), BackendError>;

    /// Fetch a checkpoint by id; absence is not an error.
    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, BackendError>;

    /// Remove a checkpoint. Returns whether anything was removed.
    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError>;

    /// Scan every stored checkpoint.
    async fn list(&self) -> Result<Vec<Checkpoint>, BackendError>;

    /// Short name for log lines.
    fn name(&self) -> &'static str;
}

/// In-process keyed store.
///
/// Serves two roles: the default primary in `primary-with-file-fallback`
/// mode (the in-process stand-in for the shared networked store) and a fast
/// backend for tests.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<FxHashMap<String, Checkpoint>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("memory backend poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), BackendError> {
        self.entries
            .lock()
            .expect("memory backend poisoned")
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, BackendError> {
        Ok(self
            .entries
            .lock()
            .expect("memory backend poisoned")
            .get(checkpoint_id)
            .cloned())
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, BackendError> {
        Ok(self
            .entries
            .lock()
            .expect("memory backend poisoned")
            .remove(checkpoint_id)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, BackendError> {
        Ok(self
            .entries
            .lock()
            .expect("memory backend poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::types::{CheckpointMetadata, SNAPSHOT_SCHEMA_VERSION};
    use chrono::Utc;

    fn checkpoint(id: &str) -> Checkpoint {
        Checkpoint {
            checkpoint_id: id.to_string(),
            workflow_id: "wf_t".to_string(),
            workflow_type: "research".to_string(),
            created_at: Utc::now(),
            agent_id: Some("Clarify".to_string()),
            stage_index: 0,
            state_snapshot: "{}".to_string(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            state_size_bytes: 2,
            label: None,
            metadata: CheckpointMetadata::with_reason("before-Clarify"),
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let backend = MemoryBackend::new();
        backend.put(&checkpoint("ckpt_a")).await.unwrap();
        assert!(backend.get("ckpt_a").await.unwrap().is_some());
        assert!(backend.get("ckpt_b").await.unwrap().is_none());
        assert!(backend.delete("ckpt_a").await.unwrap());
        assert!(!backend.delete("ckpt_a").await.unwrap());
    }

    #[tokio::test]
    async fn list_scans_everything() {
        let backend = MemoryBackend::new();
        backend.put(&checkpoint("ckpt_a")).await.unwrap();
        backend.put(&checkpoint("ckpt_b")).await.unwrap();
        assert_eq!(backend.list().await.unwrap().len(), 2);
    }
}
