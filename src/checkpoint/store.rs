/*!
The checkpoint store front door.

All checkpoint policy is enforced here: the snapshot size cap, id uniqueness,
strictly increasing per-workflow creation times, retention trimming, the
primary→file fallback, validation, and statistics. Back-ends below this layer
only persist and scan records.
*/

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::warn;

use super::backend::{BackendError, MemoryBackend, StorageBackend};
use super::file::FileBackend;
use super::types::{
    Checkpoint, CheckpointMetadata, CheckpointStatistics, ValidationReport,
    SNAPSHOT_SCHEMA_VERSION,
};
use crate::config::{EngineConfig, StorageBackendKind};
use crate::observers::{CheckpointEvent, CheckpointEventKind, Subject};
use crate::utils::ids;

/// Errors surfaced by store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("checkpoint snapshot is {actual} bytes, over the {limit} byte cap")]
    #[diagnostic(
        code(cairn::checkpoint::size_exceeded),
        help("Raise max_checkpoint_size_bytes or trim the workflow state.")
    )]
    SizeExceeded { actual: usize, limit: usize },

    #[error("all storage backends failed to persist checkpoint: {message}")]
    #[diagnostic(code(cairn::checkpoint::storage))]
    Storage { message: String },

    #[error("checkpoint {checkpoint_id} could not be decoded: {message}")]
    #[diagnostic(code(cairn::checkpoint::serialization))]
    Serialization {
        checkpoint_id: String,
        message: String,
    },
}

/// Durable, content-safe persistence of checkpoints.
pub struct CheckpointStore {
    primary: Option<Arc<dyn StorageBackend>>,
    fallback: Arc<dyn StorageBackend>,
    max_size_bytes: usize,
    retention: usize,
    events: Option<Arc<Subject<CheckpointEvent>>>,
    // Per-workflow high-water mark so created_at strictly increases even when
    // two saves land inside one clock tick.
    last_created: Mutex<FxHashMap<String, DateTime<Utc>>>,
}

impl CheckpointStore {
    /// Build the store arrangement described by the configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let file = Arc::new(FileBackend::new(
            config.local_storage_directory.clone(),
            config.compress_snapshots,
            config.max_inflight_checkpoint_writes,
        ));
        let primary: Option<Arc<dyn StorageBackend>> = match config.storage_backend {
            StorageBackendKind::File => None,
            StorageBackendKind::PrimaryWithFileFallback => Some(Arc::new(MemoryBackend::new())),
        };
        Self::with_backends(
            primary,
            file,
            config.max_checkpoint_size_bytes,
            config.max_checkpoints_per_workflow,
        )
    }

    /// Build from explicit backends (used by tests to inject failures).
    #[must_use]
    pub fn with_backends(
        primary: Option<Arc<dyn StorageBackend>>,
        fallback: Arc<dyn StorageBackend>,
        max_size_bytes: usize,
        retention: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            max_size_bytes,
            retention,
            events: None,
            last_created: Mutex::new(FxHashMap::default()),
        }
    }

    /// Attach the checkpoint-event subject notified by store operations.
    #[must_use]
    pub fn with_events(mut self, events: Arc<Subject<CheckpointEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: CheckpointEvent) {
        if let Some(events) = &self.events {
            events.notify(&event).await;
        }
    }

    fn next_created_at(&self, workflow_id: &str) -> DateTime<Utc> {
        let mut now = Utc::now();
        let mut last = self.last_created.lock().expect("store clock poisoned");
        if let Some(previous) = last.get(workflow_id) {
            if now <= *previous {
                now = *previous + chrono::Duration::milliseconds(1);
            }
        }
        last.insert(workflow_id.to_string(), now);
        now
    }

    // Collision detection is best-effort per readable backend: an unreachable
    // backend cannot occupy an id.
    async fn id_in_use(&self, checkpoint_id: &str) -> bool {
        if let Some(primary) = &self.primary {
            if matches!(primary.get(checkpoint_id).await, Ok(Some(_))) {
                return true;
            }
        }
        matches!(self.fallback.get(checkpoint_id).await, Ok(Some(_)))
    }

    async fn fresh_id(&self) -> String {
        loop {
            let candidate = ids::new_checkpoint_id();
            if !self.id_in_use(&candidate).await {
                return candidate;
            }
            warn!(checkpoint_id = %candidate, "checkpoint id collision, regenerating");
        }
    }

    /// Persist a new checkpoint.
    ///
    /// On primary failure the write falls back to the file back-end with a
    /// warning; only when every configured back-end fails does this return
    /// [`StoreError::Storage`].
    pub async fn save(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        agent_id: Option<&str>,
        stage_index: usize,
        snapshot: &str,
        metadata: CheckpointMetadata,
    ) -> Result<Checkpoint, StoreError> {
        let size = snapshot.len();
        if size > self.max_size_bytes {
            return Err(StoreError::SizeExceeded {
                actual: size,
                limit: self.max_size_bytes,
            });
        }

        let checkpoint = Checkpoint {
            checkpoint_id: self.fresh_id().await,
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            created_at: self.next_created_at(workflow_id),
            agent_id: agent_id.map(str::to_string),
            stage_index,
            state_snapshot: snapshot.to_string(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            state_size_bytes: size,
            label: None,
            metadata,
        };

        let started = Instant::now();
        self.write(&checkpoint).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        self.enforce_retention(workflow_id).await;

        self.emit(
            CheckpointEvent::new(
                &checkpoint.checkpoint_id,
                workflow_id,
                CheckpointEventKind::Created,
            )
            .with_size(size)
            .with_reason(&checkpoint.metadata.reason)
            .with_latency(latency_ms)
            .with_workflow_type(workflow_type)
            .with_automated(checkpoint.metadata.automated),
        )
        .await;

        Ok(checkpoint)
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let Some(primary) = &self.primary else {
            return self.fallback.put(checkpoint).await.map_err(|error| {
                StoreError::Storage {
                    message: format!("{}: {error}", self.fallback.name()),
                }
            });
        };

        match primary.put(checkpoint).await {
            Ok(()) => Ok(()),
            Err(primary_error) => {
                warn!(
                    checkpoint_id = %checkpoint.checkpoint_id,
                    backend = primary.name(),
                    error = %primary_error,
                    "primary backend failed, falling back to file"
                );
                self.fallback
                    .put(checkpoint)
                    .await
                    .map_err(|fallback_error| StoreError::Storage {
                        message: format!(
                            "{}: {primary_error}; {}: {fallback_error}",
                            primary.name(),
                            self.fallback.name()
                        ),
                    })
            }
        }
    }

    async fn enforce_retention(&self, workflow_id: &str) {
        if self.retention == 0 {
            return;
        }
        let listed = match self.list_for_workflow(workflow_id).await {
            Ok(listed) => listed,
            Err(error) => {
                warn!(workflow_id = %workflow_id, error = %error, "retention scan failed");
                return;
            }
        };
        if listed.len() <= self.retention {
            return;
        }
        // Newest-first ordering: everything past the cap is oldest.
        for stale in &listed[self.retention..] {
            if let Err(error) = self.delete(&stale.checkpoint_id).await {
                warn!(
                    checkpoint_id = %stale.checkpoint_id,
                    error = %error,
                    "retention delete failed"
                );
            }
        }
    }

    /// Fetch a checkpoint by id; `Ok(None)` when absent.
    pub async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let started = Instant::now();
        let loaded = self.read(checkpoint_id).await;
        match &loaded {
            Ok(Some(checkpoint)) => {
                self.emit(
                    CheckpointEvent::new(checkpoint_id, &checkpoint.workflow_id, CheckpointEventKind::Loaded)
                        .with_size(checkpoint.state_size_bytes)
                        .with_latency(started.elapsed().as_millis() as u64)
                        .with_workflow_type(&checkpoint.workflow_type)
                        .with_automated(checkpoint.metadata.automated),
                )
                .await;
            }
            Err(error) => {
                self.emit(
                    CheckpointEvent::new(checkpoint_id, "", CheckpointEventKind::Failed)
                        .with_reason(error.to_string()),
                )
                .await;
            }
            Ok(None) => {}
        }
        loaded
    }

    async fn read(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.get(checkpoint_id).await {
                Ok(Some(checkpoint)) => return Ok(Some(checkpoint)),
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        checkpoint_id = %checkpoint_id,
                        backend = primary.name(),
                        error = %error,
                        "primary backend read failed, trying fallback"
                    );
                }
            }
        }
        match self.fallback.get(checkpoint_id).await {
            Ok(found) => Ok(found),
            Err(BackendError::Decode { checkpoint_id, source }) => {
                Err(StoreError::Serialization {
                    checkpoint_id,
                    message: format!("stored bytes are not valid JSON: {source}"),
                })
            }
            Err(error) => Err(StoreError::Storage {
                message: format!("{}: {error}", self.fallback.name()),
            }),
        }
    }

    /// All checkpoints of one workflow, newest first.
    pub async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let mut merged: FxHashMap<String, Checkpoint> = FxHashMap::default();
        let mut failures = Vec::new();

        match self.fallback.list().await {
            Ok(listed) => {
                for checkpoint in listed {
                    merged.insert(checkpoint.checkpoint_id.clone(), checkpoint);
                }
            }
            Err(error) => failures.push(format!("{}: {error}", self.fallback.name())),
        }
        if let Some(primary) = &self.primary {
            match primary.list().await {
                Ok(listed) => {
                    for checkpoint in listed {
                        merged.insert(checkpoint.checkpoint_id.clone(), checkpoint);
                    }
                }
                Err(error) => failures.push(format!("{}: {error}", primary.name())),
            }
        }

        let backend_count = 1 + usize::from(self.primary.is_some());
        if failures.len() == backend_count {
            return Err(StoreError::Storage {
                message: failures.join("; "),
            });
        }

        let mut listed: Vec<Checkpoint> = merged
            .into_values()
            .filter(|c| c.workflow_id == workflow_id)
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listed)
    }

    /// Newest checkpoint of one workflow.
    pub async fn get_latest(&self, workflow_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.list_for_workflow(workflow_id).await?.into_iter().next())
    }

    /// Delete one checkpoint. Idempotent; absence is not an error.
    pub async fn delete(&self, checkpoint_id: &str) -> Result<bool, StoreError> {
        // Best-effort peek so the Deleted event can carry size and type.
        let existing = self.read(checkpoint_id).await.ok().flatten();

        let mut removed = false;
        if let Some(primary) = &self.primary {
            match primary.delete(checkpoint_id).await {
                Ok(done) => removed |= done,
                Err(error) => warn!(
                    checkpoint_id = %checkpoint_id,
                    backend = primary.name(),
                    error = %error,
                    "primary delete failed"
                ),
            }
        }
        match self.fallback.delete(checkpoint_id).await {
            Ok(done) => removed |= done,
            Err(error) => warn!(
                checkpoint_id = %checkpoint_id,
                backend = self.fallback.name(),
                error = %error,
                "fallback delete failed"
            ),
        }

        if removed {
            let mut event = CheckpointEvent::new(
                checkpoint_id,
                existing
                    .as_ref()
                    .map(|c| c.workflow_id.clone())
                    .unwrap_or_default(),
                CheckpointEventKind::Deleted,
            );
            if let Some(checkpoint) = &existing {
                event = event
                    .with_size(checkpoint.state_size_bytes)
                    .with_workflow_type(&checkpoint.workflow_type)
                    .with_automated(checkpoint.metadata.automated);
            }
            self.emit(event).await;
        }
        Ok(removed)
    }

    /// Delete every checkpoint of one workflow; returns the ids removed.
    pub async fn delete_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let listed = self.list_for_workflow(workflow_id).await?;
        let mut deleted = Vec::new();
        for checkpoint in listed {
            if self.delete(&checkpoint.checkpoint_id).await? {
                deleted.push(checkpoint.checkpoint_id);
            }
        }
        Ok(deleted)
    }

    /// Aggregate statistics over every stored checkpoint.
    pub async fn statistics(&self) -> Result<CheckpointStatistics, StoreError> {
        let mut merged: FxHashMap<String, Checkpoint> = FxHashMap::default();
        if let Ok(listed) = self.fallback.list().await {
            for checkpoint in listed {
                merged.insert(checkpoint.checkpoint_id.clone(), checkpoint);
            }
        }
        if let Some(primary) = &self.primary {
            if let Ok(listed) = primary.list().await {
                for checkpoint in listed {
                    merged.insert(checkpoint.checkpoint_id.clone(), checkpoint);
                }
            }
        }
        let scan: Vec<Checkpoint> = merged.into_values().collect();
        Ok(CheckpointStatistics::from_scan(&scan))
    }

    /// Check that a checkpoint exists and its snapshot parses. Never mutates
    /// stored state.
    pub async fn validate(&self, checkpoint_id: &str) -> ValidationReport {
        let mut report = ValidationReport {
            checkpoint_id: checkpoint_id.to_string(),
            is_valid: false,
            error_message: None,
            validation_messages: Vec::new(),
        };

        let checkpoint = match self.read(checkpoint_id).await {
            Err(StoreError::Serialization { message, .. }) => {
                report.error_message =
                    Some(format!("checkpoint {checkpoint_id} is not valid JSON: {message}"));
                self.emit(
                    CheckpointEvent::new(checkpoint_id, "", CheckpointEventKind::Failed)
                        .with_reason(report.error_message.clone().unwrap_or_default()),
                )
                .await;
                return report;
            }
            Err(error) => {
                report.error_message = Some(error.to_string());
                self.emit(
                    CheckpointEvent::new(checkpoint_id, "", CheckpointEventKind::Failed)
                        .with_reason(error.to_string()),
                )
                .await;
                return report;
            }
            Ok(None) => {
                report.error_message = Some(format!("checkpoint {checkpoint_id} not found"));
                self.emit(
                    CheckpointEvent::new(checkpoint_id, "", CheckpointEventKind::Failed)
                        .with_reason("checkpoint not found"),
                )
                .await;
                return report;
            }
            Ok(Some(checkpoint)) => checkpoint,
        };

        report
            .validation_messages
            .push("checkpoint record loaded".to_string());

        if checkpoint.state_snapshot.is_empty() {
            report.error_message = Some("state snapshot is empty".to_string());
        } else if let Err(error) =
            serde_json::from_str::<serde_json::Value>(&checkpoint.state_snapshot)
        {
            report.error_message = Some(format!("state snapshot is not valid JSON: {error}"));
        } else {
            report
                .validation_messages
                .push("state snapshot parses as JSON".to_string());
            if checkpoint.state_size_bytes != checkpoint.state_snapshot.len() {
                report.validation_messages.push(format!(
                    "recorded size {} differs from snapshot length {}",
                    checkpoint.state_size_bytes,
                    checkpoint.state_snapshot.len()
                ));
            }
            if checkpoint.schema_version != SNAPSHOT_SCHEMA_VERSION {
                report
                    .validation_messages
                    .push(format!("schema version {}", checkpoint.schema_version));
            }
            report.is_valid = true;
        }

        let event = if report.is_valid {
            CheckpointEvent::new(
                checkpoint_id,
                &checkpoint.workflow_id,
                CheckpointEventKind::Validated,
            )
            .with_size(checkpoint.state_size_bytes)
            .with_workflow_type(&checkpoint.workflow_type)
            .with_automated(checkpoint.metadata.automated)
        } else {
            CheckpointEvent::new(
                checkpoint_id,
                &checkpoint.workflow_id,
                CheckpointEventKind::Failed,
            )
            .with_reason(report.error_message.clone().unwrap_or_default())
            .with_workflow_type(&checkpoint.workflow_type)
        };
        self.emit(event).await;

        report
    }
}
