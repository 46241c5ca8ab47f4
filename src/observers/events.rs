use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowState;

/// A workflow crossed from one lifecycle state to another.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateEvent {
    pub workflow_id: String,
    pub workflow_type: String,
    pub previous: WorkflowState,
    pub next: WorkflowState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form context; the controller records `elapsed_seconds` on
    /// transitions out of Running and `paused_for_seconds` on resume.
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl WorkflowStateEvent {
    #[must_use]
    pub fn elapsed_seconds(&self) -> Option<f64> {
        self.metadata.get("elapsed_seconds").and_then(Value::as_f64)
    }

    #[must_use]
    pub fn paused_for_seconds(&self) -> Option<f64> {
        self.metadata
            .get("paused_for_seconds")
            .and_then(Value::as_f64)
    }
}

/// What happened to a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointEventKind {
    Created,
    Loaded,
    Deleted,
    Validated,
    Failed,
}

/// A checkpoint-level event emitted by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub kind: CheckpointEventKind,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<bool>,
}

impl CheckpointEvent {
    #[must_use]
    pub fn new(
        checkpoint_id: impl Into<String>,
        workflow_id: impl Into<String>,
        kind: CheckpointEventKind,
    ) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            workflow_id: workflow_id.into(),
            kind,
            at: Utc::now(),
            size_bytes: None,
            reason: None,
            latency_ms: None,
            workflow_type: None,
            automated: None,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size_bytes: usize) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    #[must_use]
    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    #[must_use]
    pub fn with_automated(mut self, automated: bool) -> Self {
        self.automated = Some(automated);
        self
    }
}
