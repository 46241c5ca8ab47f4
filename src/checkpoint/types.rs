use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version written into new checkpoints.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Descriptive metadata attached to a checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// True for checkpoints the engine wrote on its own (stage boundaries,
    /// periodic snapshots) as opposed to user-requested ones.
    #[serde(default)]
    pub automated: bool,
    /// Why the checkpoint exists: `before-<agent>`, `after-<agent>`,
    /// `pause:<why>`, `error-recovery:<message>`, `workflow-complete`, …
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub context: FxHashMap<String, Value>,
    /// Agents completed at the time the checkpoint was taken.
    #[serde(default)]
    pub completed_agents: Vec<String>,
}

impl CheckpointMetadata {
    #[must_use]
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn automated(mut self) -> Self {
        self.automated = true;
        self
    }

    #[must_use]
    pub fn with_completed_agents(mut self, completed_agents: Vec<String>) -> Self {
        self.completed_agents = completed_agents;
        self
    }
}

/// A persisted snapshot of workflow progress at a stage boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    /// The stage that was about to run or had just completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub stage_index: usize,
    /// Serialized workflow record; self-contained for resume.
    pub state_snapshot: String,
    pub schema_version: u32,
    /// UTF-8 byte length of `state_snapshot`.
    pub state_size_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub metadata: CheckpointMetadata,
}

/// Aggregate store statistics, recomputable by scanning.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CheckpointStatistics {
    pub total_count: usize,
    pub average_size_bytes: f64,
    pub largest_size_bytes: usize,
    pub total_bytes: u64,
    pub created_last_24h: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_created_at: Option<DateTime<Utc>>,
}

impl CheckpointStatistics {
    /// Compute statistics over a scan of checkpoints.
    #[must_use]
    pub fn from_scan(checkpoints: &[Checkpoint]) -> Self {
        if checkpoints.is_empty() {
            return Self::default();
        }
        let total_count = checkpoints.len();
        let total_bytes: u64 = checkpoints.iter().map(|c| c.state_size_bytes as u64).sum();
        let largest_size_bytes = checkpoints
            .iter()
            .map(|c| c.state_size_bytes)
            .max()
            .unwrap_or(0);
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let created_last_24h = checkpoints.iter().filter(|c| c.created_at > cutoff).count();
        let oldest_created_at = checkpoints.iter().map(|c| c.created_at).min();
        let newest_created_at = checkpoints.iter().map(|c| c.created_at).max();
        Self {
            total_count,
            average_size_bytes: total_bytes as f64 / total_count as f64,
            largest_size_bytes,
            total_bytes,
            created_last_24h,
            oldest_created_at,
            newest_created_at,
        }
    }
}

/// Result of validating one checkpoint. Validation never mutates state.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub checkpoint_id: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub validation_messages: Vec<String>,
}
