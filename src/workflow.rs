/*!
Workflow lifecycle state machine and the in-memory workflow record.

The record is the single mutable view of a running workflow; the executor is
its only writer. Checkpoints carry a serialized form of the record (the
"snapshot"), so the serde shape here doubles as the persistence model: options
are omitted when absent, collections are kept when empty, and every timestamp
is an explicit UTC instant.
*/

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// Lifecycle states of a workflow.
///
/// Transitions follow a fixed table; everything else is rejected:
///
/// ```text
/// Queued  → Running, Cancelled
/// Running → Paused, Completed, Failed, Cancelled
/// Paused  → Running, Failed, Cancelled
/// Completed / Failed / Cancelled: terminal
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Wire-format string, as surfaced by the control surface.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Queued => "Queued",
            WorkflowState::Running => "Running",
            WorkflowState::Paused => "Paused",
            WorkflowState::Completed => "Completed",
            WorkflowState::Failed => "Failed",
            WorkflowState::Cancelled => "Cancelled",
        }
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match self {
            Queued => matches!(next, Running | Cancelled),
            Running => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Error, Diagnostic)]
#[error("invalid workflow state transition: {from} -> {to}")]
#[diagnostic(
    code(cairn::workflow::invalid_transition),
    help("Consult the transition table on WorkflowState.")
)]
pub struct TransitionError {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

/// Snapshot (de)serialization failures.
#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    #[error("workflow snapshot could not be serialized: {source}")]
    #[diagnostic(code(cairn::workflow::snapshot_encode))]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("workflow snapshot is not valid JSON: {source}")]
    #[diagnostic(
        code(cairn::workflow::snapshot_decode),
        help("The snapshot text must be the JSON object written by to_snapshot().")
    )]
    Decode {
        #[source]
        source: serde_json::Error,
    },
}

/// The in-memory record of one workflow.
///
/// Mutated only by the executor; everything the executor needs to continue a
/// run — including after a process restart — lives here, so serializing this
/// record is sufficient to produce a self-contained checkpoint snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub workflow_type: String,
    pub user_input: String,
    pub started_at: DateTime<Utc>,
    pub current_stage_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent_id: Option<String>,
    #[serde(default)]
    pub completed_agents: Vec<String>,
    #[serde(default)]
    pub stage_results: FxHashMap<String, String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl WorkflowRecord {
    /// Create a fresh record, seeding the message log with the user input.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        user_input: impl Into<String>,
    ) -> Self {
        let user_input = user_input.into();
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            user_input: user_input.clone(),
            started_at: Utc::now(),
            current_stage_index: 0,
            current_agent_id: None,
            completed_agents: Vec::new(),
            stage_results: FxHashMap::default(),
            messages: vec![Message::user(user_input)],
            paused_at: None,
            pause_reason: None,
            is_paused: false,
            metadata: FxHashMap::default(),
        }
    }

    /// Record a successful stage: append its messages (tagged with the agent
    /// id), store the textual output, and advance the completed list.
    pub fn record_stage_success(
        &mut self,
        agent_id: &str,
        messages: Vec<Message>,
        output: String,
    ) {
        for message in messages {
            self.messages.push(message.with_agent(agent_id));
        }
        self.stage_results.insert(agent_id.to_string(), output);
        if !self.completed_agents.iter().any(|a| a == agent_id) {
            self.completed_agents.push(agent_id.to_string());
        }
        self.current_stage_index = self.completed_agents.len();
    }

    /// Mark the record paused with the given reason.
    pub fn mark_paused(&mut self, reason: impl Into<String>) {
        self.is_paused = true;
        self.pause_reason = Some(reason.into());
        self.paused_at = Some(Utc::now());
    }

    /// Clear pause bookkeeping when execution continues.
    pub fn clear_paused(&mut self) {
        self.is_paused = false;
        self.pause_reason = None;
        self.paused_at = None;
    }

    /// Serialize into the snapshot text a checkpoint carries.
    pub fn to_snapshot(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(|source| SnapshotError::Encode { source })
    }

    /// Restore a record from checkpoint snapshot text.
    pub fn from_snapshot(text: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(text).map_err(|source| SnapshotError::Decode { source })
    }
}
