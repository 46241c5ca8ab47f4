/*!
Pause/resume controller: the global registry of per-workflow signals,
execution states, and cancellation tokens, and the sole arbiter of state
transitions.

All three maps live behind one mutex so every caller sees a consistent view;
the lock is held only across field mutations. Observer notification happens
after the lock is released, so a slow sink can never stall a boundary poll.
*/

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::checkpoint::Checkpoint;
use crate::observers::{Subject, WorkflowStateEvent};
use crate::workflow::{TransitionError, WorkflowState};

/// Per-workflow pause/cancel request flags.
///
/// Set by external callers; cleared only when the executor acts on them.
#[derive(Clone, Debug, Default)]
pub struct PauseResumeSignal {
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Live view of one workflow's execution.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub workflow_type: String,
    pub state: WorkflowState,
    pub current_agent_id: Option<String>,
    pub current_stage_index: usize,
    pub completed_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub latest_checkpoint_id: Option<String>,
}

impl ExecutionState {
    fn new(workflow_id: &str, workflow_type: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            state: WorkflowState::Queued,
            current_agent_id: None,
            current_stage_index: 0,
            completed_agents: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            latest_checkpoint_id: None,
        }
    }

    /// Wall-clock seconds since the workflow started running.
    #[must_use]
    pub fn elapsed_seconds(&self) -> Option<f64> {
        self.started_at
            .map(|started| (Utc::now() - started).num_milliseconds() as f64 / 1_000.0)
    }
}

#[derive(Default)]
struct ControllerInner {
    signals: FxHashMap<String, PauseResumeSignal>,
    executions: FxHashMap<String, ExecutionState>,
    tokens: FxHashMap<String, CancelToken>,
}

/// Registry and state-transition arbiter for every live workflow.
pub struct WorkflowController {
    inner: Mutex<ControllerInner>,
    state_events: Arc<Subject<WorkflowStateEvent>>,
}

impl Default for WorkflowController {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ControllerInner::default()),
            state_events: Arc::new(Subject::new("workflow-state")),
        }
    }

    /// The subject carrying workflow-state transition events.
    #[must_use]
    pub fn state_events(&self) -> Arc<Subject<WorkflowStateEvent>> {
        Arc::clone(&self.state_events)
    }

    /// Track a new workflow in the Queued state. Idempotent: re-registering a
    /// known workflow leaves its state untouched.
    pub fn register(&self, workflow_id: &str, workflow_type: &str) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        inner
            .executions
            .entry(workflow_id.to_string())
            .or_insert_with(|| ExecutionState::new(workflow_id, workflow_type));
        inner.signals.entry(workflow_id.to_string()).or_default();
        inner.tokens.entry(workflow_id.to_string()).or_default();
    }

    /// Re-track a workflow restored from a checkpoint, in the Paused state.
    /// Used when resume happens in a process that never ran the workflow.
    pub fn register_paused(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        started_at: DateTime<Utc>,
        paused_at: Option<DateTime<Utc>>,
        checkpoint: &Checkpoint,
    ) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        let entry = inner
            .executions
            .entry(workflow_id.to_string())
            .or_insert_with(|| ExecutionState::new(workflow_id, workflow_type));
        if !entry.state.is_terminal() {
            entry.state = WorkflowState::Paused;
            entry.started_at = Some(started_at);
            entry.paused_at = paused_at.or(Some(checkpoint.created_at));
            entry.current_stage_index = checkpoint.stage_index;
            entry.current_agent_id = checkpoint.agent_id.clone();
            entry.completed_agents = checkpoint.metadata.completed_agents.clone();
            entry.latest_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
        }
        inner.signals.entry(workflow_id.to_string()).or_default();
        inner.tokens.entry(workflow_id.to_string()).or_default();
    }

    /// Flag a workflow for pause at its next stage boundary. Idempotent.
    /// Returns false when the workflow is unknown.
    pub fn request_pause(&self, workflow_id: &str, reason: Option<String>) -> bool {
        let mut inner = self.inner.lock().expect("controller poisoned");
        if !inner.executions.contains_key(workflow_id) {
            return false;
        }
        let signal = inner.signals.entry(workflow_id.to_string()).or_default();
        signal.pause_requested = true;
        signal.updated_at = Some(Utc::now());
        if reason.is_some() {
            signal.reason = reason;
        }
        true
    }

    /// Flag a workflow for cancellation and fire its token. Idempotent.
    pub fn request_cancel(&self, workflow_id: &str) -> bool {
        let token = {
            let mut inner = self.inner.lock().expect("controller poisoned");
            if !inner.executions.contains_key(workflow_id) {
                return false;
            }
            let signal = inner.signals.entry(workflow_id.to_string()).or_default();
            signal.cancel_requested = true;
            signal.updated_at = Some(Utc::now());
            inner
                .tokens
                .entry(workflow_id.to_string())
                .or_default()
                .clone()
        };
        token.cancel();
        true
    }

    /// Current signal for a workflow; empty when unknown.
    #[must_use]
    pub fn signal(&self, workflow_id: &str) -> PauseResumeSignal {
        self.inner
            .lock()
            .expect("controller poisoned")
            .signals
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Clear a pending pause request, returning its reason. Called by the
    /// executor when the pause takes effect.
    pub fn acknowledge_pause(&self, workflow_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("controller poisoned");
        let signal = inner.signals.get_mut(workflow_id)?;
        if !signal.pause_requested {
            return None;
        }
        signal.pause_requested = false;
        signal.updated_at = Some(Utc::now());
        signal.reason.take()
    }

    /// The cancellation token for a workflow, created lazily. Repeated calls
    /// return the same token.
    #[must_use]
    pub fn token(&self, workflow_id: &str) -> CancelToken {
        self.inner
            .lock()
            .expect("controller poisoned")
            .tokens
            .entry(workflow_id.to_string())
            .or_default()
            .clone()
    }

    /// Record the latest checkpoint on the execution state.
    pub fn on_checkpoint_saved(&self, workflow_id: &str, checkpoint: &Checkpoint) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        if let Some(execution) = inner.executions.get_mut(workflow_id) {
            execution.latest_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
        }
    }

    /// Transition a resumed workflow back to Running, clearing paused-at.
    pub async fn on_workflow_resumed(&self, workflow_id: &str, checkpoint: &Checkpoint) {
        {
            let mut inner = self.inner.lock().expect("controller poisoned");
            if let Some(execution) = inner.executions.get_mut(workflow_id) {
                execution.latest_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
                execution.completed_agents = checkpoint.metadata.completed_agents.clone();
                execution.current_stage_index = checkpoint.stage_index;
            }
        }
        if let Err(error) = self
            .transition(workflow_id, WorkflowState::Running, Some("resumed"))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %error, "resume transition rejected");
        }
    }

    /// Update the live progress fields on the execution state.
    pub fn update_progress(
        &self,
        workflow_id: &str,
        current_agent_id: Option<String>,
        current_stage_index: usize,
        completed_agents: Vec<String>,
    ) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        if let Some(execution) = inner.executions.get_mut(workflow_id) {
            execution.current_agent_id = current_agent_id;
            execution.current_stage_index = current_stage_index;
            execution.completed_agents = completed_agents;
        }
    }

    /// Apply a state transition, enforcing the legal-transition table.
    ///
    /// Illegal transitions are logged and rejected without mutating anything.
    /// Observers are notified after the controller lock is released.
    pub async fn transition(
        &self,
        workflow_id: &str,
        next: WorkflowState,
        reason: Option<&str>,
    ) -> Result<WorkflowState, TransitionError> {
        let event = {
            let mut inner = self.inner.lock().expect("controller poisoned");
            let execution = inner
                .executions
                .entry(workflow_id.to_string())
                .or_insert_with(|| ExecutionState::new(workflow_id, ""));
            let previous = execution.state;
            if !previous.can_transition_to(next) {
                warn!(
                    workflow_id = %workflow_id,
                    from = %previous,
                    to = %next,
                    "invalid workflow state transition rejected"
                );
                return Err(TransitionError {
                    from: previous,
                    to: next,
                });
            }

            let now = Utc::now();
            let mut metadata = FxHashMap::default();
            if previous == WorkflowState::Paused && next == WorkflowState::Running {
                if let Some(paused_at) = execution.paused_at {
                    let paused_for = (now - paused_at).num_milliseconds() as f64 / 1_000.0;
                    metadata.insert("paused_for_seconds".to_string(), json!(paused_for));
                }
            }
            execution.state = next;
            match next {
                WorkflowState::Running => {
                    if execution.started_at.is_none() {
                        execution.started_at = Some(now);
                    }
                    execution.paused_at = None;
                }
                WorkflowState::Paused => {
                    execution.paused_at = Some(now);
                }
                _ => {}
            }
            if let Some(started) = execution.started_at {
                let elapsed = (now - started).num_milliseconds() as f64 / 1_000.0;
                metadata.insert("elapsed_seconds".to_string(), json!(elapsed));
            }

            WorkflowStateEvent {
                workflow_id: workflow_id.to_string(),
                workflow_type: execution.workflow_type.clone(),
                previous,
                next,
                at: now,
                reason: reason.map(str::to_string),
                metadata,
            }
        };

        self.state_events.notify(&event).await;
        Ok(event.next)
    }

    /// Live view of one workflow; a Queued placeholder is created for unknown
    /// ids.
    #[must_use]
    pub fn execution_state(&self, workflow_id: &str) -> ExecutionState {
        let mut inner = self.inner.lock().expect("controller poisoned");
        inner
            .executions
            .entry(workflow_id.to_string())
            .or_insert_with(|| ExecutionState::new(workflow_id, ""))
            .clone()
    }

    /// Live view of a known workflow, without creating placeholders.
    #[must_use]
    pub fn try_execution_state(&self, workflow_id: &str) -> Option<ExecutionState> {
        self.inner
            .lock()
            .expect("controller poisoned")
            .executions
            .get(workflow_id)
            .cloned()
    }

    /// Drop the signal and token of a workflow that reached a terminal state
    /// or left the executor. The execution state stays queryable.
    pub fn drop_tracking(&self, workflow_id: &str) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        inner.signals.remove(workflow_id);
        inner.tokens.remove(workflow_id);
    }

    /// Forget a workflow entirely.
    pub fn clear(&self, workflow_id: &str) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        inner.signals.remove(workflow_id);
        inner.tokens.remove(workflow_id);
        inner.executions.remove(workflow_id);
    }

    /// Ids of every tracked workflow.
    #[must_use]
    pub fn workflow_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("controller poisoned")
            .executions
            .keys()
            .cloned()
            .collect()
    }

    /// Fire every live cancellation token. Part of engine teardown.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancelToken> = {
            let inner = self.inner.lock().expect("controller poisoned");
            inner.tokens.values().cloned().collect()
        };
        for token in tokens {
            token.cancel();
        }
    }
}
