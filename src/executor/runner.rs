/*!
The pipeline executor.

Drives one workflow's stages in order, advancing the state machine through
the controller, persisting progress through the checkpoint store, and
honoring pause/cancel requests at stage boundaries. Single-threaded per
workflow; independent workflows run on independent tasks.

Checkpoint-save failures during a live run are logged and counted, never
fatal: durability problems must not abort a workflow that is still making
progress.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::pipeline::{Pipeline, CLARIFICATION_MARKER};
use crate::agents::{middleware, AgentError, StageContext};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore, StoreError};
use crate::config::EngineConfig;
use crate::controller::WorkflowController;
use crate::utils::ids;
use crate::workflow::{SnapshotError, WorkflowRecord, WorkflowState};

/// How a driven workflow left the executor.
///
/// Pause is a control signal, not a failure: it travels here rather than in
/// the error channel, carrying everything needed to resume.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Completed {
        workflow_id: String,
        result: String,
    },
    Paused {
        workflow_id: String,
        checkpoint_id: String,
        reason: String,
    },
    Cancelled {
        workflow_id: String,
    },
}

/// Options for starting a workflow.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Pre-assigned workflow id; generated when absent.
    pub workflow_id: Option<String>,
    /// Free-form metadata recorded on the workflow.
    pub metadata: FxHashMap<String, Value>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("pipeline {workflow_type} has no stages")]
    #[diagnostic(code(cairn::executor::empty_pipeline))]
    EmptyPipeline { workflow_type: String },

    #[error("stage {agent_id} of workflow {workflow_id} failed: {source}")]
    #[diagnostic(code(cairn::executor::stage_failed))]
    StageFailed {
        workflow_id: String,
        agent_id: String,
        #[source]
        source: AgentError,
    },

    #[error("checkpoint {checkpoint_id} not found")]
    #[diagnostic(code(cairn::executor::checkpoint_not_found))]
    CheckpointNotFound { checkpoint_id: String },

    #[error("snapshot of checkpoint {checkpoint_id} could not be restored: {source}")]
    #[diagnostic(code(cairn::executor::snapshot))]
    Snapshot {
        checkpoint_id: String,
        #[source]
        source: SnapshotError,
    },

    #[error(transparent)]
    #[diagnostic(code(cairn::executor::store))]
    Store(#[from] StoreError),
}

/// Drives pipelines for the engine. Stateless across workflows apart from a
/// counter of swallowed checkpoint-save failures.
pub struct WorkflowExecutor {
    store: Arc<CheckpointStore>,
    controller: Arc<WorkflowController>,
    config: EngineConfig,
    checkpoint_failures: AtomicU64,
}

impl WorkflowExecutor {
    #[must_use]
    pub fn new(
        store: Arc<CheckpointStore>,
        controller: Arc<WorkflowController>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            controller,
            config,
            checkpoint_failures: AtomicU64::new(0),
        }
    }

    /// Checkpoint saves that failed and were swallowed during live runs.
    #[must_use]
    pub fn checkpoint_failures(&self) -> u64 {
        self.checkpoint_failures.load(Ordering::SeqCst)
    }

    /// Start a workflow from scratch and drive it to an outcome.
    #[instrument(skip(self, pipeline, user_input, options), err)]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        user_input: &str,
        options: StartOptions,
    ) -> Result<RunOutcome, ExecutorError> {
        if pipeline.is_empty() {
            return Err(ExecutorError::EmptyPipeline {
                workflow_type: pipeline.workflow_type.clone(),
            });
        }
        let workflow_id = options.workflow_id.unwrap_or_else(ids::new_workflow_id);
        let mut record = WorkflowRecord::new(&workflow_id, &pipeline.workflow_type, user_input);
        record.metadata = options.metadata;

        self.controller.register(&workflow_id, &pipeline.workflow_type);

        // A cancel that lands while the workflow is still queued takes the
        // direct Queued → Cancelled edge.
        if self.controller.signal(&workflow_id).cancel_requested {
            return Ok(self.finish_cancelled(&mut record).await);
        }

        if let Err(error) = self
            .controller
            .transition(&workflow_id, WorkflowState::Running, Some("workflow started"))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %error, "start transition rejected");
        }
        info!(workflow_id = %workflow_id, workflow_type = %pipeline.workflow_type, "workflow started");

        self.drive(pipeline, record, false).await
    }

    /// Resume a workflow from a checkpoint, skipping completed stages.
    #[instrument(skip(self, pipeline), err)]
    pub async fn resume(
        &self,
        pipeline: &Pipeline,
        checkpoint_id: &str,
    ) -> Result<RunOutcome, ExecutorError> {
        let checkpoint = self
            .store
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| ExecutorError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })?;

        let mut record = WorkflowRecord::from_snapshot(&checkpoint.state_snapshot).map_err(
            |source| ExecutorError::Snapshot {
                checkpoint_id: checkpoint_id.to_string(),
                source,
            },
        )?;
        let paused_at = record.paused_at;
        record.clear_paused();

        self.controller.register_paused(
            &record.workflow_id,
            &record.workflow_type,
            record.started_at,
            paused_at,
            &checkpoint,
        );
        self.controller
            .on_workflow_resumed(&record.workflow_id, &checkpoint)
            .await;
        info!(
            workflow_id = %record.workflow_id,
            checkpoint_id = %checkpoint_id,
            completed = record.completed_agents.len(),
            "workflow resumed"
        );

        self.drive(pipeline, record, true).await
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        mut record: WorkflowRecord,
        resumed: bool,
    ) -> Result<RunOutcome, ExecutorError> {
        let workflow_id = record.workflow_id.clone();
        let cancel = self.controller.token(&workflow_id);
        let mut last_checkpoint = Instant::now();

        for (index, stage) in pipeline.stages().iter().enumerate() {
            if record.completed_agents.iter().any(|a| a == &stage.agent_id) {
                continue;
            }

            // Stage boundary: the only place pause/cancel take effect.
            let signal = self.controller.signal(&workflow_id);
            if signal.cancel_requested || cancel.is_cancelled() {
                return Ok(self.finish_cancelled(&mut record).await);
            }
            if signal.pause_requested {
                return Ok(self.finish_paused(&mut record).await);
            }

            if self.config.enable_auto_checkpoints
                && last_checkpoint.elapsed() >= self.config.auto_checkpoint_interval
            {
                if self.save_checkpoint(&record, "auto", true).await.is_some() {
                    last_checkpoint = Instant::now();
                }
            }

            record.current_stage_index = index;
            record.current_agent_id = Some(stage.agent_id.clone());
            self.controller.update_progress(
                &workflow_id,
                Some(stage.agent_id.clone()),
                index,
                record.completed_agents.clone(),
            );

            if self.config.checkpoint_after_each_agent {
                let reason = format!("before-{}", stage.agent_id);
                if self.save_checkpoint(&record, &reason, true).await.is_some() {
                    last_checkpoint = Instant::now();
                }
            }

            let decorated = middleware::decorate(
                Arc::clone(&stage.agent),
                self.config.retry_budget(&stage.agent_id),
                self.config.slow_stage_threshold,
            );
            let ctx = StageContext {
                workflow_id: workflow_id.clone(),
                agent_id: stage.agent_id.clone(),
                cancel: cancel.clone(),
            };
            let timeout = self.config.stage_timeout(&stage.agent_id);
            let invoked = tokio::time::timeout(timeout, decorated.run(&record.messages, &ctx)).await;
            let result = match invoked {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout {
                    agent_id: stage.agent_id.clone(),
                    timeout_ms: timeout.as_millis(),
                }),
            };

            match result {
                Ok(response) => {
                    let output = response.final_text();
                    record.record_stage_success(&stage.agent_id, response.messages, output.clone());
                    self.controller.update_progress(
                        &workflow_id,
                        Some(stage.agent_id.clone()),
                        record.current_stage_index,
                        record.completed_agents.clone(),
                    );

                    if self.config.checkpoint_after_each_agent {
                        let reason = if resumed {
                            format!("resumed-after-{}", stage.agent_id)
                        } else {
                            format!("after-{}", stage.agent_id)
                        };
                        if self.save_checkpoint(&record, &reason, true).await.is_some() {
                            last_checkpoint = Instant::now();
                        }
                    }

                    if stage.clarification && contains_clarification_marker(&output) {
                        info!(
                            workflow_id = %workflow_id,
                            agent = %stage.agent_id,
                            "clarification requested, completing early"
                        );
                        return Ok(self.finish_completed(&mut record, output).await);
                    }
                }
                Err(error) => {
                    if cancel.is_cancelled() {
                        return Ok(self.finish_cancelled(&mut record).await);
                    }
                    let reason = format!("error-recovery:{error}");
                    self.save_checkpoint(&record, &reason, true).await;
                    let message = error.to_string();
                    if let Err(transition_error) = self
                        .controller
                        .transition(&workflow_id, WorkflowState::Failed, Some(&message))
                        .await
                    {
                        warn!(workflow_id = %workflow_id, error = %transition_error, "failed transition rejected");
                    }
                    self.controller.drop_tracking(&workflow_id);
                    return Err(ExecutorError::StageFailed {
                        workflow_id,
                        agent_id: stage.agent_id.clone(),
                        source: error,
                    });
                }
            }
        }

        // Final boundary: a cancel that raced the last stage still wins over
        // completion.
        if cancel.is_cancelled() || self.controller.signal(&workflow_id).cancel_requested {
            return Ok(self.finish_cancelled(&mut record).await);
        }

        let result = pipeline
            .stages()
            .last()
            .and_then(|stage| record.stage_results.get(&stage.agent_id).cloned())
            .unwrap_or_default();
        Ok(self.finish_completed(&mut record, result).await)
    }

    async fn finish_completed(&self, record: &mut WorkflowRecord, result: String) -> RunOutcome {
        let workflow_id = record.workflow_id.clone();
        record.current_agent_id = None;
        self.save_checkpoint(record, "workflow-complete", true).await;
        if let Err(error) = self
            .controller
            .transition(&workflow_id, WorkflowState::Completed, Some("workflow complete"))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %error, "complete transition rejected");
        }
        self.controller.drop_tracking(&workflow_id);
        info!(workflow_id = %workflow_id, "workflow completed");
        RunOutcome::Completed {
            workflow_id,
            result,
        }
    }

    async fn finish_cancelled(&self, record: &mut WorkflowRecord) -> RunOutcome {
        let workflow_id = record.workflow_id.clone();
        self.save_checkpoint(record, "cancelled", false).await;
        if let Err(error) = self
            .controller
            .transition(&workflow_id, WorkflowState::Cancelled, Some("cancel requested"))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %error, "cancel transition rejected");
        }
        self.controller.drop_tracking(&workflow_id);
        info!(workflow_id = %workflow_id, "workflow cancelled");
        RunOutcome::Cancelled { workflow_id }
    }

    async fn finish_paused(&self, record: &mut WorkflowRecord) -> RunOutcome {
        let workflow_id = record.workflow_id.clone();
        let reason = self
            .controller
            .acknowledge_pause(&workflow_id)
            .unwrap_or_else(|| "pause requested".to_string());
        record.mark_paused(reason.as_str());

        let checkpoint_reason = format!("pause:{reason}");
        let checkpoint_id = match self.save_checkpoint(record, &checkpoint_reason, false).await {
            Some(checkpoint) => checkpoint.checkpoint_id,
            // Pausing must not be blocked by a durability failure; fall back
            // to the last checkpoint that did land.
            None => self
                .controller
                .try_execution_state(&workflow_id)
                .and_then(|state| state.latest_checkpoint_id)
                .unwrap_or_default(),
        };

        if let Err(error) = self
            .controller
            .transition(&workflow_id, WorkflowState::Paused, Some(&reason))
            .await
        {
            warn!(workflow_id = %workflow_id, error = %error, "pause transition rejected");
        }
        self.controller.drop_tracking(&workflow_id);
        info!(workflow_id = %workflow_id, reason = %reason, "workflow paused");
        RunOutcome::Paused {
            workflow_id,
            checkpoint_id,
            reason,
        }
    }

    async fn save_checkpoint(
        &self,
        record: &WorkflowRecord,
        reason: &str,
        automated: bool,
    ) -> Option<Checkpoint> {
        let snapshot = match record.to_snapshot() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(
                    workflow_id = %record.workflow_id,
                    reason = %reason,
                    error = %error,
                    "snapshot serialization failed, skipping checkpoint"
                );
                self.checkpoint_failures.fetch_add(1, Ordering::SeqCst);
                return None;
            }
        };

        let mut metadata = CheckpointMetadata::with_reason(reason)
            .with_completed_agents(record.completed_agents.clone());
        metadata.automated = automated;

        match self
            .store
            .save(
                &record.workflow_id,
                &record.workflow_type,
                record.current_agent_id.as_deref(),
                record.current_stage_index,
                &snapshot,
                metadata,
            )
            .await
        {
            Ok(checkpoint) => {
                self.controller
                    .on_checkpoint_saved(&record.workflow_id, &checkpoint);
                Some(checkpoint)
            }
            Err(error) => {
                warn!(
                    workflow_id = %record.workflow_id,
                    reason = %reason,
                    error = %error,
                    "checkpoint save failed"
                );
                self.checkpoint_failures.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }
}

fn contains_clarification_marker(output: &str) -> bool {
    output
        .to_ascii_lowercase()
        .contains(&CLARIFICATION_MARKER.to_ascii_lowercase())
}
