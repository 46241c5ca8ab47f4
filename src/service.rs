/*!
The control surface the HTTP boundary drives.

`WorkflowService` wires the store, controller, executor, and the two event
subjects together, and exposes the §6.1-shaped operations with serde DTOs.
Workflows run on their own tasks; a process-wide semaphore defers starts
beyond the configured concurrency in the Queued state.
*/

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStatistics, CheckpointStore, StoreError, ValidationReport};
use crate::config::EngineConfig;
use crate::controller::WorkflowController;
use crate::executor::{Pipeline, StartOptions, WorkflowExecutor};
use crate::observers::{AlertSink, CheckpointEvent, Subject, TelemetrySink, WorkflowStateEvent};
use crate::utils::ids;
use crate::workflow::WorkflowState;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

/// Errors surfaced by the control surface.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("invalid request: {message}")]
    #[diagnostic(code(cairn::service::invalid_request))]
    InvalidRequest { message: String },

    #[error("workflow {workflow_id} not found")]
    #[diagnostic(code(cairn::service::workflow_not_found))]
    WorkflowNotFound { workflow_id: String },

    #[error("checkpoint {checkpoint_id} not found")]
    #[diagnostic(code(cairn::service::checkpoint_not_found))]
    CheckpointNotFound { checkpoint_id: String },

    #[error("workflow {workflow_id} is {state}; {action} requires {required}")]
    #[diagnostic(code(cairn::service::conflict))]
    Conflict {
        workflow_id: String,
        state: String,
        action: String,
        required: String,
    },

    #[error(transparent)]
    #[diagnostic(code(cairn::service::store))]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Serialize)]
pub struct StartReply {
    pub workflow_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressView {
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<String>,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReply {
    pub workflow_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub progress: ProgressView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_checkpoint_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionReply {
    pub workflow_id: String,
    pub action: String,
    pub success: bool,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Checkpoint as surfaced to clients.
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointView {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub stage_index: usize,
    pub schema_version: u32,
    pub state_size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub automated: bool,
    pub reason: String,
    pub completed_agents: Vec<String>,
}

impl From<&Checkpoint> for CheckpointView {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            workflow_id: checkpoint.workflow_id.clone(),
            workflow_type: checkpoint.workflow_type.clone(),
            created_at: checkpoint.created_at,
            agent_id: checkpoint.agent_id.clone(),
            stage_index: checkpoint.stage_index,
            schema_version: checkpoint.schema_version,
            state_size_bytes: checkpoint.state_size_bytes,
            label: checkpoint.label.clone(),
            automated: checkpoint.metadata.automated,
            reason: checkpoint.metadata.reason.clone(),
            completed_agents: checkpoint.metadata.completed_agents.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CheckpointPage {
    pub items: Vec<CheckpointView>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeleteReply {
    pub deleted_count: usize,
    pub deleted_checkpoint_ids: Vec<String>,
    pub message: String,
}

/// In-core implementation of the control surface.
pub struct WorkflowService {
    executor: Arc<WorkflowExecutor>,
    store: Arc<CheckpointStore>,
    controller: Arc<WorkflowController>,
    checkpoint_events: Arc<Subject<CheckpointEvent>>,
    telemetry: Arc<TelemetrySink>,
    alerts: Arc<AlertSink>,
    pipelines: Mutex<FxHashMap<String, Arc<Pipeline>>>,
    running: Mutex<FxHashMap<String, JoinHandle<()>>>,
    permits: Arc<Semaphore>,
}

impl WorkflowService {
    /// Wire a full engine from configuration, with the built-in telemetry and
    /// alert sinks subscribed to both subjects.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let controller = Arc::new(WorkflowController::new());
        let checkpoint_events = Arc::new(Subject::new("checkpoint-event"));
        let store = Arc::new(
            CheckpointStore::from_config(&config).with_events(Arc::clone(&checkpoint_events)),
        );
        let permits = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));

        let telemetry = Arc::new(TelemetrySink::new());
        let alerts = Arc::new(AlertSink::new(
            config.alert_endpoint.clone(),
            config.long_running_threshold,
            config.storage_alert_threshold_bytes,
        ));
        controller.state_events().subscribe(telemetry.clone());
        controller.state_events().subscribe(alerts.clone());
        checkpoint_events.subscribe(telemetry.clone());
        checkpoint_events.subscribe(alerts.clone());

        let executor = Arc::new(WorkflowExecutor::new(
            Arc::clone(&store),
            Arc::clone(&controller),
            config,
        ));
        Self {
            executor,
            store,
            controller,
            checkpoint_events,
            telemetry,
            alerts,
            pipelines: Mutex::new(FxHashMap::default()),
            running: Mutex::new(FxHashMap::default()),
            permits,
        }
    }

    /// The built-in metrics sink.
    #[must_use]
    pub fn telemetry(&self) -> Arc<TelemetrySink> {
        Arc::clone(&self.telemetry)
    }

    /// The built-in alert sink.
    #[must_use]
    pub fn alerts(&self) -> Arc<AlertSink> {
        Arc::clone(&self.alerts)
    }

    #[must_use]
    pub fn store(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn controller(&self) -> Arc<WorkflowController> {
        Arc::clone(&self.controller)
    }

    /// Subject carrying workflow-state transition events.
    #[must_use]
    pub fn state_events(&self) -> Arc<Subject<WorkflowStateEvent>> {
        self.controller.state_events()
    }

    /// Subject carrying checkpoint events.
    #[must_use]
    pub fn checkpoint_events(&self) -> Arc<Subject<CheckpointEvent>> {
        Arc::clone(&self.checkpoint_events)
    }

    /// Make a workflow type startable.
    pub fn register_pipeline(&self, pipeline: Pipeline) {
        self.pipelines
            .lock()
            .expect("pipeline registry poisoned")
            .insert(pipeline.workflow_type.clone(), Arc::new(pipeline));
    }

    fn pipeline(&self, workflow_type: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .lock()
            .expect("pipeline registry poisoned")
            .get(workflow_type)
            .cloned()
    }

    /// Queue a workflow and drive it on its own task.
    pub fn start_workflow(
        &self,
        workflow_type: &str,
        input: &str,
        metadata: Option<FxHashMap<String, Value>>,
    ) -> Result<StartReply, ServiceError> {
        if workflow_type.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "workflow type must not be empty".to_string(),
            });
        }
        if input.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "input must not be empty".to_string(),
            });
        }
        let pipeline = self
            .pipeline(workflow_type)
            .ok_or_else(|| ServiceError::InvalidRequest {
                message: format!("unknown workflow type: {workflow_type}"),
            })?;

        let workflow_id = ids::new_workflow_id();
        self.controller.register(&workflow_id, workflow_type);
        let created_at = self
            .controller
            .try_execution_state(&workflow_id)
            .map(|state| state.created_at)
            .unwrap_or_else(Utc::now);

        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let task_workflow_id = workflow_id.clone();
        let input = input.to_string();
        let options = StartOptions {
            workflow_id: Some(workflow_id.clone()),
            metadata: metadata.unwrap_or_default(),
        };
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match executor.run(&pipeline, &input, options).await {
                Ok(outcome) => info!(workflow_id = %task_workflow_id, ?outcome, "workflow finished"),
                Err(error) => warn!(workflow_id = %task_workflow_id, error = %error, "workflow failed"),
            }
        });
        self.running
            .lock()
            .expect("task registry poisoned")
            .insert(workflow_id.clone(), handle);

        Ok(StartReply {
            workflow_id,
            status: WorkflowState::Queued.as_str().to_string(),
            created_at,
            message: Some(format!("workflow of type {workflow_type} queued")),
        })
    }

    /// Live status and progress of one workflow.
    pub fn get_status(&self, workflow_id: &str) -> Result<StatusReply, ServiceError> {
        let execution = self.controller.try_execution_state(workflow_id).ok_or_else(|| {
            ServiceError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            }
        })?;

        let total_steps = self
            .pipeline(&execution.workflow_type)
            .map(|p| p.len())
            .unwrap_or_else(|| execution.completed_agents.len());
        let completed = execution.completed_agents.len();
        let elapsed_seconds = execution.elapsed_seconds().unwrap_or(0.0);
        let estimated_remaining_seconds = if execution.state == WorkflowState::Running
            && completed > 0
            && total_steps > completed
        {
            Some(elapsed_seconds / completed as f64 * (total_steps - completed) as f64)
        } else {
            None
        };

        Ok(StatusReply {
            workflow_id: workflow_id.to_string(),
            status: execution.state.as_str().to_string(),
            created_at: execution.created_at,
            started_at: execution.started_at,
            progress: ProgressView {
                current_step: execution.current_stage_index,
                total_steps,
                current_agent: execution.current_agent_id.clone(),
                elapsed_seconds,
                estimated_remaining_seconds,
            },
            latest_checkpoint_id: execution.latest_checkpoint_id,
        })
    }

    /// Request a pause at the next stage boundary.
    pub fn pause(&self, workflow_id: &str) -> Result<ActionReply, ServiceError> {
        let execution = self.controller.try_execution_state(workflow_id).ok_or_else(|| {
            ServiceError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            }
        })?;
        if execution.state != WorkflowState::Running {
            return Err(ServiceError::Conflict {
                workflow_id: workflow_id.to_string(),
                state: execution.state.as_str().to_string(),
                action: "pause".to_string(),
                required: "Running".to_string(),
            });
        }
        self.controller
            .request_pause(workflow_id, Some("user-requested".to_string()));
        Ok(ActionReply {
            workflow_id: workflow_id.to_string(),
            action: "pause".to_string(),
            success: true,
            status: "Pausing".to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Resume a paused workflow from its latest checkpoint.
    pub async fn resume(&self, workflow_id: &str) -> Result<ActionReply, ServiceError> {
        let execution = self.controller.try_execution_state(workflow_id).ok_or_else(|| {
            ServiceError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            }
        })?;
        if execution.state != WorkflowState::Paused {
            return Err(ServiceError::Conflict {
                workflow_id: workflow_id.to_string(),
                state: execution.state.as_str().to_string(),
                action: "resume".to_string(),
                required: "Paused".to_string(),
            });
        }
        let latest = self.store.get_latest(workflow_id).await?.ok_or_else(|| {
            ServiceError::CheckpointNotFound {
                checkpoint_id: format!("latest for {workflow_id}"),
            }
        })?;
        let pipeline = self
            .pipeline(&execution.workflow_type)
            .ok_or_else(|| ServiceError::InvalidRequest {
                message: format!("unknown workflow type: {}", execution.workflow_type),
            })?;

        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let checkpoint_id = latest.checkpoint_id.clone();
        let task_workflow_id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match executor.resume(&pipeline, &checkpoint_id).await {
                Ok(outcome) => info!(workflow_id = %task_workflow_id, ?outcome, "workflow finished"),
                Err(error) => warn!(workflow_id = %task_workflow_id, error = %error, "workflow failed"),
            }
        });
        self.running
            .lock()
            .expect("task registry poisoned")
            .insert(workflow_id.to_string(), handle);

        Ok(ActionReply {
            workflow_id: workflow_id.to_string(),
            action: "resume".to_string(),
            success: true,
            status: "Running".to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Request cancellation; the token fires immediately, the workflow exits
    /// at its next boundary.
    pub fn cancel(&self, workflow_id: &str) -> Result<ActionReply, ServiceError> {
        if self.controller.try_execution_state(workflow_id).is_none() {
            return Err(ServiceError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            });
        }
        self.controller.request_cancel(workflow_id);
        Ok(ActionReply {
            workflow_id: workflow_id.to_string(),
            action: "cancel".to_string(),
            success: true,
            status: "Cancelling".to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Checkpoints of one workflow, newest first, paged.
    pub async fn list_checkpoints(
        &self,
        workflow_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<CheckpointPage, ServiceError> {
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };
        let listed = self.store.list_for_workflow(workflow_id).await?;
        let total = listed.len();
        let items = listed
            .iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .map(CheckpointView::from)
            .collect();
        Ok(CheckpointPage {
            items,
            page,
            page_size,
            total,
        })
    }

    pub async fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<CheckpointView, ServiceError> {
        let checkpoint = self.store.load(checkpoint_id).await?.ok_or_else(|| {
            ServiceError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            }
        })?;
        Ok(CheckpointView::from(&checkpoint))
    }

    pub async fn get_latest_checkpoint(
        &self,
        workflow_id: &str,
    ) -> Result<CheckpointView, ServiceError> {
        let checkpoint = self.store.get_latest(workflow_id).await?.ok_or_else(|| {
            ServiceError::CheckpointNotFound {
                checkpoint_id: format!("latest for {workflow_id}"),
            }
        })?;
        Ok(CheckpointView::from(&checkpoint))
    }

    pub async fn validate_checkpoint(&self, checkpoint_id: &str) -> ValidationReport {
        self.store.validate(checkpoint_id).await
    }

    pub async fn delete_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<DeleteReply, ServiceError> {
        let deleted = self.store.delete(checkpoint_id).await?;
        let deleted_checkpoint_ids = if deleted {
            vec![checkpoint_id.to_string()]
        } else {
            Vec::new()
        };
        Ok(DeleteReply {
            deleted_count: deleted_checkpoint_ids.len(),
            message: if deleted {
                format!("checkpoint {checkpoint_id} deleted")
            } else {
                format!("checkpoint {checkpoint_id} was already absent")
            },
            deleted_checkpoint_ids,
        })
    }

    pub async fn delete_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<DeleteReply, ServiceError> {
        let deleted_checkpoint_ids = self.store.delete_for_workflow(workflow_id).await?;
        Ok(DeleteReply {
            deleted_count: deleted_checkpoint_ids.len(),
            message: format!(
                "deleted {} checkpoints of workflow {workflow_id}",
                deleted_checkpoint_ids.len()
            ),
            deleted_checkpoint_ids,
        })
    }

    /// Aggregate store statistics.
    pub async fn checkpoint_statistics(&self) -> Result<CheckpointStatistics, ServiceError> {
        Ok(self.store.statistics().await?)
    }

    /// Wait for a workflow's driving task to finish. Intended for tests and
    /// embedders that need a completion edge.
    pub async fn wait_for(&self, workflow_id: &str) {
        let handle = self
            .running
            .lock()
            .expect("task registry poisoned")
            .remove(workflow_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Cancel every live workflow and await their tasks.
    pub async fn shutdown(&self) {
        self.controller.cancel_all();
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut running = self.running.lock().expect("task registry poisoned");
            running.drain().collect()
        };
        for (workflow_id, handle) in handles {
            if let Err(error) = handle.await {
                warn!(workflow_id = %workflow_id, error = %error, "workflow task join failed");
            }
        }
    }
}
