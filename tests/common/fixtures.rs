//! Engine wiring helpers for the integration suites.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use cairn::checkpoint::{BackendError, Checkpoint, CheckpointStore, StorageBackend};
use cairn::config::{EngineConfig, StorageBackendKind};
use cairn::controller::WorkflowController;
use cairn::executor::{Pipeline, WorkflowExecutor};
use cairn::observers::{
    CheckpointEvent, MemorySink, Subject, TelemetrySink, WorkflowStateEvent,
};
use cairn::workflow::WorkflowState;

use super::agents::ScriptedAgent;

/// File-backend configuration rooted in a test directory.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_storage_directory(dir)
        .with_storage_backend(StorageBackendKind::File)
}

/// A fully wired engine with recording sinks attached.
pub struct TestEngine {
    pub store: Arc<CheckpointStore>,
    pub controller: Arc<WorkflowController>,
    pub executor: Arc<WorkflowExecutor>,
    pub checkpoint_events: Arc<Subject<CheckpointEvent>>,
    pub state_sink: Arc<MemorySink<WorkflowStateEvent>>,
    pub checkpoint_sink: Arc<MemorySink<CheckpointEvent>>,
    pub telemetry: Arc<TelemetrySink>,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        let controller = Arc::new(WorkflowController::new());
        let checkpoint_events = Arc::new(Subject::new("checkpoint-event"));
        let store = Arc::new(
            CheckpointStore::from_config(&config).with_events(Arc::clone(&checkpoint_events)),
        );

        let state_sink = Arc::new(MemorySink::new());
        let checkpoint_sink = Arc::new(MemorySink::new());
        let telemetry = Arc::new(TelemetrySink::new());
        controller.state_events().subscribe(state_sink.clone());
        controller.state_events().subscribe(telemetry.clone());
        checkpoint_events.subscribe(checkpoint_sink.clone());
        checkpoint_events.subscribe(telemetry.clone());

        let executor = Arc::new(WorkflowExecutor::new(
            Arc::clone(&store),
            Arc::clone(&controller),
            config,
        ));
        Self {
            store,
            controller,
            executor,
            checkpoint_events,
            state_sink,
            checkpoint_sink,
            telemetry,
        }
    }

    /// Observed (previous, next) transition pairs for one workflow.
    pub fn transitions(&self, workflow_id: &str) -> Vec<(WorkflowState, WorkflowState)> {
        self.state_sink
            .snapshot()
            .into_iter()
            .filter(|event| event.workflow_id == workflow_id)
            .map(|event| (event.previous, event.next))
            .collect()
    }

    /// Checkpoint reasons for one workflow, oldest first.
    pub async fn checkpoint_reasons(&self, workflow_id: &str) -> Vec<String> {
        let mut listed = self
            .store
            .list_for_workflow(workflow_id)
            .await
            .expect("list checkpoints");
        listed.reverse();
        listed
            .into_iter()
            .map(|checkpoint| checkpoint.metadata.reason)
            .collect()
    }
}

/// The canonical three-stage research pipeline with scripted outputs.
pub fn research_pipeline(
    clarify_output: &str,
    brief_output: &str,
    researcher_output: &str,
) -> Pipeline {
    Pipeline::new("research")
        .clarification_stage("Clarify", Arc::new(ScriptedAgent::new(clarify_output)))
        .stage("Brief", Arc::new(ScriptedAgent::new(brief_output)))
        .stage("Researcher", Arc::new(ScriptedAgent::new(researcher_output)))
}

/// A backend that refuses every operation, for exercising the fallback path.
pub struct FailingBackend;

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn put(&self, _checkpoint: &Checkpoint) -> Result<(), BackendError> {
        Err(BackendError::Unavailable {
            message: "injected failure".to_string(),
        })
    }

    async fn get(&self, _checkpoint_id: &str) -> Result<Option<Checkpoint>, BackendError> {
        Err(BackendError::Unavailable {
            message: "injected failure".to_string(),
        })
    }

    async fn delete(&self, _checkpoint_id: &str) -> Result<bool, BackendError> {
        Err(BackendError::Unavailable {
            message: "injected failure".to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, BackendError> {
        Err(BackendError::Unavailable {
            message: "injected failure".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
