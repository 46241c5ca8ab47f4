mod common;

use std::sync::Arc;

use cairn::executor::Pipeline;
use cairn::service::{ServiceError, WorkflowService};
use cairn::workflow::WorkflowState;

use common::{research_pipeline, test_config, FailingAgent, GatedAgent, ScriptedAgent};

fn service_in(dir: &std::path::Path) -> WorkflowService {
    let service = WorkflowService::new(test_config(dir));
    service.register_pipeline(research_pipeline(
        "Query is clear",
        "Brief: scope",
        "Facts: qubits",
    ));
    service
}

#[tokio::test]
async fn start_and_status_wire_shapes() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_in(dir.path());

    let reply = service
        .start_workflow("research", "What is quantum computing?", None)
        .unwrap();
    assert!(reply.workflow_id.starts_with("wf_"));
    assert_eq!(reply.status, "Queued");

    service.wait_for(&reply.workflow_id).await;

    let status = service.get_status(&reply.workflow_id).unwrap();
    assert_eq!(status.status, "Completed");
    assert_eq!(status.progress.total_steps, 3);
    assert_eq!(status.progress.current_step, 3);
    assert!(status.started_at.is_some());
    assert!(status.latest_checkpoint_id.is_some());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["status"], "Completed");
    assert_eq!(json["progress"]["total_steps"], 3);
}

#[tokio::test]
async fn invalid_start_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_in(dir.path());

    assert!(matches!(
        service.start_workflow("", "input", None),
        Err(ServiceError::InvalidRequest { .. })
    ));
    assert!(matches!(
        service.start_workflow("research", "   ", None),
        Err(ServiceError::InvalidRequest { .. })
    ));
    assert!(matches!(
        service.start_workflow("no-such-type", "input", None),
        Err(ServiceError::InvalidRequest { .. })
    ));
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_in(dir.path());
    assert!(matches!(
        service.get_status("wf_missing"),
        Err(ServiceError::WorkflowNotFound { .. })
    ));
    assert!(matches!(
        service.cancel("wf_missing"),
        Err(ServiceError::WorkflowNotFound { .. })
    ));
}

#[tokio::test]
async fn pause_resume_cycle_through_the_service() {
    let dir = tempfile::tempdir().unwrap();
    let service = WorkflowService::new(test_config(dir.path()));

    let (clarify, mut started, gate) = GatedAgent::new("Query is clear");
    service.register_pipeline(
        Pipeline::new("research")
            .clarification_stage("Clarify", Arc::new(clarify))
            .stage("Brief", Arc::new(ScriptedAgent::new("Brief: scope")))
            .stage("Researcher", Arc::new(ScriptedAgent::new("Facts: qubits"))),
    );

    let reply = service.start_workflow("research", "input", None).unwrap();
    let workflow_id = reply.workflow_id;

    // Wait until Clarify is in flight, then pause at the next boundary.
    assert_eq!(started.recv().await.as_deref(), Some("Clarify"));
    let action = service.pause(&workflow_id).unwrap();
    assert_eq!(action.status, "Pausing");
    assert!(action.success);

    gate.add_permits(1);
    service.wait_for(&workflow_id).await;
    assert_eq!(service.get_status(&workflow_id).unwrap().status, "Paused");

    // Pausing a paused workflow conflicts.
    assert!(matches!(
        service.pause(&workflow_id),
        Err(ServiceError::Conflict { .. })
    ));

    let action = service.resume(&workflow_id).await.unwrap();
    assert_eq!(action.status, "Running");
    service.wait_for(&workflow_id).await;
    assert_eq!(service.get_status(&workflow_id).unwrap().status, "Completed");

    // Resuming a completed workflow conflicts.
    assert!(matches!(
        service.resume(&workflow_id).await,
        Err(ServiceError::Conflict { .. })
    ));
}

#[tokio::test]
async fn cancel_flow_and_subsequent_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let service = WorkflowService::new(test_config(dir.path()));

    let (brief, mut started, _gate) = GatedAgent::new("Brief: never");
    service.register_pipeline(
        Pipeline::new("research")
            .stage("Clarify", Arc::new(ScriptedAgent::new("Query is clear")))
            .stage("Brief", Arc::new(brief)),
    );

    let reply = service.start_workflow("research", "input", None).unwrap();
    let workflow_id = reply.workflow_id;

    assert_eq!(started.recv().await.as_deref(), Some("Brief"));
    let action = service.cancel(&workflow_id).unwrap();
    assert_eq!(action.status, "Cancelling");

    service.wait_for(&workflow_id).await;
    assert_eq!(service.get_status(&workflow_id).unwrap().status, "Cancelled");

    assert!(matches!(
        service.pause(&workflow_id),
        Err(ServiceError::Conflict { .. })
    ));
    assert!(matches!(
        service.resume(&workflow_id).await,
        Err(ServiceError::Conflict { .. })
    ));
}

#[tokio::test]
async fn failed_workflow_surfaces_failed_status() {
    let dir = tempfile::tempdir().unwrap();
    let service = WorkflowService::new(test_config(dir.path()));
    service.register_pipeline(
        Pipeline::new("research").stage("Researcher", Arc::new(FailingAgent::new("boom"))),
    );

    let reply = service.start_workflow("research", "input", None).unwrap();
    service.wait_for(&reply.workflow_id).await;
    assert_eq!(
        service.get_status(&reply.workflow_id).unwrap().status,
        WorkflowState::Failed.as_str()
    );

    // The built-in sinks observed the failure.
    assert_eq!(
        service
            .telemetry()
            .counter("workflow.failed.total", &[("workflow_type", "research")]),
        1
    );
    let raised = service.alerts().raised();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].name(), "WorkflowFailed");
}

#[tokio::test]
async fn checkpoint_surface_lists_pages_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_in(dir.path());

    let reply = service.start_workflow("research", "input", None).unwrap();
    let workflow_id = reply.workflow_id;
    service.wait_for(&workflow_id).await;

    let first_page = service.list_checkpoints(&workflow_id, 0, 3).await.unwrap();
    assert_eq!(first_page.total, 7);
    assert_eq!(first_page.items.len(), 3);
    assert_eq!(first_page.items[0].reason, "workflow-complete");
    let second_page = service.list_checkpoints(&workflow_id, 1, 3).await.unwrap();
    assert_eq!(second_page.items.len(), 3);
    assert_ne!(
        first_page.items[0].checkpoint_id,
        second_page.items[0].checkpoint_id
    );

    let latest = service.get_latest_checkpoint(&workflow_id).await.unwrap();
    assert_eq!(latest.reason, "workflow-complete");
    let fetched = service.get_checkpoint(&latest.checkpoint_id).await.unwrap();
    assert_eq!(fetched.checkpoint_id, latest.checkpoint_id);

    let report = service.validate_checkpoint(&latest.checkpoint_id).await;
    assert!(report.is_valid);

    let deleted = service.delete_checkpoint(&latest.checkpoint_id).await.unwrap();
    assert_eq!(deleted.deleted_count, 1);
    assert_eq!(deleted.deleted_checkpoint_ids, vec![latest.checkpoint_id.clone()]);
    // Deleting again is a no-op, not an error.
    let again = service.delete_checkpoint(&latest.checkpoint_id).await.unwrap();
    assert_eq!(again.deleted_count, 0);

    let wiped = service.delete_for_workflow(&workflow_id).await.unwrap();
    assert_eq!(wiped.deleted_count, 6);
    assert!(service
        .list_checkpoints(&workflow_id, 0, 10)
        .await
        .unwrap()
        .items
        .is_empty());

    assert!(matches!(
        service.get_latest_checkpoint(&workflow_id).await,
        Err(ServiceError::CheckpointNotFound { .. })
    ));
}

#[tokio::test]
async fn statistics_are_exposed() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_in(dir.path());
    let reply = service.start_workflow("research", "input", None).unwrap();
    service.wait_for(&reply.workflow_id).await;

    let stats = service.checkpoint_statistics().await.unwrap();
    assert_eq!(stats.total_count, 7);
    assert!(stats.total_bytes > 0);
}

#[tokio::test]
async fn shutdown_cancels_live_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let service = WorkflowService::new(test_config(dir.path()));
    let (brief, mut started, _gate) = GatedAgent::new("Brief: never");
    service.register_pipeline(
        Pipeline::new("research")
            .stage("Clarify", Arc::new(ScriptedAgent::new("Query is clear")))
            .stage("Brief", Arc::new(brief)),
    );
    let reply = service.start_workflow("research", "input", None).unwrap();
    started.recv().await.unwrap();

    service.shutdown().await;
    assert_eq!(service.get_status(&reply.workflow_id).unwrap().status, "Cancelled");
}
