/*!
Alert sink.

Watches the two subjects for alert-worthy conditions — failed workflows,
long-running workflows, storage growth, checkpoint validation failures — and
POSTs alert batches to an external endpoint in the Alertmanager list shape.
Transport failures are logged and swallowed; every raised alert is also kept
in a local ring for inspection and tests.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::warn;

use super::events::{CheckpointEvent, CheckpointEventKind, WorkflowStateEvent};
use super::subject::{Observer, ObserverError};
use crate::workflow::WorkflowState;

const SERVICE_LABEL: &str = "workflow-engine";

/// One alert in the external endpoint's wire shape.
#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub labels: FxHashMap<String, String>,
    pub annotations: FxHashMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
}

impl Alert {
    fn new(alertname: &str, severity: &str) -> Self {
        let mut labels = FxHashMap::default();
        labels.insert("alertname".to_string(), alertname.to_string());
        labels.insert("severity".to_string(), severity.to_string());
        labels.insert("service".to_string(), SERVICE_LABEL.to_string());
        Self {
            labels,
            annotations: FxHashMap::default(),
            starts_at: Utc::now(),
        }
    }

    fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }

    fn annotate(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("", String::as_str)
    }
}

/// Threshold-driven alerting observer.
pub struct AlertSink {
    endpoint: Option<String>,
    client: reqwest::Client,
    long_running_threshold: Duration,
    storage_alert_threshold_bytes: u64,
    storage_bytes: AtomicU64,
    raised: Mutex<Vec<Alert>>,
}

impl AlertSink {
    #[must_use]
    pub fn new(
        endpoint: Option<String>,
        long_running_threshold: Duration,
        storage_alert_threshold_bytes: u64,
    ) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            long_running_threshold,
            storage_alert_threshold_bytes,
            storage_bytes: AtomicU64::new(0),
            raised: Mutex::new(Vec::new()),
        }
    }

    /// Every alert this sink has raised, for inspection and tests.
    #[must_use]
    pub fn raised(&self) -> Vec<Alert> {
        self.raised.lock().expect("alert sink poisoned").clone()
    }

    async fn dispatch(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }
        self.raised
            .lock()
            .expect("alert sink poisoned")
            .extend(alerts.iter().cloned());
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        if let Err(error) = self.client.post(endpoint).json(&alerts).send().await {
            warn!(endpoint = %endpoint, error = %error, "alert delivery failed");
        }
    }
}

#[async_trait]
impl Observer<WorkflowStateEvent> for AlertSink {
    async fn on_event(&self, event: &WorkflowStateEvent) -> Result<(), ObserverError> {
        let mut alerts = Vec::new();

        if event.next == WorkflowState::Failed {
            alerts.push(
                Alert::new("WorkflowFailed", "critical")
                    .label("workflow_id", &event.workflow_id)
                    .label("workflow_type", &event.workflow_type)
                    .annotate("summary", format!("workflow {} failed", event.workflow_id))
                    .annotate(
                        "description",
                        event
                            .reason
                            .clone()
                            .unwrap_or_else(|| "workflow transitioned to Failed".to_string()),
                    ),
            );
        }

        if event.next == WorkflowState::Running {
            if let Some(elapsed) = event.elapsed_seconds() {
                if elapsed > self.long_running_threshold.as_secs_f64() {
                    alerts.push(
                        Alert::new("WorkflowLongRunning", "warning")
                            .label("workflow_id", &event.workflow_id)
                            .label("workflow_type", &event.workflow_type)
                            .annotate(
                                "summary",
                                format!("workflow {} is long-running", event.workflow_id),
                            )
                            .annotate(
                                "description",
                                format!("running for {elapsed:.0} s, above threshold"),
                            ),
                    );
                }
            }
        }

        self.dispatch(alerts).await;
        Ok(())
    }
}

#[async_trait]
impl Observer<CheckpointEvent> for AlertSink {
    async fn on_event(&self, event: &CheckpointEvent) -> Result<(), ObserverError> {
        let mut alerts = Vec::new();

        match event.kind {
            CheckpointEventKind::Created => {
                if let Some(size) = event.size_bytes {
                    let previous = self.storage_bytes.fetch_add(size as u64, Ordering::SeqCst);
                    let total = previous + size as u64;
                    // Alert once per threshold crossing, not on every write above it.
                    if previous <= self.storage_alert_threshold_bytes
                        && total > self.storage_alert_threshold_bytes
                    {
                        alerts.push(
                            Alert::new("CheckpointStorageHigh", "warning")
                                .annotate("summary", "checkpoint storage above threshold")
                                .annotate(
                                    "description",
                                    format!(
                                        "{total} bytes stored, threshold {} bytes",
                                        self.storage_alert_threshold_bytes
                                    ),
                                ),
                        );
                    }
                }
            }
            CheckpointEventKind::Deleted => {
                if let Some(size) = event.size_bytes {
                    let _ = self.storage_bytes.fetch_update(
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        |current| Some(current.saturating_sub(size as u64)),
                    );
                }
            }
            CheckpointEventKind::Failed => {
                alerts.push(
                    Alert::new("CheckpointValidationFailed", "warning")
                        .label("checkpoint_id", &event.checkpoint_id)
                        .label("workflow_id", &event.workflow_id)
                        .annotate(
                            "summary",
                            format!("checkpoint {} failed validation", event.checkpoint_id),
                        )
                        .annotate(
                            "description",
                            event.reason.clone().unwrap_or_default(),
                        ),
                );
            }
            CheckpointEventKind::Loaded | CheckpointEventKind::Validated => {}
        }

        self.dispatch(alerts).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> AlertSink {
        AlertSink::new(None, Duration::from_secs(1800), 10_000)
    }

    #[tokio::test]
    async fn failed_transition_raises_critical() {
        let sink = sink();
        let event = WorkflowStateEvent {
            workflow_id: "wf_t".to_string(),
            workflow_type: "research".to_string(),
            previous: WorkflowState::Running,
            next: WorkflowState::Failed,
            at: Utc::now(),
            reason: Some("stage Researcher failed".to_string()),
            metadata: FxHashMap::default(),
        };
        sink.on_event(&event).await.unwrap();
        let raised = sink.raised();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].name(), "WorkflowFailed");
        assert_eq!(
            raised[0].labels.get("severity").map(String::as_str),
            Some("critical")
        );
        assert!(raised[0]
            .annotations
            .get("description")
            .unwrap()
            .contains("Researcher"));
    }

    #[tokio::test]
    async fn storage_threshold_alerts_once_per_crossing() {
        let sink = sink();
        for _ in 0..3 {
            let event = CheckpointEvent::new("ckpt_a", "wf_t", CheckpointEventKind::Created)
                .with_size(6_000);
            sink.on_event(&event).await.unwrap();
        }
        let raised = sink.raised();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].name(), "CheckpointStorageHigh");
    }

    #[tokio::test]
    async fn validation_failure_raises_warning() {
        let sink = sink();
        let event = CheckpointEvent::new("ckpt_bad", "wf_t", CheckpointEventKind::Failed)
            .with_reason("state snapshot is not valid JSON");
        sink.on_event(&event).await.unwrap();
        let raised = sink.raised();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].name(), "CheckpointValidationFailed");
    }

    #[tokio::test]
    async fn long_running_alert_uses_elapsed_metadata() {
        let sink = sink();
        let mut metadata = FxHashMap::default();
        metadata.insert("elapsed_seconds".to_string(), serde_json::json!(3600.0));
        let event = WorkflowStateEvent {
            workflow_id: "wf_t".to_string(),
            workflow_type: "research".to_string(),
            previous: WorkflowState::Paused,
            next: WorkflowState::Running,
            at: Utc::now(),
            reason: None,
            metadata,
        };
        sink.on_event(&event).await.unwrap();
        assert_eq!(sink.raised()[0].name(), "WorkflowLongRunning");
    }
}
