/*!
Telemetry sink: an in-process metrics registry fed by the two subjects.

Counters, histograms, and gauges are keyed by metric name plus sorted labels
(`workflow.failed.total{workflow_type=research}`), so assertions in tests and
scrapes in a metrics exporter read the same values.
*/

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::events::{CheckpointEvent, CheckpointEventKind, WorkflowStateEvent};
use super::subject::{Observer, ObserverError};
use crate::workflow::WorkflowState;

fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<(&str, &str)> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

#[derive(Default)]
struct TelemetryState {
    counters: FxHashMap<String, u64>,
    histograms: FxHashMap<String, Vec<f64>>,
    gauges: FxHashMap<String, i64>,
}

/// Point-in-time copy of every recorded metric.
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub counters: FxHashMap<String, u64>,
    pub histograms: FxHashMap<String, Vec<f64>>,
    pub gauges: FxHashMap<String, i64>,
}

/// Metrics observer for workflow-state and checkpoint events.
#[derive(Default)]
pub struct TelemetrySink {
    state: Mutex<TelemetryState>,
}

impl TelemetrySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inc(&self, name: &str, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        let mut state = self.state.lock().expect("telemetry poisoned");
        *state.counters.entry(key).or_insert(0) += 1;
    }

    fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = metric_key(name, labels);
        let mut state = self.state.lock().expect("telemetry poisoned");
        state.histograms.entry(key).or_default().push(value);
    }

    fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = metric_key(name, labels);
        let mut state = self.state.lock().expect("telemetry poisoned");
        *state.gauges.entry(key).or_insert(0) += delta;
    }

    /// Current counter value; zero when never incremented.
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = metric_key(name, labels);
        self.state
            .lock()
            .expect("telemetry poisoned")
            .counters
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Current gauge value; zero when never touched.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = metric_key(name, labels);
        self.state
            .lock()
            .expect("telemetry poisoned")
            .gauges
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of samples recorded for one histogram.
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        let key = metric_key(name, labels);
        self.state
            .lock()
            .expect("telemetry poisoned")
            .histograms
            .get(&key)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock().expect("telemetry poisoned");
        TelemetrySnapshot {
            counters: state.counters.clone(),
            histograms: state.histograms.clone(),
            gauges: state.gauges.clone(),
        }
    }
}

#[async_trait]
impl Observer<WorkflowStateEvent> for TelemetrySink {
    async fn on_event(&self, event: &WorkflowStateEvent) -> Result<(), ObserverError> {
        let labels = [("workflow_type", event.workflow_type.as_str())];

        match event.next {
            WorkflowState::Running => {
                if event.previous == WorkflowState::Queued {
                    self.inc("workflow.started.total", &labels);
                    self.gauge_add("workflow.active", &labels, 1);
                } else if event.previous == WorkflowState::Paused {
                    self.inc("workflow.resumed.total", &labels);
                    self.gauge_add("workflow.active", &labels, 1);
                    self.gauge_add("workflow.paused", &labels, -1);
                    if let Some(seconds) = event.paused_for_seconds() {
                        self.observe("workflow.pause_resume.seconds", &labels, seconds);
                    }
                }
            }
            WorkflowState::Paused => {
                self.inc("workflow.paused.total", &labels);
                self.gauge_add("workflow.paused", &labels, 1);
                self.gauge_add("workflow.active", &labels, -1);
            }
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled => {
                let counter = match event.next {
                    WorkflowState::Completed => "workflow.completed.total",
                    WorkflowState::Failed => "workflow.failed.total",
                    _ => "workflow.cancelled.total",
                };
                self.inc(counter, &labels);
                if event.previous == WorkflowState::Running {
                    self.gauge_add("workflow.active", &labels, -1);
                } else if event.previous == WorkflowState::Paused {
                    self.gauge_add("workflow.paused", &labels, -1);
                }
                if let Some(seconds) = event.elapsed_seconds() {
                    self.observe("workflow.duration.seconds", &labels, seconds);
                }
            }
            WorkflowState::Queued => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Observer<CheckpointEvent> for TelemetrySink {
    async fn on_event(&self, event: &CheckpointEvent) -> Result<(), ObserverError> {
        let workflow_type = event.workflow_type.as_deref().unwrap_or("unknown");
        let automated = if event.automated.unwrap_or(false) {
            "true"
        } else {
            "false"
        };
        let labels = [("automated", automated), ("workflow_type", workflow_type)];

        match event.kind {
            CheckpointEventKind::Created => {
                self.inc("checkpoint.saved.total", &labels);
                self.gauge_add("checkpoint.active", &[], 1);
                if let Some(size) = event.size_bytes {
                    self.observe("checkpoint.size.bytes", &labels, size as f64);
                    self.gauge_add("checkpoint.storage.bytes", &[], size as i64);
                }
                if let Some(latency) = event.latency_ms {
                    self.observe("checkpoint.save.latency_ms", &labels, latency as f64);
                }
            }
            CheckpointEventKind::Loaded => {
                self.inc("checkpoint.loaded.total", &labels);
                if let Some(latency) = event.latency_ms {
                    self.observe("checkpoint.load.latency_ms", &labels, latency as f64);
                }
            }
            CheckpointEventKind::Deleted => {
                self.inc("checkpoint.deleted.total", &labels);
                self.gauge_add("checkpoint.active", &[], -1);
                if let Some(size) = event.size_bytes {
                    self.gauge_add("checkpoint.storage.bytes", &[], -(size as i64));
                }
            }
            CheckpointEventKind::Validated => {
                self.inc("checkpoint.validated.total", &labels);
            }
            CheckpointEventKind::Failed => {
                self.inc("checkpoint.errored.total", &labels);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state_event(previous: WorkflowState, next: WorkflowState) -> WorkflowStateEvent {
        WorkflowStateEvent {
            workflow_id: "wf_t".to_string(),
            workflow_type: "research".to_string(),
            previous,
            next,
            at: Utc::now(),
            reason: None,
            metadata: FxHashMap::default(),
        }
    }

    #[tokio::test]
    async fn lifecycle_counters_and_gauges() {
        let sink = TelemetrySink::new();
        let labels = [("workflow_type", "research")];

        sink.on_event(&state_event(WorkflowState::Queued, WorkflowState::Running))
            .await
            .unwrap();
        assert_eq!(sink.counter("workflow.started.total", &labels), 1);
        assert_eq!(sink.gauge("workflow.active", &labels), 1);

        sink.on_event(&state_event(WorkflowState::Running, WorkflowState::Paused))
            .await
            .unwrap();
        assert_eq!(sink.counter("workflow.paused.total", &labels), 1);
        assert_eq!(sink.gauge("workflow.active", &labels), 0);
        assert_eq!(sink.gauge("workflow.paused", &labels), 1);

        sink.on_event(&state_event(WorkflowState::Paused, WorkflowState::Running))
            .await
            .unwrap();
        assert_eq!(sink.counter("workflow.resumed.total", &labels), 1);
        assert_eq!(sink.gauge("workflow.paused", &labels), 0);

        sink.on_event(&state_event(
            WorkflowState::Running,
            WorkflowState::Completed,
        ))
        .await
        .unwrap();
        assert_eq!(sink.counter("workflow.completed.total", &labels), 1);
        assert_eq!(sink.gauge("workflow.active", &labels), 0);
    }

    #[tokio::test]
    async fn checkpoint_storage_accounting() {
        let sink = TelemetrySink::new();
        let created = CheckpointEvent::new("ckpt_a", "wf_t", CheckpointEventKind::Created)
            .with_size(2048)
            .with_workflow_type("research")
            .with_automated(true);
        sink.on_event(&created).await.unwrap();
        assert_eq!(
            sink.counter(
                "checkpoint.saved.total",
                &[("automated", "true"), ("workflow_type", "research")]
            ),
            1
        );
        assert_eq!(sink.gauge("checkpoint.storage.bytes", &[]), 2048);
        assert_eq!(sink.gauge("checkpoint.active", &[]), 1);

        let deleted = CheckpointEvent::new("ckpt_a", "wf_t", CheckpointEventKind::Deleted)
            .with_size(2048)
            .with_workflow_type("research")
            .with_automated(true);
        sink.on_event(&deleted).await.unwrap();
        assert_eq!(sink.gauge("checkpoint.storage.bytes", &[]), 0);
        assert_eq!(sink.gauge("checkpoint.active", &[]), 0);
    }

    #[test]
    fn metric_keys_sort_labels() {
        assert_eq!(
            metric_key("m", &[("b", "2"), ("a", "1")]),
            "m{a=1,b=2}".to_string()
        );
        assert_eq!(metric_key("m", &[]), "m");
    }
}
