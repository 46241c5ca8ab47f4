//! Observer fan-out: subjects, event types, and the built-in sinks.
//!
//! Two subjects exist in a running engine — workflow-state transitions and
//! checkpoint events. Sinks subscribe to one or both; sink failures are logged
//! and never propagate back into the executor.

pub mod alerts;
pub mod events;
pub mod subject;
pub mod telemetry;

pub use alerts::{Alert, AlertSink};
pub use events::{CheckpointEvent, CheckpointEventKind, WorkflowStateEvent};
pub use subject::{MemorySink, Observer, ObserverError, Subject, SubscriptionId};
pub use telemetry::{TelemetrySink, TelemetrySnapshot};
