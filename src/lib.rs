//! ```text
//! WorkflowService ─┬─► WorkflowExecutor ─► Pipeline stages (Agent + middleware)
//!                  │          │
//!                  │          ├─► CheckpointStore ─► MemoryBackend / FileBackend
//!                  │          │
//!                  │          └─► WorkflowController (signals / states / tokens)
//!                  │                        │
//!                  └────────────────────────┴─► Subjects ─► TelemetrySink / AlertSink
//! ```
//!
//! Cairn is the execution core of a long-running, multi-stage research
//! workflow engine: it drives linear agent pipelines safely across failures
//! and user intervention — start, advance, pause at stage boundaries, persist
//! checkpoints, resume from them, cancel, observe. Stages are black boxes
//! behind the [`agents::Agent`] trait; everything around them is the control
//! plane this crate implements.

pub mod agents;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod executor;
pub mod message;
pub mod observers;
pub mod service;
pub mod utils;
pub mod workflow;
