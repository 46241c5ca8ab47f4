//! Shared fixtures for the integration suites.
#![allow(dead_code)]

pub mod agents;
pub mod fixtures;

#[allow(unused_imports)]
pub use agents::{FailingAgent, GatedAgent, ScriptedAgent};
#[allow(unused_imports)]
pub use fixtures::{research_pipeline, test_config, FailingBackend, TestEngine};
