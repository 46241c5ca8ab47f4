use std::sync::Arc;

use crate::agents::Agent;

/// Output marker that short-circuits a pipeline at its clarification stage.
///
/// Matched case-insensitively as a substring; legacy policy, subject to
/// change.
pub const CLARIFICATION_MARKER: &str = "Clarification needed";

/// One stage of a pipeline: an agent id plus the stage behind it.
#[derive(Clone)]
pub struct PipelineStage {
    pub agent_id: String,
    pub agent: Arc<dyn Agent>,
    /// Clarification stages may complete the workflow early when their output
    /// contains [`CLARIFICATION_MARKER`].
    pub clarification: bool,
}

/// An ordered list of stages defining one workflow type.
///
/// There is no branching or cycling: `completed_agents` on the workflow
/// record plus this definition is sufficient to resume.
#[derive(Clone)]
pub struct Pipeline {
    pub workflow_type: String,
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    #[must_use]
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            stages: Vec::new(),
        }
    }

    /// Append a regular stage.
    #[must_use]
    pub fn stage(mut self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.stages.push(PipelineStage {
            agent_id: agent_id.into(),
            agent,
            clarification: false,
        });
        self
    }

    /// Append a clarification stage (eligible for early exit).
    #[must_use]
    pub fn clarification_stage(
        mut self,
        agent_id: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        self.stages.push(PipelineStage {
            agent_id: agent_id.into(),
            agent,
            clarification: true,
        });
        self
    }

    #[must_use]
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn agent_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.agent_id.as_str()).collect()
    }
}
