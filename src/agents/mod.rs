/*!
The stage contract.

A stage (agent) is any object exposing one asynchronous operation:
`run(messages, ctx) → AgentResponse`. Stages are stateless across calls —
identical input must be safe to call again, which is what makes the retry
middleware sound. Everything else (logging, timing, retries) is layered on by
[`middleware`] without changing this contract.
*/

pub mod middleware;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::message::Message;

/// Errors surfaced by a stage invocation.
#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("agent {agent_id} failed: {message}")]
    #[diagnostic(code(cairn::agents::execution))]
    Execution { agent_id: String, message: String },

    #[error("agent {agent_id} timed out after {timeout_ms} ms")]
    #[diagnostic(
        code(cairn::agents::timeout),
        help("Raise the stage timeout for this agent in EngineConfig.")
    )]
    Timeout { agent_id: String, timeout_ms: u128 },

    #[error("agent {agent_id} was cancelled")]
    #[diagnostic(code(cairn::agents::cancelled))]
    Cancelled { agent_id: String },
}

impl AgentError {
    /// True when retrying cannot help (the workflow is being torn down).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AgentError::Cancelled { .. })
    }
}

/// What a stage returns: the messages it wants appended to the workflow log.
#[derive(Clone, Debug, Default)]
pub struct AgentResponse {
    pub messages: Vec<Message>,
}

impl AgentResponse {
    /// Response consisting of a single assistant message.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::assistant(text)],
        }
    }

    /// The stage's textual output: the content of its last message.
    #[must_use]
    pub fn final_text(&self) -> String {
        self.messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

/// Execution context handed to every stage invocation.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub workflow_id: String,
    pub agent_id: String,
    /// Per-workflow cancellation token; stages should honor it promptly.
    pub cancel: CancelToken,
}

/// One step of a pipeline.
///
/// Implementations must be stateless across calls: the same `messages` input
/// (plus the agent's own fixed configuration) must be safe to run again.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_text_is_last_message() {
        let response = AgentResponse {
            messages: vec![
                Message::assistant("thinking"),
                Message::assistant("Facts: …"),
            ],
        };
        assert_eq!(response.final_text(), "Facts: …");
    }

    #[test]
    fn empty_response_has_empty_text() {
        assert_eq!(AgentResponse::default().final_text(), "");
    }
}
