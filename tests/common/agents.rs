//! Deterministic stage implementations for driving the executor in tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use cairn::agents::{Agent, AgentError, AgentResponse, StageContext};
use cairn::message::Message;

/// Returns a fixed output and counts its invocations.
pub struct ScriptedAgent {
    pub output: String,
    pub calls: Arc<AtomicU32>,
}

impl ScriptedAgent {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(
        &self,
        _messages: &[Message],
        _ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentResponse::from_text(&self.output))
    }
}

/// Fails on every invocation.
pub struct FailingAgent {
    pub message: String,
    pub calls: Arc<AtomicU32>,
}

impl FailingAgent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FailingAgent {
    async fn run(
        &self,
        _messages: &[Message],
        ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Execution {
            agent_id: ctx.agent_id.clone(),
            message: self.message.clone(),
        })
    }
}

/// Announces when it starts, then blocks until the test releases a permit.
/// Honors cancellation while blocked, like a well-behaved stage.
pub struct GatedAgent {
    pub output: String,
    pub started: mpsc::UnboundedSender<String>,
    pub gate: Arc<Semaphore>,
    pub calls: Arc<AtomicU32>,
}

impl GatedAgent {
    /// Returns the agent plus the channel announcing entries and the gate the
    /// test releases permits into.
    pub fn new(
        output: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<String>, Arc<Semaphore>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                output: output.into(),
                started,
                gate: Arc::clone(&gate),
                calls: Arc::new(AtomicU32::new(0)),
            },
            started_rx,
            gate,
        )
    }
}

#[async_trait]
impl Agent for GatedAgent {
    async fn run(
        &self,
        _messages: &[Message],
        ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.send(ctx.agent_id.clone());
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(AgentError::Cancelled {
                agent_id: ctx.agent_id.clone(),
            }),
            permit = self.gate.acquire() => {
                permit
                    .map_err(|_| AgentError::Execution {
                        agent_id: ctx.agent_id.clone(),
                        message: "gate closed".to_string(),
                    })?
                    .forget();
                Ok(AgentResponse::from_text(&self.output))
            }
        }
    }
}
