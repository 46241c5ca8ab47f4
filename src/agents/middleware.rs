/*!
Stage middleware: logging, timing, retry.

Middleware is a linear chain of decorators, each holding the next stage and
implementing [`Agent`] itself. Composition runs outermost to innermost as
`Retry → Timing → Logging → Stage`, so every attempt is timed and logged
individually and the retry loop sees raw stage errors.
*/

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Agent, AgentError, AgentResponse, StageContext};
use crate::message::Message;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Minimum wait before retry attempt `k` (1-based): `min(2^k · 100 ms, 2 s)`.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = BACKOFF_BASE_MS
        .checked_shl(attempt)
        .unwrap_or(BACKOFF_CAP_MS)
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// Emits a structured record on stage entry and exit.
pub struct LoggingMiddleware {
    inner: Arc<dyn Agent>,
}

impl LoggingMiddleware {
    #[must_use]
    pub fn new(inner: Arc<dyn Agent>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Agent for LoggingMiddleware {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError> {
        info!(
            workflow_id = %ctx.workflow_id,
            agent = %ctx.agent_id,
            input_messages = messages.len(),
            "stage starting"
        );
        let result = self.inner.run(messages, ctx).await;
        match &result {
            Ok(response) => info!(
                workflow_id = %ctx.workflow_id,
                agent = %ctx.agent_id,
                output_messages = response.messages.len(),
                "stage completed"
            ),
            Err(error) => warn!(
                workflow_id = %ctx.workflow_id,
                agent = %ctx.agent_id,
                error = %error,
                "stage failed"
            ),
        }
        result
    }
}

/// Measures wall-clock latency and warns when it crosses a threshold.
pub struct TimingMiddleware {
    inner: Arc<dyn Agent>,
    warn_threshold: Duration,
}

impl TimingMiddleware {
    #[must_use]
    pub fn new(inner: Arc<dyn Agent>, warn_threshold: Duration) -> Self {
        Self {
            inner,
            warn_threshold,
        }
    }
}

#[async_trait]
impl Agent for TimingMiddleware {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError> {
        let started = Instant::now();
        let result = self.inner.run(messages, ctx).await;
        let elapsed = started.elapsed();
        if elapsed > self.warn_threshold {
            warn!(
                workflow_id = %ctx.workflow_id,
                agent = %ctx.agent_id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.warn_threshold.as_millis() as u64,
                "stage exceeded latency threshold"
            );
        }
        result
    }
}

/// Re-invokes the wrapped stage on error, up to a fixed attempt budget.
///
/// Cancellation aborts immediately; after the last failure the original error
/// is returned unchanged.
pub struct RetryMiddleware {
    inner: Arc<dyn Agent>,
    max_attempts: u32,
}

impl RetryMiddleware {
    #[must_use]
    pub fn new(inner: Arc<dyn Agent>, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl Agent for RetryMiddleware {
    async fn run(
        &self,
        messages: &[Message],
        ctx: &StageContext,
    ) -> Result<AgentResponse, AgentError> {
        let mut attempt = 1;
        loop {
            match self.inner.run(messages, ctx).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if error.is_cancellation() || ctx.cancel.is_cancelled() {
                        return Err(error);
                    }
                    if attempt >= self.max_attempts {
                        return Err(error);
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        workflow_id = %ctx.workflow_id,
                        agent = %ctx.agent_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "stage attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if ctx.cancel.is_cancelled() {
                        return Err(error);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Build the standard decoration chain around a raw stage.
#[must_use]
pub fn decorate(
    stage: Arc<dyn Agent>,
    max_attempts: u32,
    slow_threshold: Duration,
) -> Arc<dyn Agent> {
    let logged = Arc::new(LoggingMiddleware::new(stage));
    let timed = Arc::new(TimingMiddleware::new(logged, slow_threshold));
    Arc::new(RetryMiddleware::new(timed, max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStage {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Agent for FlakyStage {
        async fn run(
            &self,
            _messages: &[Message],
            ctx: &StageContext,
        ) -> Result<AgentResponse, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(AgentError::Execution {
                    agent_id: ctx.agent_id.clone(),
                    message: format!("transient failure {call}"),
                })
            } else {
                Ok(AgentResponse::from_text("done"))
            }
        }
    }

    fn ctx() -> StageContext {
        StageContext {
            workflow_id: "wf_test".to_string(),
            agent_id: "Researcher".to_string(),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(4), Duration::from_millis(1_600));
        assert_eq!(backoff_delay(5), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(30), Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_within_budget() {
        let stage = Arc::new(FlakyStage {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let retry = RetryMiddleware::new(stage.clone(), 3);
        let response = retry.run(&[], &ctx()).await.unwrap();
        assert_eq!(response.final_text(), "done");
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_returns_original_error() {
        let stage = Arc::new(FlakyStage {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let retry = RetryMiddleware::new(stage.clone(), 3);
        let error = retry.run(&[], &ctx()).await.unwrap_err();
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
        // Last attempt's error surfaces unchanged.
        assert!(error.to_string().contains("transient failure 3"));
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let stage = Arc::new(FlakyStage {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let retry = RetryMiddleware::new(stage.clone(), 5);
        let ctx = ctx();
        ctx.cancel.cancel();
        let _ = retry.run(&[], &ctx).await.unwrap_err();
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decorate_applies_retry_budget() {
        let stage = Arc::new(FlakyStage {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let decorated = decorate(stage.clone(), 2, Duration::from_secs(30));
        let response = decorated.run(&[], &ctx()).await.unwrap();
        assert_eq!(response.final_text(), "done");
        assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
    }
}
