//! Step dispatch: the uniform contract between the engine and external
//! step executors, plus per-attempt timeout and retry handling.

use crate::events::{EventBus, EventKind};
use crate::registry::StepDescriptor;
use crate::types::{NodeId, NodeSpec, RunId, StepErrorKind};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// What the engine hands to an external executor for one dispatch
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub step_type: String,
    pub config: Value,
    /// Working-data subset: outputs of the taken upstream edges
    pub input: Value,
    pub attempt: u32,
}

/// What an executor reports back
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success { output: Value },
    Failure { error_kind: StepErrorKind, message: String },
}

/// External step executor. Integration adapters (email, chat, social
/// posting, scraping) implement this; the engine never hard-codes a
/// step type.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> anyhow::Result<StepOutcome>;
}

/// Terminal outcome of a dispatch, after retries
#[derive(Debug, Clone)]
pub(crate) enum FinalOutcome {
    Succeeded { output: Value },
    Failed { error_kind: StepErrorKind, message: String },
}

#[derive(Debug, Clone)]
pub(crate) struct DispatchResult {
    pub node_id: NodeId,
    /// Attempt number that produced the terminal outcome (1-based)
    pub attempt: u32,
    pub outcome: FinalOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub cancel_grace: Duration,
}

/// Drive one node to a terminal outcome: invoke the executor under the
/// step timeout, retrying failed attempts (fixed delay) while the
/// registry allows and the retry budget lasts. A timeout is a failure
/// like any other. Cancellation is cooperative: the in-flight call gets
/// a bounded grace period, after which the step is failed as
/// `CancelledWhileRunning` rather than silently dropped.
pub(crate) async fn dispatch_step(
    events: EventBus,
    runner: Arc<dyn StepRunner>,
    descriptor: Arc<StepDescriptor>,
    node: NodeSpec,
    run_id: RunId,
    input: Value,
    first_attempt: u32,
    policy: RetryPolicy,
    mut cancel: watch::Receiver<bool>,
) -> DispatchResult {
    let started_at = Utc::now();
    let step_timeout =
        Duration::from_secs(node.timeout_secs.unwrap_or(descriptor.default_timeout_secs));
    let mut attempt = first_attempt.max(1);

    let finish = |attempt: u32, started_at, outcome| DispatchResult {
        node_id: node.id.clone(),
        attempt,
        outcome,
        started_at,
        ended_at: Utc::now(),
    };

    loop {
        if let Err(e) = events
            .emit(
                run_id,
                EventKind::StepStarted {
                    node_id: node.id.clone(),
                    attempt,
                },
            )
            .await
        {
            tracing::warn!("failed to record step start for {}: {e:#}", node.id);
        }

        let attempt_start = std::time::Instant::now();
        let ctx = StepContext {
            run_id,
            node_id: node.id.clone(),
            step_type: node.step_type.clone(),
            config: node.config.clone(),
            input: input.clone(),
            attempt,
        };

        let work = timeout(step_timeout, runner.execute(ctx));
        tokio::pin!(work);

        let raw = tokio::select! {
            res = &mut work => Some(res),
            _ = cancel_requested(&mut cancel) => None,
        };

        let raw = match raw {
            Some(res) => res,
            // Cancellation requested while the executor call was in
            // flight: bounded grace to let it confirm, then give up
            None => match timeout(policy.cancel_grace, &mut work).await {
                Ok(res) => res,
                Err(_) => {
                    let message = "executor did not confirm abort within grace period".to_string();
                    emit_failure(&events, run_id, &node.id, attempt, StepErrorKind::CancelledWhileRunning, &message, false).await;
                    return finish(
                        attempt,
                        started_at,
                        FinalOutcome::Failed {
                            error_kind: StepErrorKind::CancelledWhileRunning,
                            message,
                        },
                    );
                }
            },
        };

        let (error_kind, message) = match raw {
            Ok(Ok(StepOutcome::Success { output })) => {
                let duration_ms = attempt_start.elapsed().as_millis() as u64;
                if let Err(e) = events
                    .emit(
                        run_id,
                        EventKind::StepCompleted {
                            node_id: node.id.clone(),
                            attempt,
                            duration_ms,
                        },
                    )
                    .await
                {
                    tracing::warn!("failed to record step completion for {}: {e:#}", node.id);
                }
                return finish(attempt, started_at, FinalOutcome::Succeeded { output });
            }
            Ok(Ok(StepOutcome::Failure { error_kind, message })) => (error_kind, message),
            Ok(Err(e)) => (StepErrorKind::ExecutorFailure, format!("{e:#}")),
            Err(_) => (
                StepErrorKind::Timeout,
                format!("step timed out after {}s", step_timeout.as_secs()),
            ),
        };

        let will_retry =
            descriptor.retry_allowed() && attempt <= policy.max_retries && !*cancel.borrow();

        emit_failure(&events, run_id, &node.id, attempt, error_kind, &message, will_retry).await;

        if !will_retry {
            return finish(attempt, started_at, FinalOutcome::Failed { error_kind, message });
        }

        tracing::info!(
            "retrying step {} after {}s (attempt {} of {})",
            node.id,
            policy.retry_delay.as_secs(),
            attempt + 1,
            policy.max_retries + 1,
        );

        tokio::select! {
            _ = tokio::time::sleep(policy.retry_delay) => {}
            _ = cancel_requested(&mut cancel) => {
                let message = "cancelled while waiting to retry".to_string();
                return finish(
                    attempt,
                    started_at,
                    FinalOutcome::Failed {
                        error_kind: StepErrorKind::CancelledWhileRunning,
                        message,
                    },
                );
            }
        }

        attempt += 1;
    }
}

async fn emit_failure(
    events: &EventBus,
    run_id: RunId,
    node_id: &NodeId,
    attempt: u32,
    error_kind: StepErrorKind,
    message: &str,
    will_retry: bool,
) {
    if let Err(e) = events
        .emit(
            run_id,
            EventKind::StepFailed {
                node_id: node_id.clone(),
                attempt,
                error_kind,
                error: message.to_string(),
                will_retry,
            },
        )
        .await
    {
        tracing::warn!("failed to record step failure for {node_id}: {e:#}");
    }
}

/// Resolves when cancellation is requested; pends forever otherwise.
async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
    // Sender gone: this run can no longer be cancelled
    std::future::pending::<()>().await;
}
