//! Timeout and retry around a single handler
//!
//! Each attempt runs under its own timeout with a child cancellation token.
//! When an attempt times out or the caller cancels, the token fires and the
//! handler gets `cleanup_grace` to release what it holds before the attempt
//! future is dropped. Backoff doubles after each failed attempt.

use super::handler::{CapabilityHandler, HandlerError, HandlerOutput, InvocationContext};
use super::result::ErrorKind;
use crate::config::DispatcherConfig;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub retry_count: u32,
    /// Delay before the first retry
    pub retry_delay: Duration,
    /// Time an interrupted handler gets to clean up
    pub cleanup_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 1,
            retry_delay: Duration::from_secs(1),
            cleanup_grace: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy from dispatcher settings
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            retry_delay: config.retry_delay,
            cleanup_grace: config.cleanup_grace,
        }
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Backoff after the zero-based `attempt` failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Final result of a retried execution
#[derive(Debug)]
pub struct RetryOutcome {
    /// Last attempt's result
    pub result: Result<HandlerOutput, HandlerError>,
    /// Attempts made
    pub attempts: u32,
}

/// Run `handler` until it succeeds, fails terminally or runs out of attempts
pub async fn execute_with_retry(
    policy: &RetryPolicy,
    handler: &dyn CapabilityHandler,
    args: &Value,
    base: &InvocationContext,
    cancel: &CancellationToken,
) -> RetryOutcome {
    let mut attempts = 0;
    loop {
        let attempt = attempts;
        attempts += 1;

        let err = match run_attempt(policy, handler, args.clone(), base, attempt, cancel).await {
            Ok(output) => {
                return RetryOutcome {
                    result: Ok(output),
                    attempts,
                };
            }
            Err(err) => err,
        };

        if !err.kind.is_retryable() || attempt >= policy.retry_count || cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(err),
                attempts,
            };
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            capability = %base.capability,
            attempt = attempts,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed; retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(HandlerError::new(
                        ErrorKind::Cancelled,
                        "Cancelled while waiting to retry",
                    )),
                    attempts,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_attempt(
    policy: &RetryPolicy,
    handler: &dyn CapabilityHandler,
    args: Value,
    base: &InvocationContext,
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<HandlerOutput, HandlerError> {
    let child = cancel.child_token();
    let mut ctx = base.clone();
    ctx.attempt = attempt;
    ctx.cancellation = child.clone();
    let timeout = ctx.timeout;

    debug!(capability = %ctx.capability, attempt, "Starting attempt");

    let fut = AssertUnwindSafe(handler.invoke(args, &ctx)).catch_unwind();
    tokio::pin!(fut);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let interrupted = tokio::select! {
        biased;
        res = &mut fut => return res.unwrap_or_else(|panic| Err(panic_error(panic))),
        _ = cancel.cancelled() => HandlerError::new(ErrorKind::Cancelled, "Execution cancelled"),
        _ = &mut deadline => HandlerError::new(
            ErrorKind::Timeout,
            format!("Execution timed out after {:?}", timeout),
        ),
    };

    child.cancel();
    if tokio::time::timeout(policy.cleanup_grace, &mut fut).await.is_err() {
        warn!(
            capability = %ctx.capability,
            grace_ms = policy.cleanup_grace.as_millis() as u64,
            "Handler did not stop within cleanup grace"
        );
    }

    Err(interrupted)
}

fn panic_error(panic: Box<dyn Any + Send>) -> HandlerError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::unknown(format!("Handler panicked: {}", detail))
}
