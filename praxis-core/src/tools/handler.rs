//! Handler contract between the dispatcher and capability implementations

use super::result::ErrorKind;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-attempt context passed to handlers
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Capability being invoked
    pub capability: String,

    /// Trace ID for correlation
    pub trace_id: String,

    /// Caller making the request
    pub caller_id: Option<String>,

    /// Simulation tick of the request
    pub tick: Option<u64>,

    /// Zero-based attempt number
    pub attempt: u32,

    /// Time this attempt is allowed
    pub timeout: Duration,

    /// Cancelled when the attempt times out or the caller gives up.
    /// Handlers holding external resources must release them when it fires.
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    /// Create a context for the first attempt
    pub fn new(capability: impl Into<String>, trace_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            capability: capability.into(),
            trace_id: trace_id.into(),
            caller_id: None,
            tick: None,
            attempt: 0,
            timeout,
            cancellation: CancellationToken::new(),
        }
    }

    /// Set caller ID
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Set tick
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Set cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Successful handler output
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    /// Structured output value
    pub output: Option<Value>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Merged into the result metadata
    pub metadata: Map<String, Value>,
}

impl HandlerOutput {
    /// Create output carrying a value
    pub fn new(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }

    /// Builder: set stdout
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Builder: set stderr
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Builder: add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Structured handler failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Failure category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Captured standard error
    pub stderr: String,
    /// Merged into the result metadata
    pub metadata: Map<String, Value>,
}

impl HandlerError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: String::new(),
            metadata: Map::new(),
        }
    }

    /// The work ran and failed
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    /// Arguments were unusable
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }

    /// Unexpected internal failure
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownError, message)
    }

    /// Builder: set stderr
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Builder: add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Executable implementation bound to a capability name
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Run one attempt
    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> Result<HandlerOutput, HandlerError>;

    /// Cheap static check run before a concurrency slot is taken.
    /// Rejections here are terminal and never retried.
    fn preflight(&self, _args: &Value) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Release long-lived resources when the dispatcher shuts down
    async fn shutdown(&self) {}
}

/// Shared handler handle
pub type BoxedHandler = Arc<dyn CapabilityHandler>;

/// Adapts an async closure into a handler
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> Result<HandlerOutput, HandlerError> {
        (self.f)(args, ctx.clone()).await
    }
}
