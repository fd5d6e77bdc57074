//! Sandbox backend contract

use super::config::SandboxConfig;
use super::output::SandboxResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identifies a backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Ephemeral container on a local or remote Docker daemon
    Container,
    /// One-shot batch job on a Kubernetes cluster
    Job,
}

impl BackendKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Job => "job",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-execution inputs handed to a backend
#[derive(Debug, Clone)]
pub struct SandboxContext {
    /// Limits for this execution
    pub config: SandboxConfig,
    /// Cancelled when the caller stops waiting; backends must tear down
    pub cancellation: CancellationToken,
    /// Correlation id of the dispatch
    pub trace_id: String,
    /// Caller identity
    pub caller_id: Option<String>,
    /// Simulation tick of the request
    pub tick: Option<u64>,
}

impl SandboxContext {
    /// Create a context with a fresh cancellation token
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            caller_id: None,
            tick: None,
        }
    }

    /// Set the cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Set the trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Set the caller id
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }
}

/// Backend infrastructure failures.
///
/// Code that runs and fails is not an error here; it is a [`SandboxResult`]
/// with `success == false`.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The backend cannot be reached
    #[error("Sandbox backend unavailable: {0}")]
    Unavailable(String),

    /// The backend cannot run this language
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// The wall-clock limit elapsed and the execution was terminated
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled and the execution was terminated
    #[error("Execution cancelled")]
    Cancelled,

    /// Any other backend failure
    #[error("Sandbox backend error: {0}")]
    Backend(String),
}

/// An isolated code execution environment
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Which implementation this is
    fn kind(&self) -> BackendKind;

    /// Run one submission under `ctx.config` limits.
    ///
    /// Implementations hash the code before running it, kill the workload
    /// when `ctx.config.timeout` elapses or `ctx.cancellation` fires, and
    /// release every resource they created before returning.
    async fn execute(
        &self,
        code: &str,
        language: &str,
        ctx: &SandboxContext,
    ) -> Result<SandboxResult, SandboxError>;

    /// Whether the backend can currently accept work
    async fn is_available(&self) -> bool;

    /// Release long-lived resources
    async fn cleanup(&self) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// Shared backend handle
pub type BoxedBackend = Arc<dyn SandboxBackend>;

/// Reject languages the Python wrapper cannot run
pub fn ensure_python(language: &str) -> Result<(), SandboxError> {
    match language.to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => Ok(()),
        other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
    }
}
