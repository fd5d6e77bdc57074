//! Dispatch outcome types
//!
//! Every dispatch produces exactly one [`ExecutionResult`]. Failures are data:
//! `status` says how the call ended and `error_kind` says why.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// How a dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The handler produced output
    Success,
    /// The call failed for any reason other than time or cancellation
    Error,
    /// The final attempt exceeded its timeout
    Timeout,
    /// The caller cancelled or the dispatcher shut down
    Cancelled,
}

impl ExecutionStatus {
    /// Status reported for a failure of `kind`
    pub fn for_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout => ExecutionStatus::Timeout,
            ErrorKind::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Error,
        }
    }

    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure taxonomy surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No capability is registered under the name
    CapabilityNotFound,
    /// The capability's breaker is open
    CircuitBreakerOpen,
    /// Arguments do not satisfy the capability's input schema
    InvalidArguments,
    /// Code contained a denylisted pattern
    BlockedPattern,
    /// Code imported a module outside the allow-list
    DisallowedImport,
    /// Code did not parse
    SyntaxError,
    /// An attempt exceeded its timeout
    Timeout,
    /// The work ran and failed
    ExecutionFailed,
    /// No sandbox backend could accept the work
    BackendUnavailable,
    /// The caller cancelled
    Cancelled,
    /// The handler failed unexpectedly
    UnknownError,
}

impl ErrorKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CapabilityNotFound => "CapabilityNotFound",
            ErrorKind::CircuitBreakerOpen => "CircuitBreakerOpen",
            ErrorKind::InvalidArguments => "InvalidArguments",
            ErrorKind::BlockedPattern => "BlockedPattern",
            ErrorKind::DisallowedImport => "DisallowedImport",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ExecutionFailed => "ExecutionFailed",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::UnknownError => "UnknownError",
        }
    }

    /// A static validation rejection
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorKind::BlockedPattern | ErrorKind::DisallowedImport | ErrorKind::SyntaxError
        )
    }

    /// Worth another attempt within the retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ExecutionFailed | ErrorKind::UnknownError
        )
    }

    /// Counts against the capability's breaker.
    ///
    /// Rejections of the request itself and caller cancellation say nothing
    /// about the capability's health.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ExecutionFailed
                | ErrorKind::UnknownError
                | ErrorKind::BackendUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured outcome of one dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Capability that was requested
    pub capability_name: String,

    /// How the call ended
    pub status: ExecutionStatus,

    /// Handler output; authoritative when `status` is success
    #[serde(default)]
    pub output: Option<Value>,

    /// Captured standard output
    #[serde(default)]
    pub stdout: String,

    /// Captured standard error
    #[serde(default)]
    pub stderr: String,

    /// Failure description; authoritative when `status` is not success
    #[serde(default)]
    pub error_message: Option<String>,

    /// Failure category
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,

    /// Wall-clock time from dispatch to result
    #[serde(with = "duration_millis")]
    pub execution_time: Duration,

    /// When dispatch began
    pub started_at: DateTime<Utc>,

    /// When the result was produced
    pub completed_at: DateTime<Utc>,

    /// Correlation id, generated when the caller supplies none
    pub trace_id: String,

    /// Open metadata (attempts, code_hash, truncated, backend)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionResult {
    /// Check if the execution was successful
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Check if the execution failed
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// Handler attempts made, zero when rejected before execution
    pub fn attempts(&self) -> u32 {
        self.metadata
            .get("attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// Content hash recorded by a sandboxed capability
    pub fn code_hash(&self) -> Option<&str> {
        self.metadata.get("code_hash").and_then(Value::as_str)
    }

    /// Truncation flag recorded by a sandboxed capability
    pub fn truncated(&self) -> Option<bool> {
        self.metadata.get("truncated").and_then(Value::as_bool)
    }

    /// Text rendering for model consumption
    pub fn output_text(&self) -> String {
        if self.is_error() {
            let mut text = format!(
                "Error: {}",
                self.error_message.as_deref().unwrap_or("Unknown error")
            );
            if !self.stderr.is_empty() {
                text.push_str("\nStderr: ");
                text.push_str(&self.stderr);
            }
            return text;
        }

        let mut parts = Vec::new();
        match &self.output {
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(Value::Null) | None => {}
            Some(other) => parts.push(
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            ),
        }
        if !self.stdout.is_empty() {
            parts.push(format!("Stdout:\n{}", self.stdout));
        }

        if parts.is_empty() {
            "Capability executed successfully with no output.".to_string()
        } else {
            parts.join("\n")
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
