//! Audit trail of dispatch outcomes
//!
//! One [`AuditEntry`] is written per dispatch. Field names are consumed by
//! downstream log pipelines and must stay stable. Argument values are never
//! recorded, only their key names.

use super::result::{ErrorKind, ExecutionResult, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Target used by [`TracingAuditSink`]
pub const AUDIT_TARGET: &str = "praxis::audit";

/// One audited dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
    /// Capability that was requested
    pub capability: String,
    /// Caller that made the request
    pub caller_id: Option<String>,
    /// Simulation tick of the request
    pub tick: Option<u64>,
    /// Resulting status
    pub status: ExecutionStatus,
    /// Execution time in milliseconds
    pub execution_time: u64,
    /// Correlation id
    pub trace_id: String,
    /// Top-level argument names
    pub argument_keys: Vec<String>,
    /// Whether output was present
    pub has_output: bool,
    /// Failure category
    pub error_kind: Option<ErrorKind>,
    /// Hash of submitted code, for sandboxed capabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
    /// Whether sandbox output was truncated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

impl AuditEntry {
    /// Build an entry from a finished result and the call's arguments
    pub fn from_result(
        result: &ExecutionResult,
        args: &Value,
        caller_id: Option<&str>,
        tick: Option<u64>,
    ) -> Self {
        let mut argument_keys: Vec<String> = args
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        argument_keys.sort();

        Self {
            timestamp: result.completed_at,
            capability: result.capability_name.clone(),
            caller_id: caller_id.map(str::to_string),
            tick,
            status: result.status,
            execution_time: result.execution_time.as_millis() as u64,
            trace_id: result.trace_id.clone(),
            argument_keys,
            has_output: result.output.as_ref().is_some_and(|v| !v.is_null()),
            error_kind: result.error_kind,
            code_hash: result.code_hash().map(str::to_string),
            truncated: result.truncated(),
        }
    }
}

/// Destination for audit entries.
///
/// `record` runs on the dispatch path: it must return quickly and must not
/// fail. Sinks that need I/O should hand entries to a background task.
pub trait AuditSink: Send + Sync {
    /// Write one entry
    fn record(&self, entry: &AuditEntry);
}

/// Writes entries as single-line JSON through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => info!(target: AUDIT_TARGET, entry = %json, "capability audit"),
            Err(e) => warn!(target: AUDIT_TARGET, error = %e, "Failed to serialize audit entry"),
        }
    }
}

/// Keeps entries in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of entries recorded
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }
}
