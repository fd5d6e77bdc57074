//! Capability dispatch for simulated agents
//!
//! This module turns a name and a JSON argument map into a structured
//! [`ExecutionResult`]. Key features:
//! - Name-keyed capability registry with schema-checked arguments
//! - Per-capability circuit breakers with a single half-open probe
//! - A global concurrency limit across all capabilities
//! - Per-attempt timeouts, exponential backoff and active cancellation
//! - One audit entry per call, recording argument names but never values
//!
//! # Example
//!
//! ```rust,no_run
//! use praxis_core::config::DispatcherConfig;
//! use praxis_core::tools::{
//!     CapabilitySpec, DispatchOptions, Dispatcher, FnHandler, HandlerError, HandlerOutput,
//!     InvocationContext,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::default());
//! dispatcher.register(
//!     CapabilitySpec::new("echo", "Echo the arguments back"),
//!     Arc::new(FnHandler::new(|args: Value, _ctx: InvocationContext| async move {
//!         Ok::<_, HandlerError>(HandlerOutput::new(args))
//!     })),
//! )?;
//!
//! let result = dispatcher
//!     .dispatch("echo", json!({ "msg": "hi" }), DispatchOptions::new().with_caller("npc-1"))
//!     .await;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

mod audit;
mod circuit_breaker;
mod dispatcher;
mod handler;
mod limiter;
mod registry;
mod result;
mod retry;
mod spec;

pub use audit::{AUDIT_TARGET, AuditEntry, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use circuit_breaker::{
    BreakerOutcome, BreakerPermit, BreakerRejection, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitState,
};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use handler::{
    BoxedHandler, CapabilityHandler, FnHandler, HandlerError, HandlerOutput, InvocationContext,
};
pub use limiter::{ConcurrencyLimiter, ConcurrencySlot, LimiterError};
pub use registry::{CapabilityRegistry, Registration, RegistryError, validate_spec};
pub use result::{ErrorKind, ExecutionResult, ExecutionStatus};
pub use retry::{RetryOutcome, RetryPolicy, execute_with_retry};
pub use spec::{CapabilitySpec, MAX_DESCRIPTION_LEN, MAX_NAME_LEN, RiskLevel, SafetyProfile};
