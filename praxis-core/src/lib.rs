//! # Praxis - Capability Execution for Simulated Agents
//!
//! Praxis runs named capabilities on behalf of agents and turns every call
//! into a structured, audited result:
//! - Name-keyed capability registry with JSON-schema descriptors
//! - Per-capability circuit breakers and a global concurrency limit
//! - Timeouts, exponential backoff and active cancellation
//! - Sandboxed Python execution in containers or Kubernetes Jobs
//! - Static code validation (denylist and import allow-list)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use praxis_core::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = PraxisConfig::load()?;
//!     let dispatcher = Dispatcher::new(config.dispatcher.clone());
//!
//!     let selector = Arc::new(SandboxSelector::from_settings(&config.backends));
//!     let interpreter = CodeInterpreter::new(config.sandbox.clone(), selector);
//!     dispatcher.register(CodeInterpreter::spec(), Arc::new(interpreter))?;
//!
//!     let result = dispatcher
//!         .dispatch(
//!             "code_interpreter",
//!             json!({ "code": "import math\n_result = math.sqrt(16)" }),
//!             DispatchOptions::new().with_caller("npc-1").with_tick(42),
//!         )
//!         .await;
//!     println!("{}", result.output_text());
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **tools**: registry, dispatcher, breaker, limiter, retry and audit
//! - **sandbox**: validator, backends, selector and the code interpreter
//! - **config**: layered configuration (defaults, files, environment)
//! - **telemetry**: `tracing` subscriber setup

pub mod config;
pub mod error;
pub mod sandbox;
pub mod telemetry;
pub mod tools;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        BackendSettings, ContainerSettings, DispatcherConfig, JobSettings, LoggingConfig,
        PraxisConfig,
    };
    pub use crate::error::{PraxisError, Result};
    pub use crate::sandbox::{
        BackendKind, CodeInterpreter, CodeValidator, ContainerBackend, JobBackend, SandboxBackend,
        SandboxConfig, SandboxContext, SandboxError, SandboxResult, SandboxSelector,
    };
    pub use crate::telemetry::init_tracing;
    pub use crate::tools::{
        AuditEntry, AuditSink, CapabilityHandler, CapabilitySpec, DispatchOptions, Dispatcher,
        ErrorKind, ExecutionResult, ExecutionStatus, FnHandler, HandlerError, HandlerOutput,
        InvocationContext, MemoryAuditSink, RiskLevel, SafetyProfile, TracingAuditSink,
    };
}
