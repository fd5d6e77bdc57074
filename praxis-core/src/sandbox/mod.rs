//! Isolated code execution
//!
//! Submitted Python is checked by [`CodeValidator`] and then run by a
//! [`SandboxBackend`]: an ephemeral container ([`ContainerBackend`]) or a
//! one-shot Kubernetes Job ([`JobBackend`]). [`SandboxSelector`] picks the
//! first available backend in preference order and keeps that binding.
//! [`CodeInterpreter`] exposes the whole pipeline as the `code_interpreter`
//! capability.

mod backend;
mod config;
mod docker;
mod interpreter;
mod kubernetes;
mod output;
mod selector;
mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    BackendKind, BoxedBackend, SandboxBackend, SandboxContext, SandboxError, ensure_python,
};
pub use config::{DEFAULT_ALLOWED_IMPORTS, SandboxConfig};
pub use docker::ContainerBackend;
pub use interpreter::{CODE_INTERPRETER, CodeInterpreter};
pub use kubernetes::{JobApi, JobBackend, JobPhase, JobPod, KubeHttpClient};
pub use output::{
    CappedBuffer, ERROR_MARKER, RESULT_END_MARKER, RESULT_START_MARKER, SUCCESS_MARKER,
    SandboxResult, TRUNCATION_MARKER, collection_limit, content_hash, truncate_output,
};
pub use selector::SandboxSelector;
pub use validator::{
    BASE_BLOCKED_PATTERNS, CodeValidator, NETWORK_BLOCKED_PATTERNS, RejectionKind,
    ValidationFailure,
};
