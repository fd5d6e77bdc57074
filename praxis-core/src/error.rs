//! Error types for Praxis setup and configuration
//!
//! The dispatch path itself never fails with these; every execution outcome
//! is encoded in [`crate::tools::ExecutionResult`].

/// Result type for Praxis operations
pub type Result<T> = std::result::Result<T, PraxisError>;

/// Error types for Praxis framework
#[derive(Debug, thiserror::Error)]
pub enum PraxisError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Capability registration rejected
    #[error("Registration error: {0}")]
    Registration(#[from] crate::tools::RegistryError),

    /// Sandbox backend could not be constructed or reached
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for PraxisError {
    fn from(s: String) -> Self {
        PraxisError::Other(s)
    }
}

impl From<&str> for PraxisError {
    fn from(s: &str) -> Self {
        PraxisError::Other(s.to_string())
    }
}

impl From<figment::Error> for PraxisError {
    fn from(err: figment::Error) -> Self {
        PraxisError::Configuration(err.to_string())
    }
}
