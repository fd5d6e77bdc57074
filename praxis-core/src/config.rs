//! Configuration types for Praxis
//!
//! Configuration is layered with figment. From lowest to highest precedence:
//! compiled defaults, `$XDG_CONFIG_HOME/praxis/praxis.toml`, `./praxis.toml`,
//! the file named by `PRAXIS_CONFIG_PATH`, and `PRAXIS_<SECTION>__<FIELD>`
//! environment variables.

use crate::error::{PraxisError, Result};
use crate::sandbox::{BackendKind, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Main configuration for Praxis
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PraxisConfig {
    /// Dispatcher limits, retry and breaker tuning
    pub dispatcher: DispatcherConfig,

    /// Default sandbox limits for code-carrying capabilities
    pub sandbox: SandboxConfig,

    /// Sandbox backend selection and connection settings
    pub backends: BackendSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum executions in flight across all capabilities
    pub max_concurrent: usize,

    /// Timeout applied to each attempt when the caller supplies none
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Additional attempts after the first
    pub retry_count: u32,

    /// Base delay between attempts, doubled per attempt
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Consecutive failures that open a capability's breaker
    pub circuit_breaker_threshold: u32,

    /// Time an open breaker waits before admitting a probe
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_recovery_timeout: Duration,

    /// Write an audit entry for every dispatch
    pub audit_enabled: bool,

    /// How long a cancelled attempt may spend tearing down its work
    #[serde(with = "humantime_serde")]
    pub cleanup_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout: Duration::from_secs(60),
            retry_count: 1,
            retry_delay: Duration::from_secs(1),
            circuit_breaker_threshold: 5,
            circuit_breaker_recovery_timeout: Duration::from_secs(30),
            audit_enabled: true,
            cleanup_grace: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// Builder: set the concurrency bound
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Builder: set the default per-attempt timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builder: set retry budget and base delay
    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }

    /// Builder: set breaker threshold and recovery timeout
    pub fn with_circuit_breaker(mut self, threshold: u32, recovery_timeout: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_recovery_timeout = recovery_timeout;
        self
    }

    /// Builder: enable or disable auditing
    pub fn with_audit(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }
}

/// Backend selection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    /// Backends probed in order; the first available one is bound
    pub preference: Vec<BackendKind>,

    /// Container backend settings
    pub container: ContainerSettings,

    /// Orchestrated-job backend settings
    pub job: JobSettings,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            preference: vec![BackendKind::Container, BackendKind::Job],
            container: ContainerSettings::default(),
            job: JobSettings::default(),
        }
    }
}

/// Container backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerSettings {
    /// Docker daemon address; local defaults are used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,

    /// Pull the runtime image when it is missing locally
    pub pull_missing_images: bool,

    /// Maximum processes inside a sandbox container
    pub pids_limit: i64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_host: None,
            pull_missing_images: true,
            pids_limit: 64,
        }
    }
}

/// Orchestrated-job backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobSettings {
    /// Cluster API server
    pub api_server: String,

    /// Namespace sandbox jobs are created in
    pub namespace: String,

    /// Service account the job pods run as
    pub service_account: String,

    /// Bearer token file
    pub token_path: PathBuf,

    /// Cluster CA bundle; system roots are used when the file is absent
    pub ca_cert_path: PathBuf,

    /// Interval between job status checks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Platform-level expiry for finished jobs
    pub ttl_seconds_after_finished: u32,

    /// Timeout for individual API requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            namespace: "praxis-sandbox".to_string(),
            service_account: "sandbox-runner".to_string(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_cert_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            poll_interval: Duration::from_millis(500),
            ttl_seconds_after_finished: 60,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl PraxisConfig {
    /// Load configuration from all layered sources
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(PraxisConfig::default()));

        if let Some(dir) = dirs::config_dir() {
            figment = figment.merge(Toml::file(dir.join("praxis").join("praxis.toml")));
        }
        figment = figment.merge(Toml::file("praxis.toml"));

        // Check for custom config path
        if let Ok(path) = std::env::var("PRAXIS_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: PraxisConfig = figment
            .merge(Env::prefixed("PRAXIS_").split("__"))
            .extract()
            .map_err(|e| {
                PraxisError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults plus a single file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(PraxisError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: PraxisConfig = Figment::from(Serialized::defaults(PraxisConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                PraxisError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatcher;
        if d.max_concurrent == 0 {
            return Err(PraxisError::Configuration(
                "dispatcher.max_concurrent must be at least 1".to_string(),
            ));
        }
        if d.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(PraxisError::Configuration(format!(
                "dispatcher.max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if d.circuit_breaker_threshold == 0 {
            return Err(PraxisError::Configuration(
                "dispatcher.circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if d.default_timeout.is_zero() {
            return Err(PraxisError::Configuration(
                "dispatcher.default_timeout must be positive".to_string(),
            ));
        }

        let s = &self.sandbox;
        if s.cpu_limit.is_nan() || s.cpu_limit <= 0.0 {
            return Err(PraxisError::Configuration(
                "sandbox.cpu_limit must be positive".to_string(),
            ));
        }
        if s.memory_limit_mb == 0 {
            return Err(PraxisError::Configuration(
                "sandbox.memory_limit_mb must be positive".to_string(),
            ));
        }
        if s.max_output_size == 0 {
            return Err(PraxisError::Configuration(
                "sandbox.max_output_size must be positive".to_string(),
            ));
        }

        if self.backends.preference.is_empty() {
            return Err(PraxisError::Configuration(
                "backends.preference must name at least one backend".to_string(),
            ));
        }
        if self.backends.job.poll_interval.is_zero() {
            return Err(PraxisError::Configuration(
                "backends.job.poll_interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
