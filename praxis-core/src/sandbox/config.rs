//! Sandbox limits applied to one code submission

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Standard-library modules submitted code may import by default
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "math",
    "statistics",
    "random",
    "datetime",
    "json",
    "re",
    "collections",
    "itertools",
    "functools",
    "operator",
    "string",
    "textwrap",
    "unicodedata",
    "decimal",
    "fractions",
    "numbers",
    "csv",
    "io",
    "base64",
    "hashlib",
    "hmac",
];

/// Resource, network and import limits for sandboxed execution.
///
/// The defaults deny network access, mount the root filesystem read-only and
/// restrict imports to [`DEFAULT_ALLOWED_IMPORTS`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image the code runs in
    pub runtime_image: String,

    /// Wall-clock limit for one execution
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Memory limit in megabytes
    #[serde(alias = "memory_limit")]
    pub memory_limit_mb: u64,

    /// CPU limit in cores
    pub cpu_limit: f64,

    /// Allow outbound network access
    pub network_enabled: bool,

    /// Domains the code is expected to reach when networking is enabled
    pub allowed_domains: Vec<String>,

    /// Mount the root filesystem read-only
    pub filesystem_read_only: bool,

    /// Top-level modules the code may import
    pub allowed_imports: BTreeSet<String>,

    /// Additional denylist substrings
    pub extra_blocked_patterns: Vec<String>,

    /// Maximum bytes returned per output stream
    pub max_output_size: usize,

    /// Working directory inside the sandbox
    pub working_directory: String,

    /// Extra environment for the executed code
    pub environment: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_image: "python:3.11-slim".to_string(),
            timeout: Duration::from_secs(30),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            network_enabled: false,
            allowed_domains: Vec::new(),
            filesystem_read_only: true,
            allowed_imports: DEFAULT_ALLOWED_IMPORTS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            extra_blocked_patterns: Vec::new(),
            max_output_size: 100 * 1024,
            working_directory: "/workspace".to_string(),
            environment: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Builder: set the runtime image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.runtime_image = image.into();
        self
    }

    /// Builder: set the wall-clock limit
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: set memory (MB) and CPU (cores) limits
    pub fn with_resources(mut self, memory_limit_mb: u64, cpu_limit: f64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self.cpu_limit = cpu_limit;
        self
    }

    /// Builder: enable networking for the given domains
    pub fn with_network<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.network_enabled = true;
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: allow an additional top-level module
    pub fn allow_import(mut self, module: impl Into<String>) -> Self {
        self.allowed_imports.insert(module.into());
        self
    }

    /// Builder: add a denylist substring
    pub fn block_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra_blocked_patterns.push(pattern.into());
        self
    }

    /// Builder: set the per-stream output cap
    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    /// Builder: add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Memory limit in bytes
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64).saturating_mul(1024 * 1024)
    }

    /// CPU limit in billionths of a core
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }

    /// CPU limit in Kubernetes millicores, e.g. `500m`
    pub fn cpu_millis(&self) -> String {
        format!("{}m", ((self.cpu_limit * 1000.0).round() as i64).max(1))
    }

    /// Timeout rounded up to whole seconds, at least one
    pub fn timeout_secs(&self) -> u64 {
        let secs = self.timeout.as_secs();
        if self.timeout.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}
