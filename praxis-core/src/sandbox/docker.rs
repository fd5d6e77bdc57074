//! Container backend
//!
//! Each submission gets a freshly created container with dropped
//! capabilities, no privilege escalation, memory/CPU/pid limits and no
//! network unless enabled. The container is killed when the timeout elapses
//! or the caller cancels, and force-removed on every path.

use super::backend::{BackendKind, SandboxBackend, SandboxContext, SandboxError, ensure_python};
use super::output::{
    CODE_ENV_VAR, CappedBuffer, PYTHON_WRAPPER, RawOutput, SandboxResult, collection_limit,
    content_hash, encode_code,
};
use crate::config::ContainerSettings;
use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::HostConfig,
};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Runs code in ephemeral Docker containers
pub struct ContainerBackend {
    client: Docker,
    settings: ContainerSettings,
}

impl ContainerBackend {
    /// Connect using `settings.docker_host` or the local defaults
    pub fn new(settings: ContainerSettings) -> Result<Self, SandboxError> {
        let client = match settings.docker_host.as_deref() {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_unix(
                host.trim_start_matches("unix://"),
                CLIENT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            Some(host) => Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_defaults(),
        }
        .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        Ok(Self::with_client(client, settings))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, settings: ContainerSettings) -> Self {
        Self { client, settings }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) if self.settings.pull_missing_images => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Err(SandboxError::Backend(format!(
                    "Image {} is not present and pulling is disabled",
                    image
                )));
            }
            Err(e) => return Err(SandboxError::Backend(e.to_string())),
        }

        info!(image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| {
                SandboxError::Backend(format!("Failed to pull image {}: {}", image, e))
            })?;
            if let Some(error) = progress.error {
                return Err(SandboxError::Backend(format!(
                    "Failed to pull image {}: {}",
                    image, error
                )));
            }
        }
        Ok(())
    }

    async fn wait_for_exit(&self, id: &str, ctx: &SandboxContext) -> WaitOutcome {
        let mut stream = Box::pin(
            self.client
                .wait_container(id, None::<WaitContainerOptions<String>>),
        );

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(ctx.config.timeout) => WaitOutcome::TimedOut,
            next = stream.next() => match next {
                Some(Ok(response)) => WaitOutcome::Exited(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    WaitOutcome::Exited(code)
                }
                Some(Err(e)) => WaitOutcome::Failed(e.to_string()),
                None => WaitOutcome::Failed("wait stream closed without exit status".to_string()),
            },
        }
    }

    async fn kill(&self, id: &str) {
        let options = KillContainerOptions { signal: "SIGKILL" };
        if let Err(e) = self.client.kill_container(id, Some(options)).await {
            debug!(container = id, error = %e, "Kill failed; container may have exited");
        }
    }

    async fn collect_logs(&self, id: &str, limit: usize) -> Result<(CappedBuffer, CappedBuffer), SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stdout = CappedBuffer::new(limit);
        let mut stderr = CappedBuffer::new(limit);
        let mut stream = Box::pin(self.client.logs(id, Some(options)));
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| SandboxError::Backend(e.to_string()))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push(&message)
                }
                LogOutput::StdErr { message } => stderr.push(&message),
                _ => continue,
            }
        }
        Ok((stdout, stderr))
    }
}

enum WaitOutcome {
    Exited(i64),
    TimedOut,
    Cancelled,
    Failed(String),
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(
        &self,
        code: &str,
        language: &str,
        ctx: &SandboxContext,
    ) -> Result<SandboxResult, SandboxError> {
        ensure_python(language)?;
        let hash = content_hash(code);
        let started = Instant::now();

        self.ensure_image(&ctx.config.runtime_image).await?;

        let name = container_name();
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), container_config(code, ctx, &self.settings))
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?;
        let guard = ContainerGuard::new(self.client.clone(), created.id.clone());
        debug!(container = %name, trace_id = %ctx.trace_id, "Created sandbox container");

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?;

        let result = match self.wait_for_exit(&created.id, ctx).await {
            WaitOutcome::Exited(exit_code) => {
                let limit = collection_limit(ctx.config.max_output_size);
                let (stdout, stderr) = self.collect_logs(&created.id, limit).await?;
                let raw = RawOutput {
                    overflowed: stdout.overflowed() || stderr.overflowed(),
                    stdout: stdout.into_string(),
                    stderr: stderr.into_string(),
                    exit_code: Some(exit_code),
                };
                Ok(SandboxResult::from_raw(
                    raw,
                    hash,
                    &ctx.config,
                    started.elapsed(),
                ))
            }
            WaitOutcome::TimedOut => {
                warn!(container = %name, timeout = ?ctx.config.timeout, "Sandbox timed out; killing container");
                self.kill(&created.id).await;
                Err(SandboxError::Timeout(ctx.config.timeout))
            }
            WaitOutcome::Cancelled => {
                info!(container = %name, "Sandbox cancelled; killing container");
                self.kill(&created.id).await;
                Err(SandboxError::Cancelled)
            }
            WaitOutcome::Failed(reason) => {
                self.kill(&created.id).await;
                Err(SandboxError::Backend(reason))
            }
        };

        guard.remove().await;
        result
    }

    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }
}

/// Force-removes a container, from a spawned task if dropped unresolved
struct ContainerGuard {
    client: Docker,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(client: Docker, id: String) -> Self {
        Self {
            client,
            id,
            armed: true,
        }
    }

    async fn remove(mut self) {
        self.armed = false;
        remove_container(&self.client, &self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(&client, &id).await;
                });
            }
            Err(_) => warn!(container = %id, "No runtime to remove abandoned container"),
        }
    }
}

async fn remove_container(client: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match client.remove_container(id, Some(options)).await {
        Ok(()) => debug!(container = id, "Removed sandbox container"),
        Err(e) => warn!(container = id, error = %e, "Failed to remove sandbox container"),
    }
}

fn container_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("praxis-sandbox-{}", &id[..12])
}

/// Container definition for one submission
fn container_config(
    code: &str,
    ctx: &SandboxContext,
    settings: &ContainerSettings,
) -> Config<String> {
    let sandbox = &ctx.config;

    let mut env: Vec<String> = sandbox
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.push("PYTHONDONTWRITEBYTECODE=1".to_string());
    env.push("PYTHONUNBUFFERED=1".to_string());
    env.push(format!("{}={}", CODE_ENV_VAR, encode_code(code)));

    let mut labels = HashMap::from([
        ("praxis.sandbox".to_string(), "true".to_string()),
        ("praxis.trace_id".to_string(), ctx.trace_id.clone()),
    ]);
    if let Some(caller) = &ctx.caller_id {
        labels.insert("praxis.caller_id".to_string(), caller.clone());
    }

    let scratch = "rw,noexec,nosuid,size=16m,mode=1777".to_string();
    let host_config = HostConfig {
        memory: Some(sandbox.memory_limit_bytes()),
        memory_swap: Some(sandbox.memory_limit_bytes()),
        nano_cpus: Some(sandbox.nano_cpus()),
        pids_limit: Some(settings.pids_limit),
        network_mode: if sandbox.network_enabled {
            None
        } else {
            Some("none".to_string())
        },
        readonly_rootfs: Some(sandbox.filesystem_read_only),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        cap_drop: Some(vec!["ALL".to_string()]),
        tmpfs: Some(HashMap::from([
            ("/tmp".to_string(), scratch.clone()),
            (sandbox.working_directory.clone(), scratch),
        ])),
        ..Default::default()
    };

    Config {
        image: Some(sandbox.runtime_image.clone()),
        cmd: Some(vec![
            "python".to_string(),
            "-c".to_string(),
            PYTHON_WRAPPER.to_string(),
        ]),
        env: Some(env),
        working_dir: Some(sandbox.working_directory.clone()),
        user: Some("65534:65534".to_string()),
        network_disabled: Some(!sandbox.network_enabled),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[cfg(test)]
mod docker_tests {
    use super::*;
    use crate::sandbox::SandboxConfig;

    fn ctx(config: SandboxConfig) -> SandboxContext {
        SandboxContext::new(config)
            .with_trace_id("trace-1")
            .with_caller("npc-7")
    }

    #[test]
    fn config_enforces_isolation_defaults() {
        let config = container_config("print(1)", &ctx(SandboxConfig::default()), &ContainerSettings::default());
        let host = config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert!(host.tmpfs.unwrap().contains_key("/workspace"));
    }

    #[test]
    fn config_ships_code_through_env() {
        let config = container_config("print(1)", &ctx(SandboxConfig::default()), &ContainerSettings::default());
        let env = config.env.unwrap();
        assert!(env.contains(&format!("{}={}", CODE_ENV_VAR, encode_code("print(1)"))));

        let cmd = config.cmd.unwrap();
        assert_eq!(cmd[0], "python");
        assert_eq!(cmd[2], PYTHON_WRAPPER);
        assert!(!cmd.iter().any(|arg| arg.contains("print(1)")));
    }

    #[test]
    fn config_labels_trace_and_caller() {
        let config = container_config("", &ctx(SandboxConfig::default()), &ContainerSettings::default());
        let labels = config.labels.unwrap();
        assert_eq!(labels.get("praxis.trace_id").map(String::as_str), Some("trace-1"));
        assert_eq!(labels.get("praxis.caller_id").map(String::as_str), Some("npc-7"));
    }

    #[test]
    fn network_enabled_leaves_default_network() {
        let sandbox = SandboxConfig::default().with_network(["example.com"]);
        let config = container_config("", &ctx(sandbox), &ContainerSettings::default());
        assert_eq!(config.network_disabled, Some(false));
        assert!(config.host_config.unwrap().network_mode.is_none());
    }

    #[test]
    fn container_names_are_unique() {
        let a = container_name();
        let b = container_name();
        assert!(a.starts_with("praxis-sandbox-"));
        assert_eq!(a.len(), "praxis-sandbox-".len() + 12);
        assert_ne!(a, b);
    }
}
