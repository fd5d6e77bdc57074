//! Orchestrated-job backend
//!
//! Submissions run as one-shot Kubernetes Jobs under a non-root, no-escalation
//! security profile. The backend polls the Job until it finishes or the
//! deadline passes, reads the pod's logs and deletes the Job on every path.
//! Cluster access sits behind [`JobApi`]; [`KubeHttpClient`] implements it
//! against the REST API.

use super::backend::{BackendKind, SandboxBackend, SandboxContext, SandboxError, ensure_python};
use super::output::{
    CODE_ENV_VAR, CappedBuffer, ERROR_MARKER, PYTHON_WRAPPER, RawOutput, SandboxResult,
    collection_limit, content_hash, encode_code,
};
use crate::config::JobSettings;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observed state of a sandbox Job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    /// Pod pending or running
    Active,
    /// Pod exited zero
    Succeeded,
    /// Pod failed or the Job hit a limit; carries the condition reason
    Failed(Option<String>),
}

impl JobPhase {
    /// Derive the phase from a Job's `status` object
    pub fn from_status(status: &Value) -> Self {
        let count = |field: &str| status.get(field).and_then(Value::as_i64).unwrap_or(0);
        if count("succeeded") > 0 {
            return JobPhase::Succeeded;
        }

        let failed_condition = status
            .get("conditions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|c| c["type"] == "Failed" && c["status"] == "True");

        match failed_condition {
            Some(c) => JobPhase::Failed(c["reason"].as_str().map(str::to_string)),
            None if count("failed") > 0 => JobPhase::Failed(None),
            None => JobPhase::Active,
        }
    }
}

/// The pod a Job created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPod {
    /// Pod name
    pub name: String,
    /// Exit code of the sandbox container, once terminated
    pub exit_code: Option<i64>,
}

/// Cluster operations the job backend needs
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Succeeds when the cluster accepts requests in the namespace
    async fn probe(&self) -> Result<(), SandboxError>;

    /// Submit a Job manifest
    async fn create_job(&self, manifest: &Value) -> Result<(), SandboxError>;

    /// Current phase of a Job
    async fn job_phase(&self, name: &str) -> Result<JobPhase, SandboxError>;

    /// The pod created for a Job, if scheduled
    async fn find_pod(&self, job_name: &str) -> Result<Option<JobPod>, SandboxError>;

    /// Stream a pod's combined log into `sink`
    async fn pod_logs(&self, pod_name: &str, sink: &mut CappedBuffer) -> Result<(), SandboxError>;

    /// Delete a Job and its pods; deleting a missing Job succeeds
    async fn delete_job(&self, name: &str) -> Result<(), SandboxError>;
}

/// [`JobApi`] over the Kubernetes REST API
pub struct KubeHttpClient {
    http: reqwest::Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
}

impl KubeHttpClient {
    /// Build a client from service-account credentials
    pub fn new(settings: &JobSettings) -> Result<Self, SandboxError> {
        let token = std::fs::read_to_string(&settings.token_path)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut builder = reqwest::Client::builder().timeout(settings.request_timeout);
        if let Ok(pem) = std::fs::read(&settings.ca_cert_path) {
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SandboxError::Unavailable(format!("Invalid cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            api_server: settings.api_server.trim_end_matches('/').to_string(),
            namespace: settings.namespace.clone(),
            token,
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_server, self.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_server, self.namespace)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, SandboxError> {
        let response = builder
            .send()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SandboxError::Backend(format!(
            "Kubernetes API returned {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl JobApi for KubeHttpClient {
    async fn probe(&self) -> Result<(), SandboxError> {
        let builder = self
            .request(reqwest::Method::GET, self.jobs_url())
            .query(&[("limit", "1")]);
        self.send(builder).await.map(|_| ())
    }

    async fn create_job(&self, manifest: &Value) -> Result<(), SandboxError> {
        let builder = self
            .request(reqwest::Method::POST, self.jobs_url())
            .json(manifest);
        self.send(builder).await.map(|_| ())
    }

    async fn job_phase(&self, name: &str) -> Result<JobPhase, SandboxError> {
        let url = format!("{}/{}/status", self.jobs_url(), name);
        let job: Value = self
            .send(self.request(reqwest::Method::GET, url))
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?;
        Ok(JobPhase::from_status(&job["status"]))
    }

    async fn find_pod(&self, job_name: &str) -> Result<Option<JobPod>, SandboxError> {
        let builder = self
            .request(reqwest::Method::GET, self.pods_url())
            .query(&[("labelSelector", format!("job-name={}", job_name))]);
        let pods: Value = self
            .send(builder)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Backend(e.to_string()))?;

        Ok(pods["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(pod_from_json))
    }

    async fn pod_logs(&self, pod_name: &str, sink: &mut CappedBuffer) -> Result<(), SandboxError> {
        let url = format!("{}/{}/log", self.pods_url(), pod_name);
        let mut stream = self
            .send(self.request(reqwest::Method::GET, url))
            .await?
            .bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Backend(e.to_string()))?;
            sink.push(&chunk);
        }
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<(), SandboxError> {
        let url = format!("{}/{}", self.jobs_url(), name);
        let response = self
            .request(reqwest::Method::DELETE, url)
            .json(&json!({ "propagationPolicy": "Background" }))
            .send()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(SandboxError::Backend(format!(
                "Failed to delete job {}: {}",
                name, status
            )))
        }
    }
}

fn pod_from_json(pod: &Value) -> Option<JobPod> {
    let name = pod["metadata"]["name"].as_str()?.to_string();
    let exit_code = pod["status"]["containerStatuses"]
        .as_array()
        .into_iter()
        .flatten()
        .find(|s| s["name"] == "sandbox")
        .and_then(|s| s["state"]["terminated"]["exitCode"].as_i64());
    Some(JobPod { name, exit_code })
}

/// Runs code as Kubernetes Jobs
pub struct JobBackend {
    api: Arc<dyn JobApi>,
    settings: JobSettings,
}

impl JobBackend {
    /// Connect with in-cluster credentials from `settings`
    pub fn new(settings: JobSettings) -> Result<Self, SandboxError> {
        let api = KubeHttpClient::new(&settings)?;
        Ok(Self::with_api(Arc::new(api), settings))
    }

    /// Create over a specific API implementation
    pub fn with_api(api: Arc<dyn JobApi>, settings: JobSettings) -> Self {
        Self { api, settings }
    }

    async fn wait_for_completion(&self, name: &str, ctx: &SandboxContext, deadline: Instant) -> JobOutcome {
        loop {
            let phase = tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => return JobOutcome::Cancelled,
                phase = self.api.job_phase(name) => phase,
            };
            match phase {
                Ok(JobPhase::Active) => {}
                Ok(JobPhase::Succeeded) => return JobOutcome::Finished { succeeded: true },
                Ok(JobPhase::Failed(Some(reason))) if reason == "DeadlineExceeded" => {
                    return JobOutcome::TimedOut;
                }
                Ok(JobPhase::Failed(reason)) => {
                    debug!(job = name, ?reason, "Sandbox job failed");
                    return JobOutcome::Finished { succeeded: false };
                }
                Err(e) => warn!(job = name, error = %e, "Failed to read job status"),
            }

            let now = Instant::now();
            if now >= deadline {
                return JobOutcome::TimedOut;
            }
            let wake = (now + self.settings.poll_interval).min(deadline);

            tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => return JobOutcome::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn read_output(
        &self,
        name: &str,
        succeeded: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, SandboxError> {
        let pod = match until_cancelled(cancel, self.api.find_pod(name)).await? {
            Ok(pod) => pod,
            Err(e) => {
                warn!(job = name, error = %e, "Failed to find sandbox pod");
                None
            }
        };

        let mut logs = CappedBuffer::new(limit);
        if let Some(pod) = &pod {
            if let Err(e) = until_cancelled(cancel, self.api.pod_logs(&pod.name, &mut logs)).await? {
                warn!(pod = %pod.name, error = %e, "Failed to get pod logs");
            }
        }

        let exit_code = pod
            .and_then(|p| p.exit_code)
            .unwrap_or(if succeeded { 0 } else { 1 });
        let overflowed = logs.overflowed();
        let (stdout, stderr) = split_merged_logs(&logs.into_string());

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code: Some(exit_code),
            overflowed,
        })
    }
}

/// Run a cluster call unless the caller gives up first
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    call: F,
) -> Result<F::Output, SandboxError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        output = call => Ok(output),
    }
}

enum JobOutcome {
    Finished { succeeded: bool },
    TimedOut,
    Cancelled,
}

#[async_trait]
impl SandboxBackend for JobBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Job
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
        let deadline = started + ctx.config.timeout;

        let name = job_name();
        let manifest = job_manifest(&name, code, ctx, &self.settings);
        self.api.create_job(&manifest).await?;
        let guard = JobGuard::new(self.api.clone(), name.clone());
        info!(job = %name, trace_id = %ctx.trace_id, "Submitted sandbox job");

        let result = match self.wait_for_completion(&name, ctx, deadline).await {
            JobOutcome::Finished { succeeded } => {
                let limit = collection_limit(ctx.config.max_output_size);
                self.read_output(&name, succeeded, limit, &ctx.cancellation)
                    .await
                    .map(|raw| SandboxResult::from_raw(raw, hash, &ctx.config, started.elapsed()))
            }
            JobOutcome::TimedOut => {
                warn!(job = %name, timeout = ?ctx.config.timeout, "Sandbox job timed out");
                Err(SandboxError::Timeout(ctx.config.timeout))
            }
            JobOutcome::Cancelled => {
                info!(job = %name, "Sandbox job cancelled");
                Err(SandboxError::Cancelled)
            }
        };

        guard.delete().await;
        result
    }

    async fn is_available(&self) -> bool {
        match self.api.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Kubernetes not available: {}", e);
                false
            }
        }
    }
}

/// Deletes a Job, from a spawned task if dropped unresolved
struct JobGuard {
    api: Arc<dyn JobApi>,
    name: String,
    armed: bool,
}

impl JobGuard {
    fn new(api: Arc<dyn JobApi>, name: String) -> Self {
        Self {
            api,
            name,
            armed: true,
        }
    }

    async fn delete(mut self) {
        self.armed = false;
        delete_job(self.api.as_ref(), &self.name).await;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let api = self.api.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    delete_job(api.as_ref(), &name).await;
                });
            }
            Err(_) => warn!(job = %name, "No runtime to delete abandoned job"),
        }
    }
}

async fn delete_job(api: &dyn JobApi, name: &str) {
    match api.delete_job(name).await {
        Ok(()) => debug!(job = name, "Deleted sandbox job"),
        Err(e) => warn!(job = name, error = %e, "Failed to delete job"),
    }
}

fn job_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sandbox-{}", &id[..12])
}

/// Label values are limited to 63 alphanumerics, `-`, `_` and `.`
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Job manifest for one submission
fn job_manifest(name: &str, code: &str, ctx: &SandboxContext, settings: &JobSettings) -> Value {
    let sandbox = &ctx.config;

    let mut env: Vec<Value> = sandbox
        .environment
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    env.push(json!({ "name": "PYTHONDONTWRITEBYTECODE", "value": "1" }));
    env.push(json!({ "name": "PYTHONUNBUFFERED", "value": "1" }));
    env.push(json!({ "name": CODE_ENV_VAR, "value": encode_code(code) }));

    let caller = ctx.caller_id.as_deref().map(label_value);
    let caller = caller
        .as_deref()
        .filter(|c| !c.is_empty())
        .unwrap_or("unknown");
    let memory = format!("{}Mi", sandbox.memory_limit_mb);

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "namespace": settings.namespace,
            "labels": {
                "app": "praxis-sandbox",
                "praxis-caller": caller,
            },
            "annotations": {
                "praxis/trace-id": ctx.trace_id,
            },
        },
        "spec": {
            "ttlSecondsAfterFinished": settings.ttl_seconds_after_finished,
            "backoffLimit": 0,
            "activeDeadlineSeconds": sandbox.timeout_secs(),
            "template": {
                "metadata": { "labels": { "app": "praxis-sandbox" } },
                "spec": {
                    "serviceAccountName": settings.service_account,
                    "restartPolicy": "Never",
                    "automountServiceAccountToken": false,
                    "securityContext": {
                        "runAsNonRoot": true,
                        "runAsUser": 1000,
                        "runAsGroup": 1000,
                        "fsGroup": 1000,
                        "seccompProfile": { "type": "RuntimeDefault" },
                    },
                    "containers": [{
                        "name": "sandbox",
                        "image": sandbox.runtime_image,
                        "command": ["python", "-c", PYTHON_WRAPPER],
                        "workingDir": sandbox.working_directory,
                        "env": env,
                        "resources": {
                            "limits": { "cpu": sandbox.cpu_millis(), "memory": memory },
                            "requests": { "cpu": "100m", "memory": "64Mi" },
                        },
                        "securityContext": {
                            "allowPrivilegeEscalation": false,
                            "readOnlyRootFilesystem": sandbox.filesystem_read_only,
                            "capabilities": { "drop": ["ALL"] },
                        },
                        "volumeMounts": [
                            { "name": "tmp", "mountPath": "/tmp" },
                            { "name": "workspace", "mountPath": sandbox.working_directory },
                        ],
                    }],
                    "volumes": [
                        { "name": "tmp", "emptyDir": { "sizeLimit": "16Mi" } },
                        { "name": "workspace", "emptyDir": { "sizeLimit": "16Mi" } },
                    ],
                },
            },
        },
    })
}

/// Pod logs interleave both streams; the error marker starts stderr
fn split_merged_logs(logs: &str) -> (String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut in_stderr = false;
    for line in logs.lines() {
        if line.trim_end() == ERROR_MARKER {
            in_stderr = true;
        }
        if in_stderr {
            stderr.push(line);
        } else {
            stdout.push(line);
        }
    }
    (stdout.join("\n"), stderr.join("\n"))
}

#[cfg(test)]
mod kubernetes_tests {
    use super::*;
    use crate::sandbox::SandboxConfig;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeJobApi {
        available: bool,
        phases: Mutex<VecDeque<JobPhase>>,
        pod: Option<JobPod>,
        logs: String,
        stall_status: bool,
        stall_logs: bool,
        created: Mutex<Vec<Value>>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeJobApi {
        fn scripted(phases: Vec<JobPhase>, exit_code: Option<i64>, logs: &str) -> Self {
            Self {
                available: true,
                phases: Mutex::new(phases.into()),
                pod: Some(JobPod {
                    name: "sandbox-pod".to_string(),
                    exit_code,
                }),
                logs: logs.to_string(),
                ..Default::default()
            }
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobApi for FakeJobApi {
        async fn probe(&self) -> Result<(), SandboxError> {
            if self.available {
                Ok(())
            } else {
                Err(SandboxError::Unavailable("no cluster".to_string()))
            }
        }

        async fn create_job(&self, manifest: &Value) -> Result<(), SandboxError> {
            self.created.lock().unwrap().push(manifest.clone());
            Ok(())
        }

        async fn job_phase(&self, _name: &str) -> Result<JobPhase, SandboxError> {
            if self.stall_status {
                std::future::pending::<()>().await;
            }
            let mut phases = self.phases.lock().unwrap();
            if phases.len() > 1 {
                Ok(phases.pop_front().unwrap())
            } else {
                Ok(phases.front().cloned().unwrap_or(JobPhase::Active))
            }
        }

        async fn find_pod(&self, _job_name: &str) -> Result<Option<JobPod>, SandboxError> {
            Ok(self.pod.clone())
        }

        async fn pod_logs(&self, _pod: &str, sink: &mut CappedBuffer) -> Result<(), SandboxError> {
            sink.push(self.logs.as_bytes());
            if self.stall_logs {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn delete_job(&self, name: &str) -> Result<(), SandboxError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn backend(api: Arc<FakeJobApi>) -> JobBackend {
        JobBackend::with_api(api, JobSettings::default())
    }

    fn ctx(timeout: Duration) -> SandboxContext {
        SandboxContext::new(SandboxConfig::default().with_timeout(timeout)).with_caller("npc 7")
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_returns_output_and_is_deleted() {
        let api = Arc::new(FakeJobApi::scripted(
            vec![JobPhase::Active, JobPhase::Active, JobPhase::Succeeded],
            Some(0),
            "hello\n__SANDBOX_SUCCESS__\n__RESULT_START__\n42\n__RESULT_END__\n",
        ));
        let result = backend(api.clone())
            .execute("print('hello')\n_result = 42", "python", &ctx(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.return_value, Some(json!(42)));
        assert_eq!(result.content_hash, content_hash("print('hello')\n_result = 42"));

        let created = api.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        let name = created[0]["metadata"]["name"].as_str().unwrap().to_string();
        assert_eq!(api.deleted(), vec![name]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_reports_traceback() {
        let api = Arc::new(FakeJobApi::scripted(
            vec![JobPhase::Failed(Some("BackoffLimitExceeded".to_string()))],
            Some(1),
            "partial\n__SANDBOX_ERROR__\nTraceback (most recent call last):\nZeroDivisionError: division by zero\n",
        ));
        let result = backend(api.clone())
            .execute("1/0", "python", &ctx(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stdout, "partial");
        assert_eq!(
            result.error_message.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_times_out_and_is_deleted() {
        let api = Arc::new(FakeJobApi::scripted(vec![JobPhase::Active], None, ""));
        let started = Instant::now();
        let err = backend(api.clone())
            .execute("while 1: pass", "python", &ctx(Duration::from_secs(2)))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Timeout(d) if d == Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_maps_to_timeout() {
        let api = Arc::new(FakeJobApi::scripted(
            vec![JobPhase::Failed(Some("DeadlineExceeded".to_string()))],
            None,
            "",
        ));
        let err = backend(api.clone())
            .execute("x = 1", "python", &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_deletes_job() {
        let api = Arc::new(FakeJobApi::scripted(vec![JobPhase::Active], None, ""));
        let token = CancellationToken::new();
        let context = ctx(Duration::from_secs(30)).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = backend(api.clone())
            .execute("x = 1", "python", &context)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, SandboxError::Cancelled));
        assert_eq!(api.deleted().len(), 1);
    }

    async fn cancel_after(api: Arc<FakeJobApi>, delay: Duration) -> (SandboxError, Duration) {
        let token = CancellationToken::new();
        let context = ctx(Duration::from_secs(30)).with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = backend(api)
            .execute("x = 1", "python", &context)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        (err, started.elapsed())
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_hung_status_call() {
        let api = Arc::new(FakeJobApi {
            stall_status: true,
            ..FakeJobApi::scripted(vec![JobPhase::Active], None, "")
        });

        let (err, elapsed) = cancel_after(api.clone(), Duration::from_secs(1)).await;

        assert!(matches!(err, SandboxError::Cancelled));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_hung_log_read() {
        let api = Arc::new(FakeJobApi {
            stall_logs: true,
            ..FakeJobApi::scripted(vec![JobPhase::Succeeded], Some(0), "partial")
        });

        let (err, elapsed) = cancel_after(api.clone(), Duration::from_secs(1)).await;

        assert!(matches!(err, SandboxError::Cancelled));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(api.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_logs_keep_the_closing_markers() {
        let logs = format!(
            "{}\n__SANDBOX_SUCCESS__\n__RESULT_START__\n\"done\"\n__RESULT_END__\n",
            "y".repeat(1_000_000)
        );
        let api = Arc::new(FakeJobApi::scripted(vec![JobPhase::Succeeded], Some(0), &logs));
        let context = SandboxContext::new(
            SandboxConfig::default()
                .with_timeout(Duration::from_secs(10))
                .with_max_output_size(1024),
        );

        let result = backend(api).execute("x = 1", "python", &context).await.unwrap();

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.return_value, Some(json!("done")));
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn availability_follows_probe() {
        let up = backend(Arc::new(FakeJobApi::scripted(vec![], None, "")));
        assert!(up.is_available().await);

        let down = backend(Arc::new(FakeJobApi::default()));
        assert!(!down.is_available().await);
    }

    #[tokio::test]
    async fn unsupported_language_creates_nothing() {
        let api = Arc::new(FakeJobApi::scripted(vec![], None, ""));
        let err = backend(api.clone())
            .execute("puts 1", "ruby", &ctx(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
        assert!(api.created.lock().unwrap().is_empty());
    }

    #[test]
    fn manifest_applies_restricted_profile() {
        let settings = JobSettings::default();
        let context = ctx(Duration::from_millis(1500));
        let manifest = job_manifest("sandbox-abc", "print(1)", &context, &settings);

        let spec = &manifest["spec"];
        assert_eq!(spec["backoffLimit"], 0);
        assert_eq!(spec["activeDeadlineSeconds"], 2);
        assert_eq!(spec["ttlSecondsAfterFinished"], 60);

        let pod = &spec["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["automountServiceAccountToken"], false);
        assert_eq!(pod["serviceAccountName"], "sandbox-runner");
        assert_eq!(pod["securityContext"]["runAsNonRoot"], true);
        assert_eq!(pod["securityContext"]["runAsUser"], 1000);
        assert_eq!(pod["securityContext"]["seccompProfile"]["type"], "RuntimeDefault");

        let container = &pod["containers"][0];
        assert_eq!(container["securityContext"]["allowPrivilegeEscalation"], false);
        assert_eq!(container["securityContext"]["readOnlyRootFilesystem"], true);
        assert_eq!(container["securityContext"]["capabilities"]["drop"][0], "ALL");
        assert_eq!(container["resources"]["limits"]["cpu"], "500m");
        assert_eq!(container["resources"]["limits"]["memory"], "256Mi");
        assert_eq!(manifest["metadata"]["labels"]["praxis-caller"], "npc_7");

        let env = container["env"].as_array().unwrap();
        assert!(env.iter().any(|e| e["name"] == CODE_ENV_VAR
            && e["value"] == encode_code("print(1)")));
    }

    #[test]
    fn phase_from_status() {
        assert_eq!(JobPhase::from_status(&json!({})), JobPhase::Active);
        assert_eq!(
            JobPhase::from_status(&json!({ "succeeded": 1 })),
            JobPhase::Succeeded
        );
        assert_eq!(
            JobPhase::from_status(&json!({ "failed": 1 })),
            JobPhase::Failed(None)
        );
        assert_eq!(
            JobPhase::from_status(&json!({
                "active": 1,
                "conditions": [{ "type": "Failed", "status": "True", "reason": "DeadlineExceeded" }]
            })),
            JobPhase::Failed(Some("DeadlineExceeded".to_string()))
        );
    }

    #[test]
    fn pod_exit_code_from_container_status() {
        let pod = json!({
            "metadata": { "name": "sandbox-abc-xyz" },
            "status": { "containerStatuses": [
                { "name": "sandbox", "state": { "terminated": { "exitCode": 3 } } }
            ]}
        });
        assert_eq!(
            pod_from_json(&pod),
            Some(JobPod {
                name: "sandbox-abc-xyz".to_string(),
                exit_code: Some(3)
            })
        );
    }

    #[test]
    fn label_values_are_sanitized() {
        assert_eq!(label_value("npc 7"), "npc_7");
        assert_eq!(label_value("-agent-"), "agent");
        assert_eq!(label_value(&"a".repeat(100)).len(), 63);
    }
}
