//! Scripted backend for tests

use super::backend::{BackendKind, SandboxBackend, SandboxContext, SandboxError, ensure_python};
use super::output::{RawOutput, SUCCESS_MARKER, SandboxResult, content_hash};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Backend with scripted availability and output that counts calls
pub(crate) struct ScriptedBackend {
    kind: BackendKind,
    available: AtomicBool,
    probes: AtomicUsize,
    executions: AtomicUsize,
    delay: Duration,
    stdout: String,
    exit_code: i64,
}

impl ScriptedBackend {
    pub(crate) fn available(kind: BackendKind) -> Self {
        Self {
            kind,
            available: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            delay: Duration::ZERO,
            stdout: "ok".to_string(),
            exit_code: 0,
        }
    }

    pub(crate) fn unavailable(kind: BackendKind) -> Self {
        let backend = Self::available(kind);
        backend.available.store(false, Ordering::SeqCst);
        backend
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub(crate) fn with_exit_code(mut self, exit_code: i64) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn execute(
        &self,
        code: &str,
        language: &str,
        ctx: &SandboxContext,
    ) -> Result<SandboxResult, SandboxError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        ensure_python(language)?;
        let hash = content_hash(code);

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Err(SandboxError::Cancelled),
            _ = tokio::time::sleep(ctx.config.timeout) => {
                return Err(SandboxError::Timeout(ctx.config.timeout));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        let (stdout, stderr) = if self.exit_code == 0 {
            (format!("{}\n{}\n", self.stdout, SUCCESS_MARKER), String::new())
        } else {
            (self.stdout.clone(), "RuntimeError: scripted failure".to_string())
        };
        let raw = RawOutput {
            stdout,
            stderr,
            exit_code: Some(self.exit_code),
            overflowed: false,
        };
        Ok(SandboxResult::from_raw(raw, hash, &ctx.config, self.delay))
    }

    async fn is_available(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }
}
