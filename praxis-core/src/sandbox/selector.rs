//! Backend selection with a cached binding

use super::backend::{BackendKind, BoxedBackend, SandboxError};
use super::docker::ContainerBackend;
use super::kubernetes::JobBackend;
use crate::config::BackendSettings;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Probes backends in preference order and remembers the first available one.
///
/// The binding is reused until [`SandboxSelector::reset`]; a failed selection
/// caches nothing so the next call probes again.
pub struct SandboxSelector {
    candidates: Vec<BoxedBackend>,
    bound: Mutex<Option<BoxedBackend>>,
}

impl SandboxSelector {
    /// Create a selector over candidates in preference order
    pub fn new(candidates: Vec<BoxedBackend>) -> Self {
        Self {
            candidates,
            bound: Mutex::new(None),
        }
    }

    /// Construct the configured backends.
    ///
    /// A backend whose client cannot be built is left out with a warning; it
    /// would never report available anyway.
    pub fn from_settings(settings: &BackendSettings) -> Self {
        let mut candidates: Vec<BoxedBackend> = Vec::new();
        for kind in &settings.preference {
            let built: Result<BoxedBackend, SandboxError> = match kind {
                BackendKind::Container => ContainerBackend::new(settings.container.clone())
                    .map(|b| Arc::new(b) as BoxedBackend),
                BackendKind::Job => {
                    JobBackend::new(settings.job.clone()).map(|b| Arc::new(b) as BoxedBackend)
                }
            };
            match built {
                Ok(backend) => candidates.push(backend),
                Err(e) => warn!(backend = %kind, error = %e, "Skipping sandbox backend"),
            }
        }
        Self::new(candidates)
    }

    /// Candidates in preference order
    pub fn candidates(&self) -> &[BoxedBackend] {
        &self.candidates
    }

    /// The bound backend, probing candidates if nothing is bound yet
    pub async fn select(&self) -> Option<BoxedBackend> {
        let mut bound = self.bound.lock().await;
        if let Some(backend) = bound.as_ref() {
            return Some(backend.clone());
        }

        for backend in &self.candidates {
            if backend.is_available().await {
                info!(backend = %backend.kind(), "Bound sandbox backend");
                *bound = Some(backend.clone());
                return Some(backend.clone());
            }
            debug!(backend = %backend.kind(), "Sandbox backend unavailable");
        }

        warn!("No sandbox backend available");
        None
    }

    /// Kind of the bound backend, without probing
    pub async fn bound_kind(&self) -> Option<BackendKind> {
        self.bound.lock().await.as_ref().map(|b| b.kind())
    }

    /// Availability of every candidate, without touching the binding
    pub async fn probe_all(&self) -> Vec<(BackendKind, bool)> {
        let mut report = Vec::with_capacity(self.candidates.len());
        for backend in &self.candidates {
            report.push((backend.kind(), backend.is_available().await));
        }
        report
    }

    /// Drop the binding so the next selection probes again
    pub async fn reset(&self) {
        *self.bound.lock().await = None;
    }

    /// Release resources held by every candidate
    pub async fn cleanup(&self) {
        for backend in &self.candidates {
            if let Err(e) = backend.cleanup().await {
                warn!(backend = %backend.kind(), error = %e, "Backend cleanup failed");
            }
        }
        self.reset().await;
    }
}
