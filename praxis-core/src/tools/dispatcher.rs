//! Capability dispatcher
//!
//! The single entry point for running capabilities. A dispatch goes through
//! registry lookup, the capability's circuit breaker, argument checks, the
//! global concurrency limit and the retry executor. The breaker is updated
//! before the audit entry is written, and the audit entry is written before
//! the result is returned.
//!
//! `dispatch` never fails: every outcome is an [`ExecutionResult`].

use super::audit::{AuditEntry, AuditSink, TracingAuditSink};
use super::circuit_breaker::{
    BreakerOutcome, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
};
use super::handler::{BoxedHandler, HandlerError, InvocationContext};
use super::limiter::{ConcurrencyLimiter, LimiterError};
use super::registry::{CapabilityRegistry, Registration, RegistryError};
use super::result::{ErrorKind, ExecutionResult, ExecutionStatus};
use super::retry::{RetryOutcome, RetryPolicy, execute_with_retry};
use super::spec::CapabilitySpec;
use crate::config::DispatcherConfig;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Per-call dispatch options
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Per-attempt timeout; the dispatcher default when unset
    pub timeout: Option<Duration>,
    /// Correlation id; generated when unset
    pub trace_id: Option<String>,
    /// Caller making the request
    pub caller_id: Option<String>,
    /// Simulation tick of the request
    pub tick: Option<u64>,
    /// Cancels the call when fired
    pub cancellation: Option<CancellationToken>,
}

impl DispatchOptions {
    /// Options with every field unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set trace ID
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Set caller ID
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Set tick
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Set cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Runs registered capabilities under breaker, concurrency, timeout and
/// retry control
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: RwLock<CapabilityRegistry>,
    breakers: CircuitBreakerRegistry,
    limiter: ConcurrencyLimiter,
    retry: RetryPolicy,
    audit: Arc<dyn AuditSink>,
}

impl Dispatcher {
    /// Create a dispatcher that audits through `tracing`
    pub fn new(config: DispatcherConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            threshold: config.circuit_breaker_threshold,
            recovery_timeout: config.circuit_breaker_recovery_timeout,
        });
        Self {
            limiter: ConcurrencyLimiter::new(config.max_concurrent),
            retry: RetryPolicy::from_config(&config),
            registry: RwLock::new(CapabilityRegistry::new()),
            audit: Arc::new(TracingAuditSink),
            breakers,
            config,
        }
    }

    /// Builder: replace the audit sink
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Dispatcher settings
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Bind a capability. Replacing an existing binding resets its breaker.
    pub fn register(&self, spec: CapabilitySpec, handler: BoxedHandler) -> Result<(), RegistryError> {
        let name = spec.name.clone();
        let replaced = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(spec, handler)?;
        self.breakers.reset(&name);

        if replaced.is_some() {
            info!(capability = %name, "Replaced capability registration");
        } else {
            info!(capability = %name, "Registered capability");
        }
        Ok(())
    }

    /// Remove a capability and its breaker
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(name)
            .is_some();
        self.breakers.remove(name);
        if removed {
            info!(capability = name, "Unregistered capability");
        }
        removed
    }

    /// Spec of a registered capability
    pub fn get_spec(&self, name: &str) -> Option<Arc<CapabilitySpec>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get_spec(name)
    }

    /// All registered specs sorted by name
    pub fn list_specs(&self) -> Vec<Arc<CapabilitySpec>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list_specs()
    }

    /// Specs matching a search query, best match first
    pub fn discover(&self, query: &str) -> Vec<Arc<CapabilitySpec>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .discover(query)
    }

    /// Breaker data for a capability
    pub fn breaker_state(&self, name: &str) -> Option<CircuitBreakerState> {
        self.breakers.snapshot(name)
    }

    /// Breaker position for a capability
    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.breakers.state(name)
    }

    /// Handler executions currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.limiter.in_flight()
    }

    /// Highest number of concurrent handler executions observed
    pub fn peak_in_flight(&self) -> usize {
        self.limiter.peak()
    }

    /// Stop admitting work and release handler resources.
    ///
    /// Calls waiting for a slot, and every later call, end as cancelled.
    pub async fn shutdown(&self) {
        self.limiter.close();
        let handlers = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers();
        for handler in handlers {
            handler.shutdown().await;
        }
        info!("Dispatcher shut down");
    }

    fn registration(&self, name: &str) -> Option<Registration> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Run a capability
    pub async fn dispatch(&self, name: &str, args: Value, options: DispatchOptions) -> ExecutionResult {
        let trace_id = options
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let span = info_span!("dispatch", capability = name, trace_id = %trace_id);
        self.dispatch_traced(name, args, options, trace_id)
            .instrument(span)
            .await
    }

    async fn dispatch_traced(
        &self,
        name: &str,
        args: Value,
        options: DispatchOptions,
        trace_id: String,
    ) -> ExecutionResult {
        let call = CallRecord {
            name,
            trace_id,
            started_at: Utc::now(),
            clock: Instant::now(),
        };

        let Some(registration) = self.registration(name) else {
            let outcome = rejected(HandlerError::new(
                ErrorKind::CapabilityNotFound,
                format!("Capability '{}' not found", name),
            ));
            return self.finish(call, outcome, &args, &options, self.config.audit_enabled);
        };
        let audit = self.config.audit_enabled || registration.spec.safety.audit_required;

        let permit = match self.breakers.admit(name) {
            Ok(permit) => permit,
            Err(rejection) => {
                let outcome = rejected(
                    HandlerError::new(
                        ErrorKind::CircuitBreakerOpen,
                        format!(
                            "Circuit breaker open for '{}' after {} consecutive failures",
                            name, rejection.consecutive_failures
                        ),
                    )
                    .with_metadata(
                        "retry_after_ms",
                        json!(rejection.retry_after.as_millis() as u64),
                    ),
                );
                return self.finish(call, outcome, &args, &options, audit);
            }
        };
        if permit.is_probe() {
            debug!(capability = name, "Dispatching as half-open probe");
        }

        let outcome = self
            .execute(&registration, &args, &options, &call.trace_id)
            .await;
        permit.record(breaker_outcome(&outcome));

        self.finish(call, outcome, &args, &options, audit)
    }

    async fn execute(
        &self,
        registration: &Registration,
        args: &Value,
        options: &DispatchOptions,
        trace_id: &str,
    ) -> RetryOutcome {
        let handler = registration.handler.as_ref();
        let checked = check_arguments(&registration.spec, args).and_then(|()| {
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.preflight(args))).unwrap_or_else(
                |_| Err(HandlerError::unknown("Handler panicked during preflight")),
            )
        });
        if let Err(err) = checked {
            return rejected(err);
        }

        let cancel = options.cancellation.clone().unwrap_or_default();
        let slot = match self.limiter.acquire(&cancel).await {
            Ok(slot) => slot,
            Err(LimiterError::Cancelled) => {
                return rejected(HandlerError::new(
                    ErrorKind::Cancelled,
                    "Cancelled while waiting for a concurrency slot",
                ));
            }
            Err(LimiterError::Closed) => {
                return rejected(HandlerError::new(
                    ErrorKind::Cancelled,
                    "Dispatcher is shutting down",
                ));
            }
        };

        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let mut ctx = InvocationContext::new(&registration.spec.name, trace_id, timeout);
        ctx.caller_id = options.caller_id.clone();
        ctx.tick = options.tick;

        let outcome = execute_with_retry(&self.retry, handler, args, &ctx, &cancel).await;
        drop(slot);
        outcome
    }

    fn finish(
        &self,
        call: CallRecord<'_>,
        outcome: RetryOutcome,
        args: &Value,
        options: &DispatchOptions,
        audit: bool,
    ) -> ExecutionResult {
        let result = call.into_result(outcome);

        match result.error_kind {
            None => info!(
                attempts = result.attempts(),
                elapsed_ms = result.execution_time.as_millis() as u64,
                "Capability succeeded"
            ),
            Some(kind) => warn!(
                error_kind = %kind,
                attempts = result.attempts(),
                elapsed_ms = result.execution_time.as_millis() as u64,
                error = result.error_message.as_deref().unwrap_or_default(),
                "Capability failed"
            ),
        }

        if audit {
            let entry = AuditEntry::from_result(&result, args, options.caller_id.as_deref(), options.tick);
            let sink = self.audit.as_ref();
            if std::panic::catch_unwind(AssertUnwindSafe(|| sink.record(&entry))).is_err() {
                warn!("Audit sink panicked; entry dropped");
            }
        }

        result
    }
}

struct CallRecord<'a> {
    name: &'a str,
    trace_id: String,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl CallRecord<'_> {
    fn into_result(self, outcome: RetryOutcome) -> ExecutionResult {
        let execution_time = self.clock.elapsed();
        let mut result = ExecutionResult {
            capability_name: self.name.to_string(),
            status: ExecutionStatus::Success,
            output: None,
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
            error_kind: None,
            execution_time,
            started_at: self.started_at,
            completed_at: Utc::now(),
            trace_id: self.trace_id,
            metadata: Map::new(),
        };

        match outcome.result {
            Ok(output) => {
                result.output = output.output;
                result.stdout = output.stdout;
                result.stderr = output.stderr;
                result.metadata = output.metadata;
            }
            Err(err) => {
                result.status = ExecutionStatus::for_error(err.kind);
                result.error_kind = Some(err.kind);
                result.error_message = Some(err.message);
                result.stderr = err.stderr;
                result.metadata = err.metadata;
            }
        }
        result
            .metadata
            .insert("attempts".to_string(), json!(outcome.attempts));
        result
    }
}

fn rejected(err: HandlerError) -> RetryOutcome {
    RetryOutcome {
        result: Err(err),
        attempts: 0,
    }
}

fn breaker_outcome(outcome: &RetryOutcome) -> BreakerOutcome {
    match &outcome.result {
        Ok(_) => BreakerOutcome::Success,
        Err(err) if err.kind.counts_as_failure() => BreakerOutcome::Failure,
        Err(_) => BreakerOutcome::Neutral,
    }
}

fn check_arguments(spec: &CapabilitySpec, args: &Value) -> Result<(), HandlerError> {
    let empty = Map::new();
    let map = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(HandlerError::invalid_arguments(
                "Arguments must be a JSON object",
            ));
        }
    };

    let missing: Vec<&str> = spec
        .required_arguments()
        .into_iter()
        .filter(|key| !map.contains_key(*key))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HandlerError::invalid_arguments(format!(
            "Missing required argument(s): {}",
            missing.join(", ")
        )))
    }
}
