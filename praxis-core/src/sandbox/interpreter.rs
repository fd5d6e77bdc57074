//! The `code_interpreter` capability
//!
//! Validates submitted Python, binds a sandbox backend through the selector
//! and runs the code there. The content hash of the submission is attached
//! to every outcome so audit entries correlate without storing code.

use super::backend::{BackendKind, SandboxContext, SandboxError};
use super::config::SandboxConfig;
use super::output::{SandboxResult, content_hash};
use super::selector::SandboxSelector;
use super::validator::{CodeValidator, RejectionKind, ValidationFailure};
use crate::tools::{
    CapabilityHandler, CapabilitySpec, ErrorKind, HandlerError, HandlerOutput, InvocationContext,
    RiskLevel, SafetyProfile,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Registered name of the capability
pub const CODE_INTERPRETER: &str = "code_interpreter";

#[derive(Debug, Deserialize)]
struct CodeRequest {
    code: String,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "python".to_string()
}

impl CodeRequest {
    fn parse(args: &Value) -> Result<Self, HandlerError> {
        serde_json::from_value(args.clone()).map_err(|e| {
            HandlerError::invalid_arguments(format!("Invalid {} arguments: {}", CODE_INTERPRETER, e))
        })
    }
}

/// Runs Python submissions in an isolated sandbox
pub struct CodeInterpreter {
    config: SandboxConfig,
    validator: CodeValidator,
    selector: Arc<SandboxSelector>,
}

impl CodeInterpreter {
    /// Create an interpreter with the given limits and backend selector
    pub fn new(config: SandboxConfig, selector: Arc<SandboxSelector>) -> Self {
        Self {
            validator: CodeValidator::from_config(&config),
            config,
            selector,
        }
    }

    /// Capability descriptor to register the interpreter under
    pub fn spec() -> CapabilitySpec {
        CapabilitySpec::new(
            CODE_INTERPRETER,
            "Execute Python code in a secure sandbox environment. Useful for mathematical \
             calculations, data analysis, string manipulation, and other computational tasks. \
             The code runs in an isolated environment with limited imports and no network \
             access by default.",
        )
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The Python code to execute. Assign to _result to return a value."
                },
                "timeout": {
                    "type": "number",
                    "description": "Maximum execution time in seconds (default: 30)."
                },
                "language": {
                    "type": "string",
                    "description": "Language of the code. Only python is supported.",
                    "default": "python"
                }
            },
            "required": ["code"]
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "success": { "type": "boolean" },
                "output": { "type": "string" },
                "result": {}
            }
        }))
        .with_safety(SafetyProfile::sandboxed().with_risk(RiskLevel::Medium))
        .with_tag("computation")
        .with_tag("code")
        .with_tag("sandbox")
        .with_example(json!({ "code": "import math\n_result = math.sqrt(16)" }))
        .with_example(json!({ "code": "print(sum(range(10)))", "timeout": 5 }))
    }

    /// Sandbox limits applied to each run
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Backend selector
    pub fn selector(&self) -> &Arc<SandboxSelector> {
        &self.selector
    }

    /// Static check of a submission
    pub fn validate(&self, code: &str) -> Result<(), HandlerError> {
        self.validator
            .validate(code)
            .map_err(|failure| rejection_error(failure, &content_hash(code)))
    }

    fn call_config(&self, requested: Option<f64>, limit: Duration) -> Result<SandboxConfig, HandlerError> {
        let mut config = self.config.clone();
        if let Some(secs) = requested {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(HandlerError::invalid_arguments(
                    "timeout must be a positive number of seconds",
                ));
            }
            config.timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                HandlerError::invalid_arguments(format!("timeout is out of range: {}", e))
            })?;
        }
        config.timeout = config.timeout.min(limit);
        Ok(config)
    }
}

fn rejection_error(failure: ValidationFailure, code_hash: &str) -> HandlerError {
    let kind = match failure.kind {
        RejectionKind::BlockedPattern => ErrorKind::BlockedPattern,
        RejectionKind::DisallowedImport => ErrorKind::DisallowedImport,
        RejectionKind::SyntaxError => ErrorKind::SyntaxError,
    };
    HandlerError::new(kind, failure.message).with_metadata("code_hash", json!(code_hash))
}

fn sandbox_error(err: SandboxError, code_hash: &str, backend: BackendKind) -> HandlerError {
    let kind = match &err {
        SandboxError::Timeout(_) => ErrorKind::Timeout,
        SandboxError::Cancelled => ErrorKind::Cancelled,
        SandboxError::Unavailable(_) => ErrorKind::BackendUnavailable,
        SandboxError::UnsupportedLanguage(_) => ErrorKind::InvalidArguments,
        SandboxError::Backend(_) => ErrorKind::ExecutionFailed,
    };
    HandlerError::new(kind, err.to_string())
        .with_metadata("code_hash", json!(code_hash))
        .with_metadata("backend", json!(backend.as_str()))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn success_output(result: SandboxResult, backend: BackendKind) -> HandlerOutput {
    let mut parts = Vec::new();
    if !result.stdout.is_empty() {
        parts.push(result.stdout.clone());
    }
    if let Some(value) = &result.return_value {
        parts.push(format!("Result: {}", render_value(value)));
    }
    let text = if parts.is_empty() {
        "Code executed successfully.".to_string()
    } else {
        parts.join("\n")
    };

    HandlerOutput::new(json!({
        "success": true,
        "output": text,
        "result": result.return_value,
    }))
    .with_stdout(result.stdout)
    .with_stderr(result.stderr)
    .with_metadata("code_hash", json!(result.content_hash))
    .with_metadata("truncated", json!(result.truncated))
    .with_metadata("backend", json!(backend.as_str()))
    .with_metadata("exit_code", json!(result.exit_code))
    .with_metadata(
        "sandbox_time_ms",
        json!(result.execution_time.as_millis() as u64),
    )
}

fn failure_error(result: SandboxResult, backend: BackendKind) -> HandlerError {
    HandlerError::execution_failed(
        result
            .error_message
            .unwrap_or_else(|| "Execution failed".to_string()),
    )
    .with_stderr(result.stderr)
    .with_metadata("code_hash", json!(result.content_hash))
    .with_metadata("truncated", json!(result.truncated))
    .with_metadata("backend", json!(backend.as_str()))
    .with_metadata("exit_code", json!(result.exit_code))
}

#[async_trait]
impl CapabilityHandler for CodeInterpreter {
    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> Result<HandlerOutput, HandlerError> {
        let request = CodeRequest::parse(&args)?;
        let code_hash = content_hash(&request.code);
        self.validator
            .validate(&request.code)
            .map_err(|failure| rejection_error(failure, &code_hash))?;
        let config = self.call_config(request.timeout, ctx.timeout)?;

        let Some(backend) = self.selector.select().await else {
            return Err(HandlerError::new(
                ErrorKind::BackendUnavailable,
                "No sandbox backend available. Ensure Docker or Kubernetes is configured.",
            )
            .with_metadata("code_hash", json!(code_hash)));
        };
        let kind = backend.kind();

        let mut sandbox_ctx = SandboxContext::new(config)
            .with_cancellation(ctx.cancellation.clone())
            .with_trace_id(ctx.trace_id.as_str());
        if let Some(caller) = &ctx.caller_id {
            sandbox_ctx = sandbox_ctx.with_caller(caller.as_str());
        }
        sandbox_ctx.tick = ctx.tick;

        info!(
            backend = %kind,
            code_hash = %code_hash,
            attempt = ctx.attempt,
            "Executing code in sandbox"
        );

        let result = match backend
            .execute(&request.code, &request.language, &sandbox_ctx)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                if matches!(err, SandboxError::Unavailable(_)) {
                    self.selector.reset().await;
                }
                return Err(sandbox_error(err, &code_hash, kind));
            }
        };

        debug!(
            backend = %kind,
            success = result.success,
            truncated = result.truncated,
            exit_code = ?result.exit_code,
            "Sandbox execution finished"
        );

        if result.success {
            Ok(success_output(result, kind))
        } else {
            Err(failure_error(result, kind))
        }
    }

    fn preflight(&self, args: &Value) -> Result<(), HandlerError> {
        match args.get("code") {
            Some(Value::String(code)) => self.validate(code),
            Some(_) => Err(HandlerError::invalid_arguments("code must be a string")),
            None => Err(HandlerError::invalid_arguments(
                "Missing required argument(s): code",
            )),
        }
    }

    async fn shutdown(&self) {
        self.selector.cleanup().await;
    }
}

#[cfg(test)]
mod interpreter_tests {
    use super::*;
    use crate::sandbox::backend::BoxedBackend;
    use crate::sandbox::testing::ScriptedBackend;
    use tokio_util::sync::CancellationToken;

    fn interpreter(backends: Vec<Arc<ScriptedBackend>>) -> CodeInterpreter {
        let candidates = backends
            .into_iter()
            .map(|b| b as BoxedBackend)
            .collect();
        CodeInterpreter::new(
            SandboxConfig::default(),
            Arc::new(SandboxSelector::new(candidates)),
        )
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new(CODE_INTERPRETER, "t-1", Duration::from_secs(60))
    }

    #[test]
    fn spec_describes_sandboxed_capability() {
        let spec = CodeInterpreter::spec();
        assert_eq!(spec.name, CODE_INTERPRETER);
        assert_eq!(spec.required_arguments(), vec!["code"]);
        assert!(spec.safety.requires_sandbox);
        assert!(spec.safety.audit_required);
        assert_eq!(spec.safety.risk_level, RiskLevel::Medium);
        assert_eq!(spec.tags, vec!["computation", "code", "sandbox"]);
        assert!(crate::tools::validate_spec(&spec).is_ok());
    }

    #[test]
    fn preflight_maps_rejections() {
        let interp = interpreter(vec![]);
        let blocked = interp
            .preflight(&json!({ "code": "import subprocess" }))
            .unwrap_err();
        assert_eq!(blocked.kind, ErrorKind::BlockedPattern);
        assert_eq!(blocked.message, "Blocked pattern detected: subprocess");
        assert_eq!(
            blocked.metadata["code_hash"],
            json!(content_hash("import subprocess"))
        );

        let import = interp.preflight(&json!({ "code": "import os" })).unwrap_err();
        assert_eq!(import.kind, ErrorKind::DisallowedImport);
        assert_eq!(import.message, "Import not allowed: os");

        let syntax = interp.preflight(&json!({ "code": "def f(:" })).unwrap_err();
        assert_eq!(syntax.kind, ErrorKind::SyntaxError);

        let wrong_type = interp.preflight(&json!({ "code": 5 })).unwrap_err();
        assert_eq!(wrong_type.kind, ErrorKind::InvalidArguments);

        assert!(interp.preflight(&json!({ "code": "print(1)" })).is_ok());
    }

    #[tokio::test]
    async fn success_builds_output_and_metadata() {
        let backend = Arc::new(ScriptedBackend::available(BackendKind::Container).with_stdout("4"));
        let interp = interpreter(vec![backend.clone()]);

        let out = interp
            .invoke(json!({ "code": "print(2 + 2)" }), &ctx())
            .await
            .unwrap();
        let output = out.output.unwrap();
        assert_eq!(output["success"], true);
        assert_eq!(output["output"], "4");
        assert!(output["result"].is_null());
        assert_eq!(out.stdout, "4");
        assert_eq!(out.metadata["code_hash"], json!(content_hash("print(2 + 2)")));
        assert_eq!(out.metadata["truncated"], false);
        assert_eq!(out.metadata["backend"], "container");
        assert_eq!(out.metadata["exit_code"], 0);
        assert_eq!(backend.executions(), 1);
    }

    #[tokio::test]
    async fn failed_run_is_execution_failed() {
        let backend = Arc::new(ScriptedBackend::available(BackendKind::Job).with_exit_code(1));
        let interp = interpreter(vec![backend]);

        let err = interp
            .invoke(json!({ "code": "x = 1" }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExecutionFailed);
        assert_eq!(err.message, "RuntimeError: scripted failure");
        assert_eq!(err.stderr, "RuntimeError: scripted failure");
        assert_eq!(err.metadata["exit_code"], 1);
        assert_eq!(err.metadata["backend"], "job");
    }

    #[tokio::test]
    async fn no_backend_is_backend_unavailable() {
        let interp = interpreter(vec![
            Arc::new(ScriptedBackend::unavailable(BackendKind::Container)),
            Arc::new(ScriptedBackend::unavailable(BackendKind::Job)),
        ]);
        let err = interp
            .invoke(json!({ "code": "x = 1" }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BackendUnavailable);
        assert_eq!(err.metadata["code_hash"], json!(content_hash("x = 1")));
    }

    #[tokio::test]
    async fn validation_runs_before_backend_selection() {
        let backend = Arc::new(ScriptedBackend::available(BackendKind::Container));
        let interp = interpreter(vec![backend.clone()]);
        let err = interp
            .invoke(json!({ "code": "EVAL(1)" }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BlockedPattern);
        assert_eq!(backend.probes(), 0);
        assert_eq!(backend.executions(), 0);
    }

    #[tokio::test]
    async fn unsupported_language_is_invalid_arguments() {
        let interp = interpreter(vec![Arc::new(ScriptedBackend::available(
            BackendKind::Container,
        ))]);
        let err = interp
            .invoke(json!({ "code": "x = 1", "language": "ruby" }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_override_is_clamped_and_enforced() {
        let backend = Arc::new(
            ScriptedBackend::available(BackendKind::Container).with_delay(Duration::from_secs(30)),
        );
        let interp = interpreter(vec![backend]);

        let config = interp.call_config(Some(120.0), Duration::from_secs(10)).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(10));
        let config = interp.call_config(Some(0.5), Duration::from_secs(10)).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert!(interp.call_config(Some(-1.0), Duration::from_secs(10)).is_err());

        let err = interp
            .invoke(json!({ "code": "x = 1", "timeout": 2 }), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reaches_backend() {
        let backend = Arc::new(
            ScriptedBackend::available(BackendKind::Container).with_delay(Duration::from_secs(20)),
        );
        let interp = interpreter(vec![backend]);
        let token = CancellationToken::new();
        let ctx = ctx().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let err = interp
            .invoke(json!({ "code": "x = 1" }), &ctx)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_drops_binding() {
        let backend = Arc::new(ScriptedBackend::available(BackendKind::Container));
        let interp = interpreter(vec![backend.clone()]);
        interp
            .invoke(json!({ "code": "x = 1" }), &ctx())
            .await
            .unwrap();
        assert_eq!(interp.selector().bound_kind().await, Some(BackendKind::Container));
        interp.shutdown().await;
        assert_eq!(interp.selector().bound_kind().await, None);
    }
}
