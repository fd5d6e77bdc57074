//! Wrapper protocol, output capture and result assembly shared by backends
//!
//! Submitted code never runs bare. Backends run [`PYTHON_WRAPPER`], which
//! decodes the code from [`CODE_ENV_VAR`], executes it and reports through
//! marker lines on stdout. [`SandboxResult::from_raw`] turns the captured
//! streams back into a structured result.

use super::config::SandboxConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::Duration;

/// Printed on stdout after user code completes without raising
pub const SUCCESS_MARKER: &str = "__SANDBOX_SUCCESS__";
/// Printed on stderr when user code raises
pub const ERROR_MARKER: &str = "__SANDBOX_ERROR__";
/// Opens the JSON rendering of `_result`
pub const RESULT_START_MARKER: &str = "__RESULT_START__";
/// Closes the JSON rendering of `_result`
pub const RESULT_END_MARKER: &str = "__RESULT_END__";
/// Appended to any stream cut at `max_output_size`
pub const TRUNCATION_MARKER: &str = "\n... [OUTPUT TRUNCATED]";

/// Environment variable carrying the base64-encoded submission
pub const CODE_ENV_VAR: &str = "SANDBOX_CODE_B64";

/// Interpreter-side harness executed in place of the submitted code
pub const PYTHON_WRAPPER: &str = r#"import base64, json, os, sys, traceback
_code = base64.b64decode(os.environ.pop("SANDBOX_CODE_B64", "")).decode("utf-8")
_ns = {"__name__": "__main__"}
try:
    exec(compile(_code, "<sandbox>", "exec"), _ns)
    _result = _ns.get("_result")
    sys.stdout.flush()
    print()
    print("__SANDBOX_SUCCESS__")
    if _result is not None:
        print("__RESULT_START__")
        print(json.dumps(_result, default=str))
        print("__RESULT_END__")
    sys.stdout.flush()
except BaseException:
    print("__SANDBOX_ERROR__", file=sys.stderr)
    traceback.print_exc(file=sys.stderr)
    sys.exit(1)
"#;

/// Encode code for transport in [`CODE_ENV_VAR`]
pub fn encode_code(code: &str) -> String {
    STANDARD.encode(code.as_bytes())
}

/// Lowercase hex SHA-256 of the submitted code
pub fn content_hash(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

/// Cut `text` to at most `max` bytes on a char boundary.
///
/// Returns the text with [`TRUNCATION_MARKER`] appended and `true` when a
/// cut happened. Text of exactly `max` bytes is returned untouched.
pub fn truncate_output(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_string(), false);
    }

    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&text[..cut]);
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// Hard ceiling on bytes buffered per stream before marker parsing
pub fn collection_limit(max_output_size: usize) -> usize {
    max_output_size.saturating_mul(4).saturating_add(64 * 1024)
}

/// Byte buffer that keeps the start and the end of a stream.
///
/// Half of the ceiling holds the first bytes seen. The other half is a
/// sliding window over the most recent bytes, so the wrapper's closing
/// markers survive output of any length. Bytes in between are dropped.
#[derive(Debug, Default)]
pub struct CappedBuffer {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_limit: usize,
    tail_limit: usize,
    overflowed: bool,
}

impl CappedBuffer {
    /// Create a buffer holding at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        let tail_limit = limit / 2;
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_limit: limit - tail_limit,
            tail_limit,
            overflowed: false,
        }
    }

    /// Append bytes, dropping the middle of the stream once both halves fill
    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.head_limit.saturating_sub(self.head.len());
        let (front, rest) = bytes.split_at(bytes.len().min(room));
        self.head.extend_from_slice(front);
        if rest.is_empty() {
            return;
        }

        let keep = rest.len().min(self.tail_limit);
        let skipped = rest.len() - keep;
        let excess = (self.tail.len() + keep).saturating_sub(self.tail_limit);
        if skipped > 0 || excess > 0 {
            self.overflowed = true;
        }
        self.tail.drain(..excess);
        self.tail.extend(rest[skipped..].iter().copied());
    }

    /// Whether input was dropped
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Lossy UTF-8 view of the kept bytes.
    ///
    /// When the middle was dropped the tail starts on a fresh line, so a
    /// marker in the window is never glued to a partial head line.
    pub fn into_string(self) -> String {
        let mut bytes = self.head;
        if self.overflowed {
            bytes.push(b'\n');
        }
        bytes.extend(self.tail);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Streams and exit status as captured by a backend
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    /// Captured stdout, markers included
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Process exit code, when the backend could observe one
    pub exit_code: Option<i64>,
    /// Collection hit the hard ceiling
    pub overflowed: bool,
}

/// Stdout with wrapper markers extracted
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStdout {
    /// User-visible stdout with markers removed
    pub stdout: String,
    /// The success marker appeared on its own line
    pub saw_success: bool,
    /// Text between the result markers
    pub return_value: Option<String>,
}

/// Split wrapper markers out of raw stdout
pub fn parse_stdout(raw: &str) -> ParsedStdout {
    let mut lines = Vec::new();
    let mut saw_success = false;
    let mut in_result = false;
    let mut result_lines: Vec<&str> = Vec::new();
    let mut return_value = None;

    for line in raw.lines() {
        match line.trim_end() {
            SUCCESS_MARKER => saw_success = true,
            RESULT_START_MARKER if saw_success => {
                in_result = true;
                result_lines.clear();
            }
            RESULT_END_MARKER if in_result => {
                in_result = false;
                return_value = Some(result_lines.join("\n").trim().to_string());
            }
            ERROR_MARKER => {}
            _ if in_result => result_lines.push(line),
            _ => lines.push(line),
        }
    }

    ParsedStdout {
        stdout: lines.join("\n").trim().to_string(),
        saw_success,
        return_value,
    }
}

/// Structured outcome of one sandbox execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    /// Success marker seen and exit code zero
    pub success: bool,
    /// Captured stdout, markers removed
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// JSON value of the code's `_result` variable
    pub return_value: Option<Value>,
    /// Wall-clock execution time
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    /// Process exit code
    pub exit_code: Option<i64>,
    /// Failure description
    pub error_message: Option<String>,
    /// Some stream was cut at `max_output_size`
    pub truncated: bool,
    /// SHA-256 of the submitted code
    pub content_hash: String,
    /// When the result was assembled
    pub timestamp: DateTime<Utc>,
}

impl SandboxResult {
    /// Assemble a result from captured output.
    ///
    /// Markers are parsed before any truncation so a large stdout cannot hide
    /// the success marker.
    pub fn from_raw(
        raw: RawOutput,
        content_hash: String,
        config: &SandboxConfig,
        execution_time: Duration,
    ) -> Self {
        let parsed = parse_stdout(&raw.stdout);
        let success = parsed.saw_success && raw.exit_code == Some(0);

        let (stdout, stdout_cut) = truncate_output(&parsed.stdout, config.max_output_size);
        let (stderr, stderr_cut) = truncate_output(raw.stderr.trim(), config.max_output_size);

        let mut value_cut = false;
        let return_value = parsed.return_value.map(|text| {
            let (text, cut) = truncate_output(&text, config.max_output_size);
            value_cut = cut;
            if cut {
                Value::String(text)
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
        });

        let error_message = if success {
            None
        } else {
            Some(failure_message(&stderr, raw.exit_code, parsed.saw_success))
        };

        Self {
            success,
            stdout,
            stderr,
            return_value,
            execution_time,
            exit_code: raw.exit_code,
            error_message,
            truncated: stdout_cut || stderr_cut || value_cut || raw.overflowed,
            content_hash,
            timestamp: Utc::now(),
        }
    }

    /// Fields recorded alongside the audit entry of a sandboxed run
    pub fn to_audit_map(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("content_hash".into(), Value::String(self.content_hash.clone()));
        map.insert("success".into(), Value::Bool(self.success));
        map.insert(
            "execution_time_ms".into(),
            Value::from(self.execution_time.as_millis() as u64),
        );
        map.insert(
            "exit_code".into(),
            self.exit_code.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert("truncated".into(), Value::Bool(self.truncated));
        map.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        map
    }
}

fn failure_message(stderr: &str, exit_code: Option<i64>, saw_success: bool) -> String {
    let last_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && *l != ERROR_MARKER && *l != TRUNCATION_MARKER.trim());

    match (last_line, exit_code) {
        (Some(line), _) => line.to_string(),
        (None, Some(0)) if !saw_success => "Execution finished without success marker".to_string(),
        (None, Some(code)) => format!("Execution exited with code {}", code),
        (None, None) => "Execution did not report an exit code".to_string(),
    }
}

#[cfg(test)]
mod output_tests {
    use super::*;

    fn raw(stdout: &str, stderr: &str, exit_code: Option<i64>) -> RawOutput {
        RawOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            overflowed: false,
        }
    }

    #[test]
    fn content_hash_is_stable_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash("print(1)"), content_hash("print(1)"));
        assert_ne!(content_hash("print(1)"), content_hash("print(2)"));
    }

    #[test]
    fn truncation_boundary() {
        let max = 64;
        let exact = "a".repeat(max);
        let (out, cut) = truncate_output(&exact, max);
        assert!(!cut);
        assert_eq!(out, exact);

        let over = "a".repeat(max + 1);
        let (out, cut) = truncate_output(&over, max);
        assert!(cut);
        assert_eq!(out.len(), max + TRUNCATION_MARKER.len());
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let (out, cut) = truncate_output(&text, 5);
        assert!(cut);
        assert_eq!(out, format!("éé{}", TRUNCATION_MARKER));
    }

    #[test]
    fn capped_buffer_keeps_head_and_tail() {
        let mut buf = CappedBuffer::new(8);
        buf.push(b"abcd");
        buf.push(b"ef");
        assert!(!buf.overflowed());

        buf.push(b"ghijk");
        buf.push(b"lm");
        assert!(buf.overflowed());
        assert_eq!(buf.into_string(), "abcd\njklm");
    }

    #[test]
    fn capped_buffer_within_limit_is_untouched() {
        let mut buf = CappedBuffer::new(8);
        buf.push(b"abcdefgh");
        assert!(!buf.overflowed());
        assert_eq!(buf.into_string(), "abcdefgh");
    }

    #[test]
    fn markers_survive_output_past_the_collection_limit() {
        let max = 1024;
        let config = SandboxConfig::default().with_max_output_size(max);
        let mut buf = CappedBuffer::new(collection_limit(max));
        let chunk = "x".repeat(4096);
        for _ in 0..(collection_limit(max) * 2 / chunk.len()) {
            buf.push(chunk.as_bytes());
        }
        buf.push(b"\n__SANDBOX_SUCCESS__\n__RESULT_START__\n7\n__RESULT_END__\n");
        let overflowed = buf.overflowed();
        assert!(overflowed);

        let result = SandboxResult::from_raw(
            RawOutput {
                stdout: buf.into_string(),
                stderr: String::new(),
                exit_code: Some(0),
                overflowed,
            },
            content_hash("x"),
            &config,
            Duration::ZERO,
        );
        assert!(result.success, "{:?}", result.error_message);
        assert!(result.error_message.is_none());
        assert_eq!(result.return_value, Some(serde_json::json!(7)));
        assert!(result.truncated);
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn parse_extracts_markers_and_result() {
        let stdout = "hello\n\n__SANDBOX_SUCCESS__\n__RESULT_START__\n{\"x\": 1}\n__RESULT_END__\n";
        let parsed = parse_stdout(stdout);
        assert!(parsed.saw_success);
        assert_eq!(parsed.stdout, "hello");
        assert_eq!(parsed.return_value.as_deref(), Some("{\"x\": 1}"));
    }

    #[test]
    fn success_requires_marker_and_zero_exit() {
        let config = SandboxConfig::default();

        let ok = SandboxResult::from_raw(
            raw("out\n__SANDBOX_SUCCESS__\n", "", Some(0)),
            content_hash("x"),
            &config,
            Duration::from_millis(5),
        );
        assert!(ok.success);
        assert!(ok.error_message.is_none());
        assert_eq!(ok.stdout, "out");

        let no_marker = SandboxResult::from_raw(
            raw("out\n", "", Some(0)),
            content_hash("x"),
            &config,
            Duration::ZERO,
        );
        assert!(!no_marker.success);
        assert_eq!(
            no_marker.error_message.as_deref(),
            Some("Execution finished without success marker")
        );

        let bad_exit = SandboxResult::from_raw(
            raw(
                "__SANDBOX_SUCCESS__\n",
                "__SANDBOX_ERROR__\nTraceback (most recent call last):\nValueError: boom\n",
                Some(1),
            ),
            content_hash("x"),
            &config,
            Duration::ZERO,
        );
        assert!(!bad_exit.success);
        assert_eq!(bad_exit.error_message.as_deref(), Some("ValueError: boom"));
    }

    #[test]
    fn return_value_parsed_as_json() {
        let result = SandboxResult::from_raw(
            raw(
                "__SANDBOX_SUCCESS__\n__RESULT_START__\n[1, 2, 3]\n__RESULT_END__\n",
                "",
                Some(0),
            ),
            content_hash("x"),
            &SandboxConfig::default(),
            Duration::ZERO,
        );
        assert_eq!(result.return_value, Some(serde_json::json!([1, 2, 3])));
        assert!(!result.truncated);
    }

    #[test]
    fn oversized_stdout_is_truncated_after_marker_parsing() {
        let config = SandboxConfig::default().with_max_output_size(16);
        let stdout = format!("{}\n__SANDBOX_SUCCESS__\n", "z".repeat(100));
        let result = SandboxResult::from_raw(
            raw(&stdout, "", Some(0)),
            content_hash("x"),
            &config,
            Duration::ZERO,
        );
        assert!(result.success);
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 16 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn encode_code_is_standard_base64() {
        assert_eq!(encode_code("print(1)"), "cHJpbnQoMSk=");
    }
}
