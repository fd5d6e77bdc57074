//! Static gate for submitted code
//!
//! Two checks run before any sandbox is touched: a case-insensitive substring
//! denylist, then an import allow-list evaluated on a tree-sitter parse of the
//! code. A parse error is its own rejection.

use super::config::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tree_sitter::{Node, Parser};

/// Substrings that are always rejected
pub const BASE_BLOCKED_PATTERNS: &[&str] = &[
    "subprocess",
    "os.system",
    "os.popen",
    "os.spawn",
    "os.exec",
    "eval(",
    "exec(",
    "__import__",
    "importlib",
    "__builtins__",
    "ctypes",
    "open(",
    "file(",
    "fileio",
    "io.open",
];

/// Substrings rejected unless networking is enabled
pub const NETWORK_BLOCKED_PATTERNS: &[&str] =
    &["socket", "urllib", "requests", "http.client", "ftplib"];

/// Why code was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    /// A denylisted substring appeared
    BlockedPattern,
    /// An import named a module outside the allow-list
    DisallowedImport,
    /// The code did not parse
    SyntaxError,
}

/// A rejection with the exact reason surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationFailure {
    /// Rejection category
    pub kind: RejectionKind,
    /// Human-readable reason
    pub message: String,
}

impl ValidationFailure {
    fn blocked(pattern: &str) -> Self {
        Self {
            kind: RejectionKind::BlockedPattern,
            message: format!("Blocked pattern detected: {}", pattern),
        }
    }

    fn import(module: &str) -> Self {
        Self {
            kind: RejectionKind::DisallowedImport,
            message: format!("Import not allowed: {}", module),
        }
    }

    fn syntax(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: RejectionKind::SyntaxError,
            message: format!("Syntax error in code: {}", detail),
        }
    }
}

/// Denylist and import allow-list checker for Python submissions
#[derive(Debug, Clone)]
pub struct CodeValidator {
    patterns: Vec<String>,
    allowed_imports: BTreeSet<String>,
}

impl CodeValidator {
    /// Build the validator a sandbox config implies
    pub fn from_config(config: &SandboxConfig) -> Self {
        let mut patterns: Vec<String> = BASE_BLOCKED_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        if !config.network_enabled {
            patterns.extend(NETWORK_BLOCKED_PATTERNS.iter().map(|p| p.to_string()));
        }
        patterns.extend(
            config
                .extra_blocked_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .cloned(),
        );

        Self {
            patterns,
            allowed_imports: config.allowed_imports.clone(),
        }
    }

    /// Patterns checked, in order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check code, returning the first rejection found
    pub fn validate(&self, code: &str) -> Result<(), ValidationFailure> {
        self.check_patterns(code)?;
        self.check_imports(code)
    }

    fn check_patterns(&self, code: &str) -> Result<(), ValidationFailure> {
        let lowered = code.to_lowercase();
        match self
            .patterns
            .iter()
            .find(|p| lowered.contains(&p.to_lowercase()))
        {
            Some(pattern) => Err(ValidationFailure::blocked(pattern)),
            None => Ok(()),
        }
    }

    fn check_imports(&self, code: &str) -> Result<(), ValidationFailure> {
        let mut parser = Parser::new();
        parser
            .set_language(tree_sitter_python::language())
            .map_err(|e| ValidationFailure::syntax(format!("parser unavailable: {:?}", e)))?;

        let tree = parser
            .parse(code, None)
            .ok_or_else(|| ValidationFailure::syntax("parse aborted"))?;
        let root = tree.root_node();

        if root.has_error() {
            let detail = first_error(&root)
                .map(|node| {
                    let pos = node.start_position();
                    format!(
                        "invalid syntax (line {}, column {})",
                        pos.row + 1,
                        pos.column + 1
                    )
                })
                .unwrap_or_else(|| "invalid syntax".to_string());
            return Err(ValidationFailure::syntax(detail));
        }

        let mut imports = Vec::new();
        collect_imports(&root, code, &mut imports);

        for module in imports {
            if module.starts_with('.') {
                return Err(ValidationFailure::import(&module));
            }
            let top_level = module.split('.').next().unwrap_or_default();
            if !self.allowed_imports.contains(top_level) {
                return Err(ValidationFailure::import(top_level));
            }
        }

        Ok(())
    }
}

fn first_error<'t>(node: &Node<'t>) -> Option<Node<'t>> {
    if node.is_error() || node.is_missing() {
        return Some(*node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'t>> = node.children(&mut cursor).collect();
    children
        .iter()
        .filter(|child| child.has_error())
        .find_map(first_error)
}

/// Module paths named by every import statement under `node`
fn collect_imports(node: &Node, source: &str, out: &mut Vec<String>) {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                let name = match child.kind() {
                    "aliased_import" => child.child_by_field_name("name"),
                    "dotted_name" => Some(child),
                    _ => None,
                };
                if let Some(name) = name {
                    out.push(source[name.byte_range()].to_string());
                }
            }
            return;
        }
        "import_from_statement" => {
            if let Some(module) = node.child_by_field_name("module_name") {
                out.push(source[module.byte_range()].to_string());
            }
            return;
        }
        "future_import_statement" => {
            out.push("__future__".to_string());
            return;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_imports(&child, source, out);
    }
}

#[cfg(test)]
mod validator_tests {
    use super::*;

    fn validator() -> CodeValidator {
        CodeValidator::from_config(&SandboxConfig::default())
    }

    #[test]
    fn accepts_allow_listed_imports() {
        let code = "import math\nfrom collections import Counter\nimport json as j\n_result = math.sqrt(16)\n";
        assert!(validator().validate(code).is_ok());
    }

    #[test]
    fn allow_list_checks_top_level_segment() {
        let err = validator().validate("import os.path").unwrap_err();
        assert_eq!(err.message, "Import not allowed: os");
        let err = validator()
            .validate("from xml.etree import ElementTree\n")
            .unwrap_err();
        assert_eq!(err.message, "Import not allowed: xml");
        let v = CodeValidator::from_config(&SandboxConfig::default().allow_import("xml"));
        assert!(v.validate("import xml.etree.ElementTree as ET").is_ok());
    }

    #[test]
    fn rejects_blocked_pattern_case_insensitively() {
        let err = validator()
            .validate("import SubProcess\nSUBPROCESS.run(['ls'])")
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::BlockedPattern);
        assert_eq!(err.message, "Blocked pattern detected: subprocess");
    }

    #[test]
    fn rejects_dynamic_evaluation() {
        for code in ["eval('1+1')", "exec('x=1')", "__import__('os')", "open('/etc/passwd')"] {
            let err = validator().validate(code).unwrap_err();
            assert_eq!(err.kind, RejectionKind::BlockedPattern, "{}", code);
        }
    }

    #[test]
    fn rejects_raw_file_handles_from_io() {
        let code = "import io\n_result = io.FileIO('/etc/passwd').read().decode()\n";
        let err = validator().validate(code).unwrap_err();
        assert_eq!(err.kind, RejectionKind::BlockedPattern);
        assert_eq!(err.message, "Blocked pattern detected: fileio");

        let err = validator()
            .validate("import io\nreader = io.open\n")
            .unwrap_err();
        assert_eq!(err.message, "Blocked pattern detected: io.open");

        assert!(validator().validate("import io\nbuf = io.StringIO('x')\n").is_ok());
    }

    #[test]
    fn network_patterns_follow_config() {
        let err = validator().validate("import socket").unwrap_err();
        assert_eq!(err.kind, RejectionKind::BlockedPattern);

        let networked = CodeValidator::from_config(
            &SandboxConfig::default()
                .with_network(["example.com"])
                .allow_import("socket"),
        );
        assert!(networked.validate("import socket").is_ok());
    }

    #[test]
    fn rejects_disallowed_import() {
        let err = validator().validate("import pickle\n").unwrap_err();
        assert_eq!(err.kind, RejectionKind::DisallowedImport);
        assert_eq!(err.message, "Import not allowed: pickle");

        let err = validator()
            .validate("from shutil import rmtree\n")
            .unwrap_err();
        assert_eq!(err.message, "Import not allowed: shutil");
    }

    #[test]
    fn finds_nested_imports() {
        let code = "def f():\n    import pickle\n    return 1\n";
        let err = validator().validate(code).unwrap_err();
        assert_eq!(err.kind, RejectionKind::DisallowedImport);
    }

    #[test]
    fn rejects_relative_and_future_imports() {
        let err = validator().validate("from . import sibling\n").unwrap_err();
        assert_eq!(err.kind, RejectionKind::DisallowedImport);

        let err = validator()
            .validate("from __future__ import annotations\n")
            .unwrap_err();
        assert_eq!(err.message, "Import not allowed: __future__");
    }

    #[test]
    fn syntax_error_is_distinct() {
        let err = validator().validate("def broken(:\n    pass\n").unwrap_err();
        assert_eq!(err.kind, RejectionKind::SyntaxError);
        assert!(err.message.starts_with("Syntax error in code:"));
    }

    #[test]
    fn pattern_check_runs_before_parse() {
        let err = validator().validate("subprocess(((").unwrap_err();
        assert_eq!(err.kind, RejectionKind::BlockedPattern);
    }

    #[test]
    fn extra_patterns_are_applied() {
        let v = CodeValidator::from_config(&SandboxConfig::default().block_pattern("while True"));
        let err = v.validate("while true:\n    pass\n").unwrap_err();
        assert_eq!(err.message, "Blocked pattern detected: while True");
    }
}
