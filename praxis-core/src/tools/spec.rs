//! Capability descriptors

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Maximum capability name length
pub const MAX_NAME_LEN: usize = 128;
/// Maximum description length
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Risk classification, serialized as 0 to 3
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RiskLevel {
    /// Read-only, no external effects
    #[default]
    None,
    /// Minor, contained effects
    Low,
    /// Runs caller-supplied logic or touches shared state
    Medium,
    /// Destructive or externally visible effects
    High,
}

impl TryFrom<u8> for RiskLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RiskLevel::None),
            1 => Ok(RiskLevel::Low),
            2 => Ok(RiskLevel::Medium),
            3 => Ok(RiskLevel::High),
            other => Err(format!("risk level must be 0-3, got {}", other)),
        }
    }
}

impl From<RiskLevel> for u8 {
    fn from(level: RiskLevel) -> Self {
        level as u8
    }
}

/// Safety classification of a capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyProfile {
    /// Mutates state outside the call
    pub side_effect: bool,
    /// Needs outbound network access
    pub requires_network: bool,
    /// Needs filesystem access
    pub requires_filesystem: bool,
    /// Must run inside a sandbox
    pub requires_sandbox: bool,
    /// Risk classification
    pub risk_level: RiskLevel,
    /// Domains reachable when networking is needed
    pub allowed_domains: Vec<String>,
    /// Always audit, even when dispatcher auditing is disabled
    pub audit_required: bool,
}

impl SafetyProfile {
    /// Profile for a capability that runs untrusted code
    pub fn sandboxed() -> Self {
        Self {
            requires_sandbox: true,
            risk_level: RiskLevel::Medium,
            audit_required: true,
            ..Default::default()
        }
    }

    /// Builder: set risk level
    pub fn with_risk(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self
    }

    /// Builder: mark as side-effecting
    pub fn with_side_effects(mut self) -> Self {
        self.side_effect = true;
        self
    }

    /// Builder: require auditing
    pub fn with_audit_required(mut self) -> Self {
        self.audit_required = true;
        self
    }
}

/// Static description of one capability; immutable once registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Unique, stable identifier
    pub name: String,

    /// What the capability does
    pub description: String,

    /// JSON Schema for arguments
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,

    /// JSON Schema for output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Safety classification
    #[serde(default)]
    pub safety: SafetyProfile,

    /// Categorization tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Example invocations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl CapabilitySpec {
    /// Create a spec with an empty object schema
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
            output_schema: None,
            safety: SafetyProfile::default(),
            tags: Vec::new(),
            examples: Vec::new(),
        }
    }

    /// Builder: set the argument schema
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Builder: set the output schema
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Builder: set the safety profile
    pub fn with_safety(mut self, safety: SafetyProfile) -> Self {
        self.safety = safety;
        self
    }

    /// Builder: add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder: add an example invocation
    pub fn with_example(mut self, example: Value) -> Self {
        self.examples.push(example);
        self
    }

    /// Argument names the input schema marks as required
    pub fn required_arguments(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// OpenAI function-calling shape
    pub fn to_openai_function(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            },
        })
    }

    /// Anthropic tool-use shape
    pub fn to_anthropic_tool(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}
