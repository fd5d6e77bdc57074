//! Capability registry
//!
//! Maps capability names to their spec and handler. Registration validates
//! the spec and overwrites any previous binding for the same name.

use super::handler::BoxedHandler;
use super::spec::{CapabilitySpec, MAX_DESCRIPTION_LEN, MAX_NAME_LEN};
use std::collections::HashMap;
use std::sync::Arc;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Spec name is empty, too long or contains whitespace
    InvalidName(String),
    /// Description is empty or too long
    InvalidDescription(String),
    /// Input schema is not a JSON object
    InvalidSchema(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidName(msg) => write!(f, "Invalid capability name: {}", msg),
            RegistryError::InvalidDescription(name) => {
                write!(
                    f,
                    "Capability '{}' needs a description of 1-{} characters",
                    name, MAX_DESCRIPTION_LEN
                )
            }
            RegistryError::InvalidSchema(name) => {
                write!(f, "Capability '{}' input schema must be a JSON object", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Check a spec before it is bound
pub fn validate_spec(spec: &CapabilitySpec) -> Result<(), RegistryError> {
    let name = &spec.name;
    if name.is_empty() {
        return Err(RegistryError::InvalidName("name is empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RegistryError::InvalidName(format!(
            "'{}' exceeds {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName(format!(
            "'{}' contains whitespace",
            name
        )));
    }

    let description_len = spec.description.chars().count();
    if description_len == 0 || description_len > MAX_DESCRIPTION_LEN {
        return Err(RegistryError::InvalidDescription(name.clone()));
    }

    if !spec.input_schema.is_object() {
        return Err(RegistryError::InvalidSchema(name.clone()));
    }

    Ok(())
}

/// A spec bound to its handler
#[derive(Clone)]
pub struct Registration {
    /// Immutable descriptor
    pub spec: Arc<CapabilitySpec>,
    /// Executable implementation
    pub handler: BoxedHandler,
}

/// Name-keyed capability table
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Registration>,
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a spec and handler, returning the binding it replaced
    pub fn register(
        &mut self,
        spec: CapabilitySpec,
        handler: BoxedHandler,
    ) -> Result<Option<Registration>, RegistryError> {
        validate_spec(&spec)?;
        let name = spec.name.clone();
        let registration = Registration {
            spec: Arc::new(spec),
            handler,
        };
        Ok(self.entries.insert(name, registration))
    }

    /// Remove a binding
    pub fn unregister(&mut self, name: &str) -> Option<Registration> {
        self.entries.remove(name)
    }

    /// Look up a binding
    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    /// Look up a spec
    pub fn get_spec(&self, name: &str) -> Option<Arc<CapabilitySpec>> {
        self.entries.get(name).map(|r| r.spec.clone())
    }

    /// All specs sorted by name
    pub fn list_specs(&self) -> Vec<Arc<CapabilitySpec>> {
        let mut specs: Vec<_> = self.entries.values().map(|r| r.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Specs matching a query, best match first.
    ///
    /// An exact name match ranks highest, then name, description and tag
    /// substring matches.
    pub fn discover(&self, query: &str) -> Vec<Arc<CapabilitySpec>> {
        let query = query.to_lowercase();
        let mut scored: Vec<(u8, Arc<CapabilitySpec>)> = self
            .entries
            .values()
            .filter_map(|r| {
                let score = match_score(&r.spec, &query);
                (score > 0).then(|| (score, r.spec.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        scored.into_iter().map(|(_, spec)| spec).collect()
    }

    /// Handlers of every binding
    pub fn handlers(&self) -> Vec<BoxedHandler> {
        self.entries.values().map(|r| r.handler.clone()).collect()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn match_score(spec: &CapabilitySpec, query: &str) -> u8 {
    let name = spec.name.to_lowercase();
    if name == query {
        return 100;
    }
    if name.contains(query) {
        return 90;
    }
    if spec.description.to_lowercase().contains(query) {
        return 70;
    }
    if spec.tags.iter().any(|t| t.to_lowercase().contains(query)) {
        return 60;
    }
    0
}
