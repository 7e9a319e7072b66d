//! Step registry: a process-wide, read-mostly table mapping each step
//! type to its execution contract. The validator consults it for
//! required inputs and the engine for retry eligibility and timeouts.
//! Descriptors are data, not compiled-in branching, so new step types
//! ship without touching the execution engine.

use crate::types::SideEffect;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A declared input of a step type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, input_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_type: input_type.into(),
        }
    }
}

/// Execution contract for one step type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub step_type: String,
    pub required_inputs: Vec<InputSpec>,
    /// JSON schema of the output this step produces
    pub produces_output: Value,
    pub side_effect: SideEffect,
    pub supports_retry: bool,
    pub default_timeout_secs: u64,
}

impl StepDescriptor {
    /// Pure steps that fail are config errors and are never retried.
    pub fn retry_allowed(&self) -> bool {
        self.supports_retry && self.side_effect != SideEffect::Pure
    }
}

/// Registry of step descriptors, populated at startup and refreshable.
pub struct StepRegistry {
    inner: RwLock<HashMap<String, Arc<StepDescriptor>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the built-in step catalog.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        for descriptor in builtin_descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    /// Register or replace a descriptor.
    pub fn register(&self, descriptor: StepDescriptor) {
        self.inner
            .write()
            .expect("step registry lock poisoned")
            .insert(descriptor.step_type.clone(), Arc::new(descriptor));
    }

    /// Atomically replace the whole table.
    pub fn refresh(&self, descriptors: Vec<StepDescriptor>) {
        let mut table = HashMap::new();
        for descriptor in descriptors {
            table.insert(descriptor.step_type.clone(), Arc::new(descriptor));
        }
        *self.inner.write().expect("step registry lock poisoned") = table;
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<StepDescriptor>> {
        self.inner
            .read()
            .expect("step registry lock poisoned")
            .get(step_type)
            .cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.inner
            .read()
            .expect("step registry lock poisoned")
            .contains_key(step_type)
    }

    pub fn list(&self) -> Vec<Arc<StepDescriptor>> {
        let mut descriptors: Vec<_> = self
            .inner
            .read()
            .expect("step registry lock poisoned")
            .values()
            .cloned()
            .collect();
        descriptors.sort_by(|a, b| a.step_type.cmp(&b.step_type));
        descriptors
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn string_output(field: &str) -> Value {
    json!({"type": "object", "properties": {field: {"type": "string"}}})
}

/// Built-in step catalog.
fn builtin_descriptors() -> Vec<StepDescriptor> {
    vec![
        StepDescriptor {
            step_type: "ai_agent".to_string(),
            required_inputs: vec![InputSpec::new("task", "string"), InputSpec::new("prompt", "string")],
            produces_output: string_output("result"),
            side_effect: SideEffect::ExternalRead,
            supports_retry: true,
            default_timeout_secs: 120,
        },
        StepDescriptor {
            step_type: "email".to_string(),
            required_inputs: vec![
                InputSpec::new("to", "string"),
                InputSpec::new("subject", "string"),
                InputSpec::new("template", "string"),
            ],
            produces_output: string_output("message_id"),
            side_effect: SideEffect::ExternalWrite,
            supports_retry: true,
            default_timeout_secs: 30,
        },
        StepDescriptor {
            step_type: "slack_message".to_string(),
            required_inputs: vec![InputSpec::new("channel", "string"), InputSpec::new("message", "string")],
            produces_output: string_output("ts"),
            side_effect: SideEffect::ExternalWrite,
            supports_retry: true,
            default_timeout_secs: 30,
        },
        StepDescriptor {
            step_type: "social_post".to_string(),
            required_inputs: vec![InputSpec::new("content", "string"), InputSpec::new("account", "string")],
            produces_output: string_output("post_id"),
            side_effect: SideEffect::ExternalWrite,
            supports_retry: true,
            default_timeout_secs: 60,
        },
        StepDescriptor {
            step_type: "web_scrape".to_string(),
            required_inputs: vec![InputSpec::new("url", "string"), InputSpec::new("selectors", "array")],
            produces_output: json!({"type": "object", "properties": {"data": {"type": "array"}}}),
            side_effect: SideEffect::ExternalRead,
            supports_retry: true,
            default_timeout_secs: 60,
        },
        StepDescriptor {
            step_type: "http_request".to_string(),
            required_inputs: vec![InputSpec::new("url", "string")],
            produces_output: json!({"type": "object", "properties": {"status": {"type": "number"}, "body": {}}}),
            side_effect: SideEffect::ExternalRead,
            supports_retry: true,
            default_timeout_secs: 30,
        },
        StepDescriptor {
            step_type: "transform".to_string(),
            required_inputs: vec![InputSpec::new("operation", "string")],
            produces_output: json!({"type": "object", "properties": {"result": {}}}),
            side_effect: SideEffect::Pure,
            supports_retry: false,
            default_timeout_secs: 10,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_loaded() {
        let registry = StepRegistry::with_builtin();
        assert!(registry.contains("email"));
        assert!(registry.contains("transform"));
        assert!(!registry.contains("teleport"));
    }

    #[test]
    fn pure_steps_are_never_retried() {
        let registry = StepRegistry::with_builtin();
        let transform = registry.get("transform").unwrap();
        assert!(!transform.retry_allowed());

        let email = registry.get("email").unwrap();
        assert!(email.retry_allowed());
    }

    #[test]
    fn retry_flag_alone_is_not_enough() {
        let descriptor = StepDescriptor {
            step_type: "checksum".to_string(),
            required_inputs: vec![],
            produces_output: Value::Null,
            side_effect: SideEffect::Pure,
            supports_retry: true,
            default_timeout_secs: 5,
        };
        assert!(!descriptor.retry_allowed());
    }

    #[test]
    fn refresh_replaces_the_table() {
        let registry = StepRegistry::with_builtin();
        registry.refresh(vec![StepDescriptor {
            step_type: "only_one".to_string(),
            required_inputs: vec![],
            produces_output: Value::Null,
            side_effect: SideEffect::ExternalRead,
            supports_retry: false,
            default_timeout_secs: 5,
        }]);
        assert!(registry.contains("only_one"));
        assert!(!registry.contains("email"));
        assert_eq!(registry.list().len(), 1);
    }
}
