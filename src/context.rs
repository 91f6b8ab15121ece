//! Per-execution variable context.
//!
//! Holds the declared workflow variables (defaults overlaid with submission
//! inputs) plus the accumulated task outputs, keyed by task id so downstream
//! parameter expressions can reference upstream results. Owned exclusively
//! by the scheduler for its execution; task executors receive snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::WorkflowDefinition;
use crate::error::WorkflowError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    variables: HashMap<String, Value>,
    task_outputs: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Seed a context from a definition's declared variables and the
    /// caller-supplied initial values. A required variable with neither a
    /// default nor a supplied value fails submission.
    pub fn seed(
        definition: &WorkflowDefinition,
        initial: HashMap<String, Value>,
    ) -> Result<Self, WorkflowError> {
        let mut variables = HashMap::new();
        for (name, spec) in &definition.variables {
            if let Some(default) = &spec.default {
                variables.insert(name.clone(), default.clone());
            }
        }
        variables.extend(initial);

        for (name, spec) in &definition.variables {
            if spec.required && !variables.contains_key(name) {
                return Err(WorkflowError::MissingVariable(name.clone()));
            }
        }

        Ok(ExecutionContext {
            variables,
            task_outputs: HashMap::new(),
        })
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn task_output(&self, task_id: &str) -> Option<&Value> {
        self.task_outputs.get(task_id)
    }

    pub fn set_task_output(&mut self, task_id: &str, output: Value) {
        self.task_outputs.insert(task_id.to_string(), output);
    }

    /// Dictionary lookup used by the expression evaluator. Variables shadow
    /// task outputs; a dotted key traverses into nested JSON
    /// (`fetch.status_code` reads field `status_code` of task `fetch`'s
    /// output).
    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.variables.get(key) {
            return Some(v.clone());
        }
        if let Some(v) = self.task_outputs.get(key) {
            return Some(v.clone());
        }

        let mut parts = key.split('.');
        let head = parts.next()?;
        let mut current = self
            .variables
            .get(head)
            .or_else(|| self.task_outputs.get(head))?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current.clone())
    }
}
