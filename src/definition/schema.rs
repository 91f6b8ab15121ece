use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::BackoffStrategy;

/// Immutable workflow template: an ordered set of tasks, declared variables,
/// and execution configuration. Never mutated after validation; every
/// execution references it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub variables: HashMap<String, VariableSpec>,
    #[serde(default)]
    pub config: ExecutionConfig,
}

impl WorkflowDefinition {
    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Effective retry policy for a task: per-task override, else the
    /// workflow default.
    pub fn effective_retry(&self, task: &TaskDefinition) -> RetryPolicy {
        task.retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone())
    }

    /// Effective invocation timeout for a task.
    pub fn effective_timeout_secs(&self, task: &TaskDefinition) -> u64 {
        task.timeout_secs.unwrap_or(self.config.task_timeout_secs)
    }
}

/// One task in a definition: a plugin reference, raw parameter strings
/// (possibly containing expressions), and dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    pub id: String,
    pub plugin_type: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// Declared workflow variable: type, optional default, required flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
}

/// Execution configuration for a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Global wall-clock limit for one execution.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Default per-invocation timeout, overridable per task.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default)]
    pub default_retry: RetryPolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_task_timeout_secs() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            timeout_secs: default_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            default_retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// How a task failure affects the rest of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every task that has not started and fail the execution.
    #[default]
    FailFast,
    /// Skip only the failed task's transitive dependents; independent
    /// branches keep running.
    ContinueIndependentBranches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            backoff: BackoffStrategy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_definition() -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "wf-1",
            "tasks": [
                {"id": "a", "plugin_type": "s3", "operation": "get"},
                {
                    "id": "b",
                    "plugin_type": "mysql",
                    "operation": "query",
                    "depends_on": ["a"],
                    "timeout_secs": 10,
                    "retry": {"max_retries": 2}
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let def = minimal_definition();
        assert_eq!(def.config.timeout_secs, 3600);
        assert_eq!(def.config.task_timeout_secs, 300);
        assert_eq!(def.config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(def.config.default_retry.max_retries, 0);
        assert!(!def.tasks[0].requires_approval);
    }

    #[test]
    fn test_effective_retry_and_timeout() {
        let def = minimal_definition();
        let a = def.task("a").unwrap();
        let b = def.task("b").unwrap();

        assert_eq!(def.effective_retry(a).max_retries, 0);
        assert_eq!(def.effective_retry(b).max_retries, 2);
        assert_eq!(def.effective_timeout_secs(a), 300);
        assert_eq!(def.effective_timeout_secs(b), 10);
    }

    #[test]
    fn test_task_lookup() {
        let def = minimal_definition();
        assert!(def.task("a").is_some());
        assert!(def.task("missing").is_none());
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy =
            serde_json::from_str("\"continue_independent_branches\"").unwrap();
        assert_eq!(policy, FailurePolicy::ContinueIndependentBranches);
    }
}
