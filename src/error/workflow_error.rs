//! Workflow-level error types.

use thiserror::Error;

use super::TaskError;

/// What a graph validation failure was about. Always fatal and always
/// reported before any task execution is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphValidationKind {
    Cycle,
    DanglingReference,
    DuplicateTaskId,
}

impl std::fmt::Display for GraphValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphValidationKind::Cycle => write!(f, "cycle"),
            GraphValidationKind::DanglingReference => write!(f, "dangling reference"),
            GraphValidationKind::DuplicateTaskId => write!(f, "duplicate task id"),
        }
    }
}

/// Workflow-level errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Definition parse error: {0}")]
    DefinitionParse(String),
    #[error("Graph validation error ({kind}): {detail}")]
    GraphValidation {
        kind: GraphValidationKind,
        detail: String,
    },
    #[error("Required variable missing: {0}")]
    MissingVariable(String),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("No pending approval for task: {0}")]
    InvalidDecision(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Task error: {0}")]
    Task(Box<TaskError>),
    #[error("Engine is shutting down")]
    ShuttingDown,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TaskError> for WorkflowError {
    fn from(value: TaskError) -> Self {
        WorkflowError::Task(Box::new(value))
    }
}

impl From<crate::store::StoreError> for WorkflowError {
    fn from(value: crate::store::StoreError) -> Self {
        WorkflowError::Store(value.to_string())
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        assert_eq!(
            WorkflowError::DefinitionParse("x".into()).to_string(),
            "Definition parse error: x"
        );
        assert_eq!(
            WorkflowError::GraphValidation {
                kind: GraphValidationKind::Cycle,
                detail: "a -> b -> a".into()
            }
            .to_string(),
            "Graph validation error (cycle): a -> b -> a"
        );
        assert_eq!(
            WorkflowError::ExecutionNotFound("e1".into()).to_string(),
            "Execution not found: e1"
        );
        assert_eq!(
            WorkflowError::MissingVariable("env".into()).to_string(),
            "Required variable missing: env"
        );
        assert_eq!(
            WorkflowError::InvalidDecision("t1".into()).to_string(),
            "No pending approval for task: t1"
        );
    }

    #[test]
    fn test_workflow_error_from_task_error() {
        let task_err = TaskError::Cancelled;
        let wf_err: WorkflowError = task_err.into();
        assert!(matches!(wf_err, WorkflowError::Task(_)));
        assert!(wf_err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_graph_validation_kind_display() {
        assert_eq!(GraphValidationKind::Cycle.to_string(), "cycle");
        assert_eq!(
            GraphValidationKind::DanglingReference.to_string(),
            "dangling reference"
        );
        assert_eq!(
            GraphValidationKind::DuplicateTaskId.to_string(),
            "duplicate task id"
        );
    }
}
