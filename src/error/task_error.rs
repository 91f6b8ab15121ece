use thiserror::Error;

use crate::expression::ResolveError;

/// Task-level errors
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Parameter resolution error: {0}")]
    ParameterResolution(#[from] ResolveError),
    #[error("No plugin invoker registered for type: {0}")]
    UnknownPlugin(String),
    #[error("Plugin invocation error ({plugin_type}/{operation}): {message}")]
    PluginInvocation {
        plugin_type: String,
        operation: String,
        message: String,
    },
    #[error("Task timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<TaskError>,
    },
    #[error("Approval rejected")]
    ApprovalRejected { approver: Option<String> },
    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Whether another attempt can change the outcome. Expression errors are
    /// excluded: retrying cannot materialize a missing context key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::PluginInvocation { .. } | TaskError::Timeout { .. }
        )
    }
}
