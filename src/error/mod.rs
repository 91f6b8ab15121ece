//! Error types, split by level the way the engine reports them: workflow-level
//! errors abort submission or surface on the execution record, task-level
//! errors are contained at the task boundary and recorded on the owning
//! [`TaskExecution`](crate::scheduler::TaskExecution).

mod task_error;
mod workflow_error;

pub use task_error::TaskError;
pub use workflow_error::{GraphValidationKind, WorkflowError, WorkflowResult};
