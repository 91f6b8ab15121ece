//! Persisted execution entities and their state machines.
//!
//! Transitions are monotonic: no execution or task re-enters an earlier
//! state. The scheduler is the only writer; everything here is plain data
//! that stores can round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;

/// Workflow execution state machine:
/// `Pending → Running → {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether moving to `next` respects the state machine ordering.
    pub fn can_transition(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => next == ExecutionStatus::Running || next.is_terminal(),
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Task execution state machine:
/// `Pending → Ready → Running → {Completed | Failed | Skipped}`, with
/// `AwaitingApproval` gating the `Ready` transition for approval tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    AwaitingApproval,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Whether the task has not begun running. Used by the failure policies
    /// and cancellation, which only suppress work that has not started.
    pub fn is_unstarted(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::AwaitingApproval
        )
    }
}

/// One run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub definition_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub context: ExecutionContext,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(
        execution_id: impl Into<String>,
        definition_id: impl Into<String>,
        tenant_id: impl Into<String>,
        workflow_id: impl Into<String>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            definition_id: definition_id.into(),
            tenant_id: tenant_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            context,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// One attempt-series for a task within an execution. Attempts increment
/// the counter; they are not separate rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            error: None,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Approval gate for a single task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub task_id: String,
    pub status: ApprovalStatus,
    pub approver: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ApprovalStatus::Pending,
            approver: None,
            decided_at: None,
        }
    }
}
