//! Per-execution scheduler.
//!
//! One scheduler actor drives one workflow execution: it owns the execution
//! record, the task states, and the context, and is their only writer. All
//! mutation flows through a single message channel — workers ask it to
//! start leased tasks and report terminal outcomes, the engine forwards
//! approval decisions — so ready-set computation is always consistent even
//! though dispatch is concurrent. Task-level errors never escape the actor;
//! they are recorded on the owning task execution.

mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

pub use state::{
    Approval, ApprovalStatus, ExecutionStatus, TaskExecution, TaskStatus, WorkflowExecution,
};

use crate::cancel::{CancellationRegistry, ExecutionKey};
use crate::definition::{FailurePolicy, WorkflowDefinition};
use crate::error::{TaskError, WorkflowError, WorkflowResult};
use crate::events::{EngineEvent, EventEmitter};
use crate::executor::{TaskAssignment, TaskOutcome};
use crate::expression::SecretsResolver;
use crate::graph::TaskGraph;
use crate::queue::ExecutionQueue;
use crate::store::ExecutionStore;

/// Live scheduler channels, shared with the engine's workers.
pub(crate) type SchedulerMap = Arc<DashMap<String, mpsc::Sender<SchedulerMsg>>>;

/// Messages serialized through a scheduler's single writer loop.
pub(crate) enum SchedulerMsg {
    /// A worker leased a queue entry and asks to start the task.
    StartTask {
        task_id: String,
        reply: oneshot::Sender<StartDecision>,
    },
    /// A worker finished a task attempt-series.
    Outcome(TaskOutcome),
    /// An external approval decision for an `AwaitingApproval` task.
    Decide {
        task_id: String,
        approved: bool,
        approver: Option<String>,
        reply: oneshot::Sender<WorkflowResult<()>>,
    },
}

pub(crate) enum StartDecision {
    Allowed(Box<TaskAssignment>),
    Denied,
}

pub(crate) struct Scheduler {
    definition: Arc<WorkflowDefinition>,
    graph: TaskGraph,
    execution: WorkflowExecution,
    tasks: HashMap<String, TaskExecution>,
    approvals: HashMap<String, Approval>,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<ExecutionQueue>,
    events: EventEmitter,
    cancel: CancellationToken,
    registry_key: ExecutionKey,
    cancellations: Arc<CancellationRegistry>,
    schedulers: SchedulerMap,
    secrets: Arc<SecretsResolver>,
    status_tx: watch::Sender<ExecutionStatus>,
    rx: mpsc::Receiver<SchedulerMsg>,
    /// A required task failed or an approval was rejected.
    failed: bool,
    cancel_requested: bool,
}

#[allow(clippy::too_many_arguments)]
impl Scheduler {
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        graph: TaskGraph,
        execution: WorkflowExecution,
        store: Arc<dyn ExecutionStore>,
        queue: Arc<ExecutionQueue>,
        events: EventEmitter,
        cancel: CancellationToken,
        registry_key: ExecutionKey,
        cancellations: Arc<CancellationRegistry>,
        schedulers: SchedulerMap,
        secrets: Arc<SecretsResolver>,
        status_tx: watch::Sender<ExecutionStatus>,
        rx: mpsc::Receiver<SchedulerMsg>,
    ) -> Self {
        Self {
            definition,
            graph,
            execution,
            tasks: HashMap::new(),
            approvals: HashMap::new(),
            store,
            queue,
            events,
            cancel,
            registry_key,
            cancellations,
            schedulers,
            secrets,
            status_tx,
            rx,
            failed: false,
            cancel_requested: false,
        }
    }

    /// Rebuild a scheduler over persisted state during recovery. Tasks that
    /// were `Running` at the crash are demoted to `Ready`; their queue
    /// entries (or lease-expired reclaims) will re-dispatch them.
    pub(crate) fn resume(
        definition: Arc<WorkflowDefinition>,
        graph: TaskGraph,
        execution: WorkflowExecution,
        tasks: Vec<TaskExecution>,
        approvals: Vec<Approval>,
        store: Arc<dyn ExecutionStore>,
        queue: Arc<ExecutionQueue>,
        events: EventEmitter,
        cancel: CancellationToken,
        registry_key: ExecutionKey,
        cancellations: Arc<CancellationRegistry>,
        schedulers: SchedulerMap,
        secrets: Arc<SecretsResolver>,
        status_tx: watch::Sender<ExecutionStatus>,
        rx: mpsc::Receiver<SchedulerMsg>,
    ) -> Self {
        let mut scheduler = Self::new(
            definition,
            graph,
            execution,
            store,
            queue,
            events,
            cancel,
            registry_key,
            cancellations,
            schedulers,
            secrets,
            status_tx,
            rx,
        );
        scheduler.failed = scheduler.execution.error.is_some();
        for mut task in tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Ready;
            }
            scheduler.tasks.insert(task.task_id.clone(), task);
        }
        for approval in approvals {
            scheduler.approvals.insert(approval.task_id.clone(), approval);
        }
        scheduler
    }

    pub(crate) async fn run(mut self) {
        if self.execution.status == ExecutionStatus::Pending {
            self.execution.status = ExecutionStatus::Running;
            self.execution.started_at = Some(Utc::now());
        }
        let _ = self.status_tx.send(ExecutionStatus::Running);
        self.persist_execution().await;
        self.events
            .emit(EngineEvent::ExecutionStarted {
                execution_id: self.execution.execution_id.clone(),
                definition_id: self.execution.definition_id.clone(),
            })
            .await;

        for task in &self.definition.tasks {
            if !self.tasks.contains_key(&task.id) {
                self.tasks
                    .insert(task.id.clone(), TaskExecution::new(task.id.clone()));
            }
        }
        for task in self.tasks.values().cloned().collect::<Vec<_>>() {
            self.persist_task(&task).await;
        }

        if self.cancel.is_cancelled() {
            self.on_cancel().await;
        } else {
            self.ensure_recovered_entries().await;
            self.dispatch_ready().await;
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.definition.config.timeout_secs);
        let mut timed_out = false;

        while !self.finished() {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = self.cancel.cancelled(), if !self.cancel_requested => {
                    self.on_cancel().await;
                }
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    timed_out = true;
                    self.on_timeout().await;
                }
            }
        }

        self.finalize().await;
    }

    fn finished(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::StartTask { task_id, reply } => {
                let decision = self.decide_start(&task_id).await;
                let _ = reply.send(decision);
            }
            SchedulerMsg::Outcome(outcome) => self.on_outcome(outcome).await,
            SchedulerMsg::Decide {
                task_id,
                approved,
                approver,
                reply,
            } => {
                let result = self.on_decide(&task_id, approved, approver).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Grant or deny a worker's request to run a leased task. `Running` is
    /// granted as well as `Ready`: with at-least-once delivery a reclaimed
    /// lease may re-request a task whose previous worker died mid-flight.
    async fn decide_start(&mut self, task_id: &str) -> StartDecision {
        if self.cancel_requested {
            return StartDecision::Denied;
        }
        let Some(task_def) = self.definition.task(task_id) else {
            return StartDecision::Denied;
        };
        let Some(task) = self.tasks.get_mut(task_id) else {
            return StartDecision::Denied;
        };
        if !matches!(task.status, TaskStatus::Ready | TaskStatus::Running) {
            return StartDecision::Denied;
        }

        if task.status == TaskStatus::Ready {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            let snapshot = task.clone();
            self.persist_task(&snapshot).await;
            self.events
                .emit(EngineEvent::TaskStarted {
                    execution_id: self.execution.execution_id.clone(),
                    task_id: task_id.to_string(),
                })
                .await;
        }

        StartDecision::Allowed(Box::new(TaskAssignment {
            execution_id: self.execution.execution_id.clone(),
            task: task_def.clone(),
            context: self.execution.context.clone(),
            retry: self.definition.effective_retry(task_def),
            timeout_secs: self.definition.effective_timeout_secs(task_def),
            cancel: self.cancel.clone(),
            secrets: Arc::clone(&self.secrets),
        }))
    }

    async fn on_outcome(&mut self, outcome: TaskOutcome) {
        let Some(task) = self.tasks.get_mut(&outcome.task_id) else {
            return;
        };
        // Duplicate delivery after a lease reclaim: first outcome wins.
        if task.status.is_terminal() {
            return;
        }

        task.attempts += outcome.attempts;
        task.completed_at = Some(Utc::now());

        match outcome.result {
            Ok(value) => {
                task.status = TaskStatus::Completed;
                task.result = Some(value.clone());
                let snapshot = task.clone();
                self.execution
                    .context
                    .set_task_output(&outcome.task_id, value);
                self.persist_task(&snapshot).await;
                self.persist_execution().await;
                self.events
                    .emit(EngineEvent::TaskCompleted {
                        execution_id: self.execution.execution_id.clone(),
                        task_id: outcome.task_id.clone(),
                    })
                    .await;
            }
            Err(TaskError::Cancelled) => {
                task.status = TaskStatus::Skipped;
                task.error = Some(TaskError::Cancelled.to_string());
                let snapshot = task.clone();
                self.persist_task(&snapshot).await;
                self.events
                    .emit(EngineEvent::TaskSkipped {
                        execution_id: self.execution.execution_id.clone(),
                        task_id: outcome.task_id.clone(),
                    })
                    .await;
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_string());
                let snapshot = task.clone();
                self.persist_task(&snapshot).await;
                self.events
                    .emit(EngineEvent::TaskFailed {
                        execution_id: self.execution.execution_id.clone(),
                        task_id: outcome.task_id.clone(),
                        error: error.to_string(),
                    })
                    .await;
                self.apply_failure_policy(&outcome.task_id).await;
            }
        }

        if !self.cancel_requested {
            self.dispatch_ready().await;
        }
    }

    async fn on_decide(
        &mut self,
        task_id: &str,
        approved: bool,
        approver: Option<String>,
    ) -> WorkflowResult<()> {
        if !self.tasks.contains_key(task_id) {
            return Err(WorkflowError::TaskNotFound(task_id.to_string()));
        }
        let awaiting = self
            .tasks
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::AwaitingApproval);
        let pending = self
            .approvals
            .get(task_id)
            .is_some_and(|a| a.status == ApprovalStatus::Pending);
        if !awaiting || !pending {
            return Err(WorkflowError::InvalidDecision(task_id.to_string()));
        }

        if let Some(approval) = self.approvals.get_mut(task_id) {
            approval.status = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            approval.approver = approver.clone();
            approval.decided_at = Some(Utc::now());
            let snapshot = approval.clone();
            self.persist_approval(&snapshot).await;
        }
        self.events
            .emit(EngineEvent::ApprovalDecided {
                execution_id: self.execution.execution_id.clone(),
                task_id: task_id.to_string(),
                approved,
            })
            .await;

        if approved {
            if let Some(task) = self.tasks.get_mut(task_id) {
                task.status = TaskStatus::Ready;
                let snapshot = task.clone();
                self.persist_task(&snapshot).await;
            }
            self.enqueue_task(task_id).await;
        } else {
            // Rejection behaves like a task failure under the workflow's
            // configured failure policy; the task itself ends Skipped.
            if let Some(task) = self.tasks.get_mut(task_id) {
                task.status = TaskStatus::Skipped;
                task.error = Some(TaskError::ApprovalRejected { approver }.to_string());
                task.completed_at = Some(Utc::now());
                let snapshot = task.clone();
                self.persist_task(&snapshot).await;
            }
            self.events
                .emit(EngineEvent::TaskSkipped {
                    execution_id: self.execution.execution_id.clone(),
                    task_id: task_id.to_string(),
                })
                .await;
            self.apply_failure_policy(task_id).await;
            if !self.cancel_requested {
                self.dispatch_ready().await;
            }
        }
        Ok(())
    }

    /// Compute the ready set and move newly ready tasks toward dispatch.
    async fn dispatch_ready(&mut self) {
        let satisfied: HashSet<String> = self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped))
            .map(|t| t.task_id.clone())
            .collect();

        for task_id in self.graph.ready_set(&satisfied) {
            let is_pending = self
                .tasks
                .get(&task_id)
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if !is_pending {
                continue;
            }
            let requires_approval = self
                .definition
                .task(&task_id)
                .is_some_and(|t| t.requires_approval);

            if requires_approval {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::AwaitingApproval;
                    let snapshot = task.clone();
                    self.persist_task(&snapshot).await;
                }
                let approval = Approval::pending(task_id.clone());
                self.approvals.insert(task_id.clone(), approval.clone());
                self.persist_approval(&approval).await;
                self.events
                    .emit(EngineEvent::ApprovalRequested {
                        execution_id: self.execution.execution_id.clone(),
                        task_id: task_id.clone(),
                    })
                    .await;
            } else {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Ready;
                    let snapshot = task.clone();
                    self.persist_task(&snapshot).await;
                }
                self.enqueue_task(&task_id).await;
            }
        }
    }

    async fn enqueue_task(&mut self, task_id: &str) {
        match self
            .queue
            .enqueue(&self.execution.execution_id, task_id)
            .await
        {
            Ok(_) => {
                self.events
                    .emit(EngineEvent::TaskEnqueued {
                        execution_id: self.execution.execution_id.clone(),
                        task_id: task_id.to_string(),
                    })
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %self.execution.execution_id,
                    task_id = %task_id,
                    error = %e,
                    "failed to enqueue ready task"
                );
            }
        }
    }

    /// Recovery path: `Ready` tasks restored from the store may have lost
    /// their queue entries; re-enqueue them.
    async fn ensure_recovered_entries(&mut self) {
        let ready: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.task_id.clone())
            .collect();
        for task_id in ready {
            if !self
                .queue
                .has_pending(&self.execution.execution_id, &task_id)
            {
                self.enqueue_task(&task_id).await;
            }
        }
    }

    async fn apply_failure_policy(&mut self, failed_task_id: &str) {
        self.failed = true;
        if self.execution.error.is_none() {
            self.execution.error = self
                .tasks
                .get(failed_task_id)
                .and_then(|t| t.error.clone())
                .map(|e| format!("task '{}': {}", failed_task_id, e));
            self.persist_execution().await;
        }

        let to_skip: Vec<String> = match self.definition.config.failure_policy {
            FailurePolicy::FailFast => self
                .tasks
                .values()
                .filter(|t| t.status.is_unstarted())
                .map(|t| t.task_id.clone())
                .collect(),
            FailurePolicy::ContinueIndependentBranches => {
                let dependents = self.graph.transitive_dependents(failed_task_id);
                self.tasks
                    .values()
                    .filter(|t| t.status.is_unstarted() && dependents.contains(&t.task_id))
                    .map(|t| t.task_id.clone())
                    .collect()
            }
        };
        self.skip_tasks(to_skip).await;
    }

    async fn on_cancel(&mut self) {
        self.cancel_requested = true;
        let to_skip: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status.is_unstarted())
            .map(|t| t.task_id.clone())
            .collect();
        self.skip_tasks(to_skip).await;
        self.queue
            .cancel_execution(&self.execution.execution_id)
            .await;
        // Running tasks drain through their normal outcomes; the loop ends
        // once every task is terminal.
    }

    async fn on_timeout(&mut self) {
        self.failed = true;
        if self.execution.error.is_none() {
            self.execution.error = Some(format!(
                "execution exceeded {}s timeout",
                self.definition.config.timeout_secs
            ));
            self.persist_execution().await;
        }
        let to_skip: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status.is_unstarted())
            .map(|t| t.task_id.clone())
            .collect();
        self.skip_tasks(to_skip).await;
        self.queue
            .cancel_execution(&self.execution.execution_id)
            .await;
    }

    async fn skip_tasks(&mut self, task_ids: Vec<String>) {
        for task_id in task_ids {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if !task.status.is_unstarted() {
                    continue;
                }
                task.status = TaskStatus::Skipped;
                task.completed_at = Some(Utc::now());
                let snapshot = task.clone();
                self.persist_task(&snapshot).await;
            }
            self.queue
                .cancel_pending(&self.execution.execution_id, &task_id)
                .await;
            self.events
                .emit(EngineEvent::TaskSkipped {
                    execution_id: self.execution.execution_id.clone(),
                    task_id,
                })
                .await;
        }
    }

    async fn finalize(&mut self) {
        let any_failed = self
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Failed);
        let next = if self.cancel_requested {
            ExecutionStatus::Cancelled
        } else if self.failed || any_failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        if self.execution.status.can_transition(next) {
            self.execution.status = next;
        }
        self.execution.completed_at = Some(Utc::now());
        self.persist_execution().await;

        let execution_id = self.execution.execution_id.clone();
        match self.execution.status {
            ExecutionStatus::Completed => {
                self.events
                    .emit(EngineEvent::ExecutionCompleted { execution_id })
                    .await;
            }
            ExecutionStatus::Cancelled => {
                self.events
                    .emit(EngineEvent::ExecutionCancelled { execution_id })
                    .await;
            }
            _ => {
                self.events
                    .emit(EngineEvent::ExecutionFailed {
                        execution_id,
                        error: self.execution.error.clone().unwrap_or_default(),
                    })
                    .await;
            }
        }

        // Deregister before publishing the terminal status: observers who
        // saw the execution finish must not find a live cancellation entry.
        self.cancellations.remove(&self.registry_key);
        self.schedulers.remove(&self.execution.execution_id);
        let _ = self.status_tx.send(self.execution.status);
    }

    async fn persist_execution(&self) {
        if let Err(e) = self.store.save_execution(&self.execution).await {
            tracing::warn!(
                execution_id = %self.execution.execution_id,
                error = %e,
                "failed to persist execution"
            );
        }
    }

    async fn persist_task(&self, task: &TaskExecution) {
        if let Err(e) = self
            .store
            .save_task(&self.execution.execution_id, task)
            .await
        {
            tracing::warn!(
                execution_id = %self.execution.execution_id,
                task_id = %task.task_id,
                error = %e,
                "failed to persist task execution"
            );
        }
    }

    async fn persist_approval(&self, approval: &Approval) {
        if let Err(e) = self
            .store
            .save_approval(&self.execution.execution_id, approval)
            .await
        {
            tracing::warn!(
                execution_id = %self.execution.execution_id,
                task_id = %approval.task_id,
                error = %e,
                "failed to persist approval"
            );
        }
    }
}
