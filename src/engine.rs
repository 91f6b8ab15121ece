//! Engine facade.
//!
//! Owns the shared infrastructure — store, queue, plugin registry,
//! cancellation registry, worker pool — and exposes the API the hosting
//! layer calls: [`Engine::submit`], [`Engine::cancel`], [`Engine::decide`],
//! [`Engine::status`], plus [`Engine::recover`] for resuming in-flight
//! executions after a restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cancel::{CancellationRegistry, ExecutionKey};
use crate::context::ExecutionContext;
use crate::definition::WorkflowDefinition;
use crate::error::{TaskError, WorkflowError, WorkflowResult};
use crate::events::{EngineEvent, EventEmitter};
use crate::executor::TaskExecutor;
use crate::expression::{MissingKeyBehavior, SecretsResolver};
use crate::graph::build_graph;
use crate::plugin::PluginInvokerRegistry;
use crate::queue::{ExecutionQueue, QueueEntry, QueueEntryStatus};
use crate::scheduler::{
    ExecutionStatus, Scheduler, SchedulerMap, SchedulerMsg, StartDecision, WorkflowExecution,
};
use crate::secrets::{SecretProvider, StaticSecretProvider};
use crate::store::{ExecutionStore, MemoryExecutionStore};

/// Engine-level configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the worker pool consuming the execution queue.
    pub worker_count: usize,
    /// Queue lease duration.
    pub lease_duration: Duration,
    /// What an unresolvable expression key does.
    pub missing_key: MissingKeyBehavior,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_duration: Duration::from_secs(30),
            missing_key: MissingKeyBehavior::Error,
        }
    }
}

/// Handle to a submitted execution.
///
/// Allows polling [`status()`](Self::status) and blocking on completion via
/// [`wait()`](Self::wait).
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: String,
    status_rx: watch::Receiver<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Current execution status (non-blocking).
    pub fn status(&self) -> ExecutionStatus {
        *self.status_rx.borrow()
    }

    /// Block until the execution reaches a terminal status.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

struct EngineInner {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<ExecutionQueue>,
    executor: TaskExecutor,
    secret_provider: Arc<dyn SecretProvider>,
    cancellations: Arc<CancellationRegistry>,
    schedulers: SchedulerMap,
    statuses: dashmap::DashMap<String, watch::Receiver<ExecutionStatus>>,
    events: EventEmitter,
    collected: Option<Arc<Mutex<Vec<EngineEvent>>>>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

/// Workflow execution engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            store: None,
            plugins: PluginInvokerRegistry::new(),
            secret_provider: None,
            config: EngineConfig::default(),
            collect_events: true,
        }
    }

    /// Submit a validated definition for execution. Graph validation runs
    /// here, before any state is persisted; the returned handle carries the
    /// new execution id.
    pub async fn submit(
        &self,
        tenant_id: &str,
        definition: WorkflowDefinition,
        initial_context: HashMap<String, Value>,
    ) -> WorkflowResult<ExecutionHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WorkflowError::ShuttingDown);
        }

        let graph = build_graph(&definition)?;
        let context = ExecutionContext::seed(&definition, initial_context)?;

        let execution_id = Uuid::new_v4().to_string();
        let execution = WorkflowExecution::new(
            execution_id.clone(),
            definition.id.clone(),
            tenant_id,
            definition.id.clone(),
            context,
        );

        self.inner.store.save_definition(&definition).await?;
        self.inner.store.save_execution(&execution).await?;

        let key = ExecutionKey::new(tenant_id, &definition.id, &execution_id);
        let cancel = self.inner.cancellations.register(key.clone());

        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Pending);
        let (tx, rx) = mpsc::channel(64);
        self.inner.schedulers.insert(execution_id.clone(), tx);
        self.inner
            .statuses
            .insert(execution_id.clone(), status_rx.clone());

        let scheduler = Scheduler::new(
            Arc::new(definition),
            graph,
            execution,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.queue),
            self.inner.events.clone(),
            cancel,
            key,
            Arc::clone(&self.inner.cancellations),
            Arc::clone(&self.inner.schedulers),
            Arc::new(SecretsResolver::new(Arc::clone(&self.inner.secret_provider))),
            status_tx,
            rx,
        );
        tokio::spawn(scheduler.run());

        Ok(ExecutionHandle {
            execution_id,
            status_rx,
        })
    }

    /// Signal cooperative cancellation. Returns false when the execution is
    /// unknown or already terminal.
    pub fn cancel(&self, tenant_id: &str, workflow_id: &str, execution_id: &str) -> bool {
        self.inner.cancellations.cancel(&ExecutionKey::new(
            tenant_id,
            workflow_id,
            execution_id,
        ))
    }

    /// Resolve an `AwaitingApproval` gate.
    pub async fn decide(
        &self,
        execution_id: &str,
        task_id: &str,
        approved: bool,
        approver: Option<String>,
    ) -> WorkflowResult<()> {
        let Some(tx) = self
            .inner
            .schedulers
            .get(execution_id)
            .map(|entry| entry.value().clone())
        else {
            return match self.inner.store.load_execution(execution_id).await? {
                Some(_) => Err(WorkflowError::InvalidDecision(task_id.to_string())),
                None => Err(WorkflowError::ExecutionNotFound(execution_id.to_string())),
            };
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SchedulerMsg::Decide {
            task_id: task_id.to_string(),
            approved,
            approver,
            reply: reply_tx,
        })
        .await
        .map_err(|_| WorkflowError::InvalidDecision(task_id.to_string()))?;

        reply_rx
            .await
            .map_err(|_| WorkflowError::Internal("scheduler dropped decision".to_string()))?
    }

    /// Snapshot of an execution, served from the store.
    pub async fn status(&self, execution_id: &str) -> WorkflowResult<WorkflowExecution> {
        self.inner
            .store
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Handle for an execution spawned by this engine instance.
    pub fn handle(&self, execution_id: &str) -> Option<ExecutionHandle> {
        self.inner.statuses.get(execution_id).map(|rx| ExecutionHandle {
            execution_id: execution_id.to_string(),
            status_rx: rx.value().clone(),
        })
    }

    /// Events collected so far (empty when collection is disabled).
    pub async fn events(&self) -> Vec<EngineEvent> {
        match &self.inner.collected {
            Some(events) => events.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Resume scheduling for every non-terminal execution found in the
    /// store. Queue entries were already rebuilt when the engine was built;
    /// this re-spawns the scheduler actors over their persisted state.
    /// Returns the number of executions resumed.
    pub async fn recover(&self) -> WorkflowResult<usize> {
        let active = self.inner.store.load_active_executions().await?;
        let mut resumed = 0;

        for execution in active {
            if self.inner.schedulers.contains_key(&execution.execution_id) {
                continue;
            }
            let Some(definition) = self
                .inner
                .store
                .load_definition(&execution.definition_id)
                .await?
            else {
                tracing::warn!(
                    execution_id = %execution.execution_id,
                    definition_id = %execution.definition_id,
                    "cannot recover execution: definition missing"
                );
                continue;
            };
            let graph = match build_graph(&definition) {
                Ok(graph) => graph,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution.execution_id,
                        error = %e,
                        "cannot recover execution: stored definition invalid"
                    );
                    continue;
                }
            };

            let tasks = self.inner.store.load_tasks(&execution.execution_id).await?;
            let approvals = self
                .inner
                .store
                .load_approvals(&execution.execution_id)
                .await?;

            let key = ExecutionKey::new(
                &execution.tenant_id,
                &execution.workflow_id,
                &execution.execution_id,
            );
            let cancel = self.inner.cancellations.register(key.clone());
            let (status_tx, status_rx) = watch::channel(execution.status);
            let (tx, rx) = mpsc::channel(64);
            self.inner
                .schedulers
                .insert(execution.execution_id.clone(), tx);
            self.inner
                .statuses
                .insert(execution.execution_id.clone(), status_rx);

            let scheduler = Scheduler::resume(
                Arc::new(definition),
                graph,
                execution,
                tasks,
                approvals,
                Arc::clone(&self.inner.store),
                Arc::clone(&self.inner.queue),
                self.inner.events.clone(),
                cancel,
                key,
                Arc::clone(&self.inner.cancellations),
                Arc::clone(&self.inner.schedulers),
                Arc::new(SecretsResolver::new(Arc::clone(&self.inner.secret_provider))),
                status_tx,
                rx,
            );
            tokio::spawn(scheduler.run());
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Stop accepting work and wind the worker pool down. In-flight tasks
    /// finish their current attempt; leases on unfinished entries expire
    /// and survive in the store for the next start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

pub struct EngineBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    plugins: PluginInvokerRegistry,
    secret_provider: Option<Arc<dyn SecretProvider>>,
    config: EngineConfig,
    collect_events: bool,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a plugin invoker under its plugin type.
    pub fn plugin(
        mut self,
        plugin_type: impl Into<String>,
        invoker: Arc<dyn crate::plugin::PluginInvoker>,
    ) -> Self {
        self.plugins.register(plugin_type, invoker);
        self
    }

    pub fn secret_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.secret_provider = Some(provider);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable event collection.
    pub fn collect_events(mut self, collect: bool) -> Self {
        self.collect_events = collect;
        self
    }

    /// Build the engine: restore the queue from the store and start the
    /// worker pool.
    pub async fn build(self) -> WorkflowResult<Engine> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryExecutionStore::new()));
        let secret_provider = self
            .secret_provider
            .unwrap_or_else(|| Arc::new(StaticSecretProvider::default()));

        let queue = Arc::new(
            ExecutionQueue::restore(Arc::clone(&store), self.config.lease_duration).await?,
        );

        let (event_tx, mut event_rx) = mpsc::channel(256);
        let event_active = Arc::new(AtomicBool::new(self.collect_events));
        let events = EventEmitter::new(event_tx, Arc::clone(&event_active));
        let collected = if self.collect_events {
            let sink = Arc::new(Mutex::new(Vec::new()));
            let sink_task = Arc::clone(&sink);
            let active_flag = Arc::clone(&event_active);
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    sink_task.lock().await.push(event);
                }
                active_flag.store(false, Ordering::Relaxed);
            });
            Some(sink)
        } else {
            event_active.store(false, Ordering::Relaxed);
            None
        };

        let plugins = Arc::new(self.plugins);
        let executor = TaskExecutor::new(
            Arc::clone(&plugins),
            self.config.missing_key,
            events.clone(),
        );

        let inner = Arc::new(EngineInner {
            store,
            queue,
            executor,
            secret_provider,
            cancellations: Arc::new(CancellationRegistry::new()),
            schedulers: Arc::new(dashmap::DashMap::new()),
            statuses: dashmap::DashMap::new(),
            events,
            collected,
            config: self.config,
            shutdown: CancellationToken::new(),
        });

        for n in 0..inner.config.worker_count.max(1) {
            let worker_inner = Arc::clone(&inner);
            let worker_id = format!("worker-{}", n);
            tokio::spawn(async move {
                worker_loop(worker_inner, worker_id).await;
            });
        }

        Ok(Engine { inner })
    }
}

async fn worker_loop(inner: Arc<EngineInner>, worker_id: String) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match inner.queue.dequeue(&worker_id).await {
            Some(entry) => process_entry(&inner, &worker_id, entry).await,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.queue.wait_for_work() => {}
                    // Periodic wake-up so expired leases are swept even
                    // without new enqueues.
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        }
    }
}

async fn process_entry(inner: &Arc<EngineInner>, worker_id: &str, entry: QueueEntry) {
    let Some(tx) = inner
        .schedulers
        .get(&entry.execution_id)
        .map(|s| s.value().clone())
    else {
        // Orphaned entry: its execution is terminal or not yet recovered.
        let _ = inner
            .queue
            .acknowledge(&entry.entry_id, worker_id, QueueEntryStatus::Cancelled)
            .await;
        return;
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = SchedulerMsg::StartTask {
        task_id: entry.task_id.clone(),
        reply: reply_tx,
    };
    if tx.send(request).await.is_err() {
        let _ = inner
            .queue
            .acknowledge(&entry.entry_id, worker_id, QueueEntryStatus::Cancelled)
            .await;
        return;
    }
    let decision = match reply_rx.await {
        Ok(decision) => decision,
        Err(_) => {
            let _ = inner
                .queue
                .acknowledge(&entry.entry_id, worker_id, QueueEntryStatus::Cancelled)
                .await;
            return;
        }
    };

    let assignment = match decision {
        StartDecision::Allowed(assignment) => assignment,
        StartDecision::Denied => {
            let _ = inner
                .queue
                .acknowledge(&entry.entry_id, worker_id, QueueEntryStatus::Cancelled)
                .await;
            return;
        }
    };

    // Keep the lease alive while the task runs.
    let keepalive_period = (inner.config.lease_duration / 2).max(Duration::from_secs(1));
    let execution = inner.executor.execute(*assignment);
    tokio::pin!(execution);
    let outcome = loop {
        tokio::select! {
            outcome = &mut execution => break outcome,
            _ = tokio::time::sleep(keepalive_period) => {
                if let Err(e) = inner.queue.extend_lease(&entry.entry_id, worker_id).await {
                    tracing::warn!(
                        entry_id = %entry.entry_id,
                        worker_id = %worker_id,
                        error = %e,
                        "lease extension failed; continuing current attempt"
                    );
                }
            }
        }
    };

    let ack_status = match &outcome.result {
        Ok(_) => QueueEntryStatus::Completed,
        Err(TaskError::Cancelled) => QueueEntryStatus::Cancelled,
        Err(_) => QueueEntryStatus::Failed,
    };
    if let Err(e) = inner
        .queue
        .acknowledge(&entry.entry_id, worker_id, ack_status)
        .await
    {
        tracing::warn!(
            entry_id = %entry.entry_id,
            worker_id = %worker_id,
            error = %e,
            "queue acknowledgement failed"
        );
    }
    let _ = tx.send(SchedulerMsg::Outcome(outcome)).await;
}
