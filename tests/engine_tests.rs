//! End-to-end engine scenarios: scheduling order, failure policies,
//! cancellation, approvals, and recovery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use conveyor::{
    Engine, EngineConfig, ExecutionStatus, ExecutionStore, MemoryExecutionStore, PluginError,
    PluginInvoker, TaskStatus, WorkflowDefinition, WorkflowError,
};

/// Test connector: the operation name selects the behavior, so one invoker
/// serves a whole definition. Calls are recorded in order.
struct ScriptedInvoker {
    calls: Mutex<Vec<String>>,
    fail_ops: HashSet<String>,
    delay: Duration,
    started_tx: Option<tokio::sync::mpsc::Sender<String>>,
}

impl ScriptedInvoker {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_ops: HashSet::new(),
            delay: Duration::from_millis(0),
            started_tx: None,
        }
    }

    fn failing(mut self, ops: &[&str]) -> Self {
        self.fail_ops = ops.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_start_signal(mut self, tx: tokio::sync::mpsc::Sender<String>) -> Self {
        self.started_tx = Some(tx);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PluginInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        operation: &str,
        parameters: &HashMap<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<Value, PluginError> {
        self.calls.lock().push(operation.to_string());
        if let Some(tx) = &self.started_tx {
            let _ = tx.send(operation.to_string()).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_ops.contains(operation) {
            Err(PluginError::Invocation(format!("{} exploded", operation)))
        } else {
            Ok(json!({ "operation": operation, "parameters": parameters }))
        }
    }
}

fn definition(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

/// `a → b, a → c, b,c → d` with per-task retry settings.
fn diamond(failure_policy: &str) -> WorkflowDefinition {
    definition(json!({
        "id": "diamond",
        "config": {"failure_policy": failure_policy},
        "tasks": [
            {"id": "a", "plugin_type": "test", "operation": "a"},
            {"id": "b", "plugin_type": "test", "operation": "b", "depends_on": ["a"]},
            {"id": "c", "plugin_type": "test", "operation": "c", "depends_on": ["a"]},
            {"id": "d", "plugin_type": "test", "operation": "d", "depends_on": ["b", "c"]},
        ],
    }))
}

async fn engine_with(invoker: Arc<ScriptedInvoker>, worker_count: usize) -> (Engine, Arc<MemoryExecutionStore>) {
    let store = Arc::new(MemoryExecutionStore::new());
    let engine = Engine::builder()
        .store(store.clone())
        .plugin("test", invoker)
        .config(EngineConfig {
            worker_count,
            ..EngineConfig::default()
        })
        .build()
        .await
        .unwrap();
    (engine, store)
}

async fn task_status(store: &MemoryExecutionStore, execution_id: &str, task_id: &str) -> TaskStatus {
    store
        .load_tasks(execution_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.task_id == task_id)
        .map(|t| t.status)
        .unwrap_or(TaskStatus::Pending)
}

async fn wait_for_task_status(
    store: &MemoryExecutionStore,
    execution_id: &str,
    task_id: &str,
    expected: TaskStatus,
) {
    for _ in 0..250 {
        if task_status(store, execution_id, task_id).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "task {} never reached {:?}; currently {:?}",
        task_id,
        expected,
        task_status(store, execution_id, task_id).await
    );
}

#[tokio::test]
async fn test_linear_workflow_respects_dependency_order() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (engine, store) = engine_with(invoker.clone(), 4).await;

    let def = definition(json!({
        "id": "linear",
        "tasks": [
            {"id": "first", "plugin_type": "test", "operation": "first"},
            {"id": "second", "plugin_type": "test", "operation": "second", "depends_on": ["first"]},
            {"id": "third", "plugin_type": "test", "operation": "third", "depends_on": ["second"]},
        ],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    let status = handle.wait().await;
    assert_eq!(status, ExecutionStatus::Completed);

    assert_eq!(invoker.calls(), vec!["first", "second", "third"]);

    let snapshot = engine.status(handle.execution_id()).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert!(snapshot.error.is_none());
    assert!(snapshot.completed_at.is_some());

    let tasks = store.load_tasks(handle.execution_id()).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(tasks.iter().all(|t| t.attempts == 1));
}

#[tokio::test]
async fn test_fail_fast_diamond() {
    let invoker = Arc::new(ScriptedInvoker::new().failing(&["b"]));
    // Single worker makes the b-before-c processing order deterministic.
    let (engine, store) = engine_with(invoker.clone(), 1).await;

    let handle = engine
        .submit("tenant-1", diamond("fail_fast"), HashMap::new())
        .await
        .unwrap();
    let status = handle.wait().await;
    assert_eq!(status, ExecutionStatus::Failed);

    let execution_id = handle.execution_id();
    assert_eq!(task_status(&store, execution_id, "a").await, TaskStatus::Completed);
    assert_eq!(task_status(&store, execution_id, "b").await, TaskStatus::Failed);
    assert_eq!(task_status(&store, execution_id, "c").await, TaskStatus::Skipped);
    assert_eq!(task_status(&store, execution_id, "d").await, TaskStatus::Skipped);

    let snapshot = engine.status(execution_id).await.unwrap();
    assert!(snapshot.error.as_deref().unwrap_or_default().contains("b"));

    // c and d were never invoked
    let calls = invoker.calls();
    assert!(!calls.contains(&"c".to_string()));
    assert!(!calls.contains(&"d".to_string()));
}

#[tokio::test]
async fn test_continue_independent_branches() {
    let invoker = Arc::new(ScriptedInvoker::new().failing(&["b"]));
    let (engine, store) = engine_with(invoker.clone(), 4).await;

    // b's branch dies, c's branch keeps going.
    let def = definition(json!({
        "id": "branches",
        "config": {"failure_policy": "continue_independent_branches"},
        "tasks": [
            {"id": "a", "plugin_type": "test", "operation": "a"},
            {"id": "b", "plugin_type": "test", "operation": "b", "depends_on": ["a"]},
            {"id": "b2", "plugin_type": "test", "operation": "b2", "depends_on": ["b"]},
            {"id": "c", "plugin_type": "test", "operation": "c", "depends_on": ["a"]},
            {"id": "c2", "plugin_type": "test", "operation": "c2", "depends_on": ["c"]},
        ],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    let status = handle.wait().await;
    assert_eq!(status, ExecutionStatus::Failed);

    let execution_id = handle.execution_id();
    assert_eq!(task_status(&store, execution_id, "b").await, TaskStatus::Failed);
    assert_eq!(task_status(&store, execution_id, "b2").await, TaskStatus::Skipped);
    assert_eq!(task_status(&store, execution_id, "c").await, TaskStatus::Completed);
    assert_eq!(task_status(&store, execution_id, "c2").await, TaskStatus::Completed);

    let calls = invoker.calls();
    assert!(calls.contains(&"c2".to_string()));
    assert!(!calls.contains(&"b2".to_string()));
}

#[tokio::test]
async fn test_retry_exhaustion_attempt_count() {
    let invoker = Arc::new(ScriptedInvoker::new().failing(&["flaky"]));
    let (engine, store) = engine_with(invoker.clone(), 2).await;

    let def = definition(json!({
        "id": "retry",
        "tasks": [{
            "id": "flaky",
            "plugin_type": "test",
            "operation": "flaky",
            "retry": {
                "max_retries": 3,
                "backoff": {"strategy": "fixed", "delay_ms": 1}
            }
        }],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    assert_eq!(handle.wait().await, ExecutionStatus::Failed);

    // Initial attempt + 3 retries
    assert_eq!(invoker.calls().len(), 4);
    let tasks = store.load_tasks(handle.execution_id()).await.unwrap();
    assert_eq!(tasks[0].attempts, 4);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(tasks[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Retries exhausted after 4 attempts"));
}

#[tokio::test]
async fn test_independent_tasks_run_concurrently() {
    struct ProbeInvoker {
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl PluginInvoker for ProbeInvoker {
        async fn invoke(
            &self,
            _operation: &str,
            _parameters: &HashMap<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<Value, PluginError> {
            let active = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(120)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    let probe = Arc::new(ProbeInvoker {
        current: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });
    let engine = Engine::builder()
        .plugin("probe", probe.clone())
        .build()
        .await
        .unwrap();

    let def = definition(json!({
        "id": "parallel",
        "tasks": [
            {"id": "left", "plugin_type": "probe", "operation": "left"},
            {"id": "right", "plugin_type": "probe", "operation": "right"},
        ],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    assert_eq!(handle.wait().await, ExecutionStatus::Completed);
    assert_eq!(probe.max_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancellation_skips_undispatched_dependents() {
    let (started_tx, mut started_rx) = tokio::sync::mpsc::channel(4);
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .with_delay(Duration::from_millis(200))
            .with_start_signal(started_tx),
    );
    let (engine, store) = engine_with(invoker.clone(), 2).await;

    let def = definition(json!({
        "id": "cancellable",
        "tasks": [
            {"id": "a", "plugin_type": "test", "operation": "a"},
            {"id": "b", "plugin_type": "test", "operation": "b", "depends_on": ["a"]},
        ],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();

    // Cancel once a's invocation is in flight, before b can be dispatched.
    assert_eq!(started_rx.recv().await.unwrap(), "a");
    assert!(engine.cancel("tenant-1", "cancellable", handle.execution_id()));

    let status = handle.wait().await;
    assert_eq!(status, ExecutionStatus::Cancelled);

    let execution_id = handle.execution_id();
    // a's in-flight attempt ran to completion; b was never dispatched.
    assert_eq!(task_status(&store, execution_id, "a").await, TaskStatus::Completed);
    assert_eq!(task_status(&store, execution_id, "b").await, TaskStatus::Skipped);
    assert_eq!(invoker.calls(), vec!["a"]);

    // Cancellation of a terminal execution reports unknown.
    assert!(!engine.cancel("tenant-1", "cancellable", execution_id));
}

#[tokio::test]
async fn test_approval_gate_approved() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (engine, store) = engine_with(invoker.clone(), 2).await;

    let def = definition(json!({
        "id": "gated",
        "tasks": [
            {"id": "prep", "plugin_type": "test", "operation": "prep"},
            {
                "id": "deploy",
                "plugin_type": "test",
                "operation": "deploy",
                "depends_on": ["prep"],
                "requires_approval": true
            },
        ],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    let execution_id = handle.execution_id().to_string();

    wait_for_task_status(&store, &execution_id, "deploy", TaskStatus::AwaitingApproval).await;
    assert!(!invoker.calls().contains(&"deploy".to_string()));

    engine
        .decide(&execution_id, "deploy", true, Some("alice".to_string()))
        .await
        .unwrap();

    assert_eq!(handle.wait().await, ExecutionStatus::Completed);
    assert!(invoker.calls().contains(&"deploy".to_string()));

    let approvals = store.load_approvals(&execution_id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].approver.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_approval_gate_rejected_behaves_like_failure() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (engine, store) = engine_with(invoker.clone(), 2).await;

    let def = definition(json!({
        "id": "gated",
        "tasks": [
            {
                "id": "deploy",
                "plugin_type": "test",
                "operation": "deploy",
                "requires_approval": true
            },
            {"id": "announce", "plugin_type": "test", "operation": "announce", "depends_on": ["deploy"]},
        ],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    let execution_id = handle.execution_id().to_string();

    wait_for_task_status(&store, &execution_id, "deploy", TaskStatus::AwaitingApproval).await;
    engine
        .decide(&execution_id, "deploy", false, Some("bob".to_string()))
        .await
        .unwrap();

    assert_eq!(handle.wait().await, ExecutionStatus::Failed);
    assert_eq!(task_status(&store, &execution_id, "deploy").await, TaskStatus::Skipped);
    assert_eq!(task_status(&store, &execution_id, "announce").await, TaskStatus::Skipped);
    assert!(invoker.calls().is_empty());

    let tasks = store.load_tasks(&execution_id).await.unwrap();
    let deploy = tasks.iter().find(|t| t.task_id == "deploy").unwrap();
    assert!(deploy
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Approval rejected"));

    // Deciding again is invalid.
    let err = engine
        .decide(&execution_id, "deploy", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidDecision(_)));
}

#[tokio::test]
async fn test_expression_parameters_resolve_through_context() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let store = Arc::new(MemoryExecutionStore::new());
    let engine = Engine::builder()
        .store(store.clone())
        .plugin("test", invoker)
        .secret_provider(Arc::new(conveyor::StaticSecretProvider::new(
            HashMap::from([("api_token".to_string(), "tok-42".to_string())]),
        )))
        .build()
        .await
        .unwrap();

    let def = definition(json!({
        "id": "expr",
        "variables": {
            "env": {"type": "string", "required": true},
        },
        "tasks": [
            {
                "id": "fetch",
                "plugin_type": "test",
                "operation": "fetch",
                "parameters": {"env": "${dictionary('env')|upper}"}
            },
            {
                "id": "push",
                "plugin_type": "test",
                "operation": "push",
                "depends_on": ["fetch"],
                "parameters": {
                    "from": "${dictionary('fetch.parameters.env')}",
                    "auth": "Bearer ${secrets('api_token')}"
                }
            },
        ],
    }));

    let handle = engine
        .submit(
            "tenant-1",
            def,
            HashMap::from([("env".to_string(), json!("prod"))]),
        )
        .await
        .unwrap();
    assert_eq!(handle.wait().await, ExecutionStatus::Completed);

    let tasks = store.load_tasks(handle.execution_id()).await.unwrap();
    let push = tasks.iter().find(|t| t.task_id == "push").unwrap();
    let result = push.result.as_ref().unwrap();
    assert_eq!(result["parameters"]["from"], json!("PROD"));
    assert_eq!(result["parameters"]["auth"], json!("Bearer tok-42"));
}

#[tokio::test]
async fn test_missing_context_key_fails_without_retry() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (engine, store) = engine_with(invoker.clone(), 2).await;

    let def = definition(json!({
        "id": "missing-key",
        "tasks": [{
            "id": "t",
            "plugin_type": "test",
            "operation": "t",
            "parameters": {"x": "${dictionary('nope')}"},
            "retry": {"max_retries": 3, "backoff": {"strategy": "fixed", "delay_ms": 1}}
        }],
    }));

    let handle = engine.submit("tenant-1", def, HashMap::new()).await.unwrap();
    assert_eq!(handle.wait().await, ExecutionStatus::Failed);

    // Resolution failure is fatal per task: no invocation ever happened.
    assert!(invoker.calls().is_empty());
    let tasks = store.load_tasks(handle.execution_id()).await.unwrap();
    assert_eq!(tasks[0].attempts, 0);
    assert!(tasks[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Key not found"));
}

#[tokio::test]
async fn test_graph_validation_rejected_before_execution() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (engine, store) = engine_with(invoker, 2).await;

    let def = definition(json!({
        "id": "cyclic",
        "tasks": [
            {"id": "a", "plugin_type": "test", "operation": "a", "depends_on": ["b"]},
            {"id": "b", "plugin_type": "test", "operation": "b", "depends_on": ["a"]},
        ],
    }));

    let err = engine
        .submit("tenant-1", def, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GraphValidation { .. }));

    // Nothing was persisted: validation precedes execution creation.
    assert!(store.load_active_executions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_of_unknown_execution() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let (engine, _store) = engine_with(invoker, 1).await;

    let err = engine.status("ghost").await.unwrap_err();
    assert!(matches!(err, WorkflowError::ExecutionNotFound(_)));

    let err = engine.decide("ghost", "t", true, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::ExecutionNotFound(_)));
}

#[tokio::test]
async fn test_recover_resumes_half_finished_execution() {
    use conveyor::{ExecutionContext, TaskExecution, WorkflowExecution};

    let store = Arc::new(MemoryExecutionStore::new());

    // Persisted state as an earlier process would have left it: `first`
    // completed, `second` ready with a queued entry, execution running.
    let def = definition(json!({
        "id": "resumable",
        "tasks": [
            {"id": "first", "plugin_type": "test", "operation": "first"},
            {"id": "second", "plugin_type": "test", "operation": "second", "depends_on": ["first"]},
        ],
    }));
    store.save_definition(&def).await.unwrap();

    let mut execution = WorkflowExecution::new(
        "exec-1",
        "resumable",
        "tenant-1",
        "resumable",
        ExecutionContext::default(),
    );
    execution.status = ExecutionStatus::Running;
    store.save_execution(&execution).await.unwrap();

    let mut first = TaskExecution::new("first");
    first.status = TaskStatus::Completed;
    first.attempts = 1;
    store.save_task("exec-1", &first).await.unwrap();
    let mut second = TaskExecution::new("second");
    second.status = TaskStatus::Ready;
    store.save_task("exec-1", &second).await.unwrap();

    let invoker = Arc::new(ScriptedInvoker::new());
    let engine = Engine::builder()
        .store(store.clone())
        .plugin("test", invoker.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(engine.recover().await.unwrap(), 1);

    let handle = engine.handle("exec-1").unwrap();
    assert_eq!(handle.wait().await, ExecutionStatus::Completed);

    // Only the unfinished task ran again.
    assert_eq!(invoker.calls(), vec!["second"]);
    assert_eq!(task_status(&store, "exec-1", "second").await, TaskStatus::Completed);
}
