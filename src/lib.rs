//! # Conveyor — a multi-tenant workflow execution engine
//!
//! `conveyor` turns a validated task graph into a running, recoverable,
//! cancellable execution. Users submit declarative workflow definitions
//! (tasks, dependencies, variables) that execute against pluggable external
//! connectors through a single invocation contract. The engine provides:
//!
//! - **DAG scheduling**: Kahn-validated dependency graphs, ready-set
//!   dispatch, configurable failure policies (fail fast or continue
//!   independent branches).
//! - **Durable queuing**: a lease-based execution queue with per-execution
//!   FIFO ordering, at-least-once delivery, and crash recovery from the
//!   persistence store.
//! - **Retry/backoff**: fixed, linear, exponential, and jittered strategies
//!   applied to plugin invocation failures and timeouts.
//! - **Expression binding**: `${source(key)|fn}` parameter resolution
//!   against pluggable source resolvers (context dictionary, cached
//!   secrets).
//! - **Cooperative cancellation**: a process-wide registry keyed by
//!   `(tenant, workflow, execution)`, polled before every dispatch and
//!   retry.
//! - **Approval gates**: tasks that wait for an external decision before
//!   dispatch.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use conveyor::{parse_definition, DefinitionFormat, Engine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let yaml = std::fs::read_to_string("workflow.yaml").unwrap();
//!     let definition = parse_definition(&yaml, DefinitionFormat::Yaml).unwrap();
//!     let engine = Engine::builder().build().await.unwrap();
//!     let handle = engine
//!         .submit("tenant-1", definition, HashMap::new())
//!         .await
//!         .unwrap();
//!     let status = handle.wait().await;
//!     println!("{:?}", status);
//! }
//! ```

pub mod backoff;
pub mod cancel;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod plugin;
pub mod queue;
pub mod scheduler;
pub mod secrets;
pub mod store;

pub use crate::backoff::BackoffStrategy;
pub use crate::cancel::{CancellationRegistry, ExecutionKey};
pub use crate::context::ExecutionContext;
pub use crate::definition::{
    parse_definition, DefinitionFormat, ExecutionConfig, FailurePolicy, RetryPolicy,
    TaskDefinition, WorkflowDefinition,
};
pub use crate::engine::{Engine, EngineBuilder, EngineConfig, ExecutionHandle};
pub use crate::error::{GraphValidationKind, TaskError, WorkflowError, WorkflowResult};
pub use crate::events::{EngineEvent, EventEmitter};
pub use crate::executor::{TaskAssignment, TaskExecutor, TaskOutcome};
pub use crate::expression::{
    ExpressionEvaluator, MissingKeyBehavior, ResolveError, SecretsResolver, SourceResolver,
};
pub use crate::graph::{build_graph, TaskGraph};
pub use crate::plugin::{PluginError, PluginInvoker, PluginInvokerRegistry};
pub use crate::queue::{ExecutionQueue, QueueEntry, QueueEntryStatus, QueueError};
pub use crate::scheduler::{
    Approval, ApprovalStatus, ExecutionStatus, TaskExecution, TaskStatus, WorkflowExecution,
};
pub use crate::secrets::{SecretProvider, StaticSecretProvider};
pub use crate::store::{ExecutionStore, FileExecutionStore, MemoryExecutionStore, StoreError};
