//! Process-wide cancellation registry.
//!
//! Maps `(tenant, workflow, execution)` to a cancellation signal. The signal
//! is advisory and cooperative: the scheduler and task executor poll it
//! before each dispatch and before each retry; in-flight plugin calls are
//! never preempted. Entries are inserted when an execution starts and
//! removed when it reaches a terminal state; once signalled, cancellation is
//! permanent for that execution.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    pub tenant_id: String,
    pub workflow_id: String,
    pub execution_id: String,
}

impl ExecutionKey {
    pub fn new(
        tenant_id: impl Into<String>,
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
        }
    }
}

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<ExecutionKey, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    /// Register an execution and return its token. Re-registering an
    /// existing key returns the already-registered token unchanged, so a
    /// recovery pass cannot reset a signalled cancellation.
    pub fn register(&self, key: ExecutionKey) -> CancellationToken {
        self.tokens
            .entry(key)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Signal cancellation. Returns false when the execution is unknown
    /// (never started or already terminal).
    pub fn cancel(&self, key: &ExecutionKey) -> bool {
        match self.tokens.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, key: &ExecutionKey) -> bool {
        self.tokens
            .get(key)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Remove a terminal execution's entry.
    pub fn remove(&self, key: &ExecutionKey) {
        self.tokens.remove(key);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
