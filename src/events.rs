//! Engine event stream.
//!
//! Every externally observable transition is emitted as an [`EngineEvent`].
//! Emission is skipped cheaply when no listener is attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Events emitted during workflow execution
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ExecutionStarted {
        execution_id: String,
        definition_id: String,
    },
    TaskEnqueued {
        execution_id: String,
        task_id: String,
    },
    TaskStarted {
        execution_id: String,
        task_id: String,
    },
    TaskRetrying {
        execution_id: String,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskCompleted {
        execution_id: String,
        task_id: String,
    },
    TaskFailed {
        execution_id: String,
        task_id: String,
        error: String,
    },
    TaskSkipped {
        execution_id: String,
        task_id: String,
    },
    ApprovalRequested {
        execution_id: String,
        task_id: String,
    },
    ApprovalDecided {
        execution_id: String,
        task_id: String,
        approved: bool,
    },
    ExecutionCompleted {
        execution_id: String,
    },
    ExecutionFailed {
        execution_id: String,
        error: String,
    },
    ExecutionCancelled {
        execution_id: String,
    },
}

/// Sender wrapper for engine events, with an atomic active flag so that
/// event emission can be cheaply skipped when no listener is attached.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<EngineEvent>,
    active: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<EngineEvent>, active: Arc<AtomicBool>) -> Self {
        Self { tx, active }
    }

    /// An emitter with no listener; every emit is a no-op.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub async fn emit(&self, event: EngineEvent) {
        if self.is_active() {
            let _ = self.tx.send(event).await;
        }
    }
}
