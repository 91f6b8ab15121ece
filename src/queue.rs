//! Durable, lease-based execution queue.
//!
//! Entries for the same execution are handed out in enqueue order; entries
//! for different executions are independent and rotate fairly. A worker
//! claims an entry under a bounded lease; if it dies before acknowledging,
//! the lease expires and another worker may reclaim the entry, giving
//! at-least-once delivery. All claim/extend/acknowledge transitions happen
//! atomically under one lock, and every transition is written through the
//! [`ExecutionStore`] so the queue can be rebuilt after a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::store::{ExecutionStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Queued,
    Leased,
    Completed,
    Failed,
    Cancelled,
}

impl QueueEntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEntryStatus::Completed | QueueEntryStatus::Failed | QueueEntryStatus::Cancelled
        )
    }
}

/// One unit of dispatchable work: a task of an execution that is ready to
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: String,
    pub execution_id: String,
    pub task_id: String,
    /// Position in the per-execution FIFO.
    pub seq: u64,
    pub status: QueueEntryStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue entry not found: {0}")]
    NotFound(String),
    #[error("Lease lost for entry: {0}")]
    LeaseLost(String),
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<String, QueueEntry>,
    /// Non-terminal entry ids per execution, in seq order.
    per_execution: HashMap<String, VecDeque<String>>,
    /// Round-robin order across executions.
    execution_order: VecDeque<String>,
    next_seq: HashMap<String, u64>,
}

impl QueueInner {
    fn detach(&mut self, execution_id: &str, entry_id: &str) {
        if let Some(pending) = self.per_execution.get_mut(execution_id) {
            pending.retain(|id| id != entry_id);
            if pending.is_empty() {
                self.per_execution.remove(execution_id);
                self.execution_order.retain(|e| e != execution_id);
            }
        }
    }

    fn release_expired(&mut self, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let mut released = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.status == QueueEntryStatus::Leased
                && entry.lease_expires_at.is_some_and(|at| at <= now)
            {
                entry.status = QueueEntryStatus::Queued;
                entry.lease_owner = None;
                entry.lease_expires_at = None;
                released.push(entry.clone());
            }
        }
        released
    }
}

pub struct ExecutionQueue {
    store: Arc<dyn ExecutionStore>,
    inner: Mutex<QueueInner>,
    lease_duration: Duration,
    notify: Notify,
}

impl ExecutionQueue {
    /// Rebuild the queue from persisted entries. Leases held before the
    /// restart are released: their owners did not survive the process.
    pub async fn restore(
        store: Arc<dyn ExecutionStore>,
        lease_duration: std::time::Duration,
    ) -> Result<Self, StoreError> {
        let mut persisted = store.load_queue_entries().await?;
        persisted.retain(|e| !e.status.is_terminal());
        persisted.sort_by_key(|e| e.seq);

        let mut inner = QueueInner::default();
        let mut reset = Vec::new();
        for mut entry in persisted {
            if entry.status == QueueEntryStatus::Leased {
                entry.status = QueueEntryStatus::Queued;
                entry.lease_owner = None;
                entry.lease_expires_at = None;
                reset.push(entry.clone());
            }
            let next = inner.next_seq.entry(entry.execution_id.clone()).or_insert(0);
            *next = (*next).max(entry.seq + 1);
            if !inner.per_execution.contains_key(&entry.execution_id) {
                inner.execution_order.push_back(entry.execution_id.clone());
            }
            inner
                .per_execution
                .entry(entry.execution_id.clone())
                .or_default()
                .push_back(entry.entry_id.clone());
            inner.entries.insert(entry.entry_id.clone(), entry);
        }

        for entry in &reset {
            store.save_queue_entry(entry).await?;
        }

        Ok(Self {
            store,
            inner: Mutex::new(inner),
            lease_duration: Duration::from_std(lease_duration)
                .unwrap_or_else(|_| Duration::seconds(30)),
            notify: Notify::new(),
        })
    }

    /// Enqueue a ready task.
    pub async fn enqueue(&self, execution_id: &str, task_id: &str) -> Result<QueueEntry, StoreError> {
        let entry = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq.entry(execution_id.to_string()).or_insert(0);
            let entry = QueueEntry {
                entry_id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                task_id: task_id.to_string(),
                seq: *seq,
                status: QueueEntryStatus::Queued,
                lease_owner: None,
                lease_expires_at: None,
                enqueued_at: Utc::now(),
            };
            *seq += 1;
            if !inner.per_execution.contains_key(execution_id) {
                inner.execution_order.push_back(execution_id.to_string());
            }
            inner
                .per_execution
                .entry(execution_id.to_string())
                .or_default()
                .push_back(entry.entry_id.clone());
            inner.entries.insert(entry.entry_id.clone(), entry.clone());
            entry
        };

        self.store.save_queue_entry(&entry).await?;
        self.notify.notify_waiters();
        Ok(entry)
    }

    /// Claim the next available entry for `worker_id`, or `None` when no
    /// work is available. Expired leases are released first, so a crashed
    /// worker's entries become claimable here.
    pub async fn dequeue(&self, worker_id: &str) -> Option<QueueEntry> {
        let (released, leased) = {
            let mut inner = self.inner.lock();
            let released = inner.release_expired(Utc::now());

            let mut leased = None;
            for _ in 0..inner.execution_order.len() {
                let Some(execution_id) = inner.execution_order.pop_front() else {
                    break;
                };
                let candidate = inner
                    .per_execution
                    .get(&execution_id)
                    .into_iter()
                    .flatten()
                    .find(|id| {
                        inner
                            .entries
                            .get(*id)
                            .is_some_and(|e| e.status == QueueEntryStatus::Queued)
                    })
                    .cloned();
                inner.execution_order.push_back(execution_id);

                if let Some(entry_id) = candidate {
                    if let Some(entry) = inner.entries.get_mut(&entry_id) {
                        entry.status = QueueEntryStatus::Leased;
                        entry.lease_owner = Some(worker_id.to_string());
                        entry.lease_expires_at = Some(Utc::now() + self.lease_duration);
                        leased = Some(entry.clone());
                    }
                    break;
                }
            }
            (released, leased)
        };

        self.persist(&released).await;
        if !released.is_empty() {
            self.notify.notify_waiters();
        }
        if let Some(entry) = &leased {
            self.persist(std::slice::from_ref(entry)).await;
        }
        leased
    }

    /// Push a held lease's expiry forward. Fails when the lease was lost to
    /// expiry or another worker.
    pub async fn extend_lease(&self, entry_id: &str, worker_id: &str) -> Result<(), QueueError> {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| QueueError::NotFound(entry_id.to_string()))?;
            let owned = entry.status == QueueEntryStatus::Leased
                && entry.lease_owner.as_deref() == Some(worker_id)
                && entry.lease_expires_at.is_some_and(|at| at > Utc::now());
            if !owned {
                return Err(QueueError::LeaseLost(entry_id.to_string()));
            }
            entry.lease_expires_at = Some(Utc::now() + self.lease_duration);
            entry.clone()
        };
        self.persist(std::slice::from_ref(&entry)).await;
        Ok(())
    }

    /// Acknowledge a leased entry with its terminal status.
    pub async fn acknowledge(
        &self,
        entry_id: &str,
        worker_id: &str,
        status: QueueEntryStatus,
    ) -> Result<(), QueueError> {
        debug_assert!(status.is_terminal());
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| QueueError::NotFound(entry_id.to_string()))?;
            if entry.status != QueueEntryStatus::Leased
                || entry.lease_owner.as_deref() != Some(worker_id)
            {
                return Err(QueueError::LeaseLost(entry_id.to_string()));
            }
            entry.status = status;
            entry.lease_expires_at = None;
            let entry = entry.clone();
            inner.detach(&entry.execution_id.clone(), entry_id);
            inner.entries.remove(entry_id);
            entry
        };
        self.persist(std::slice::from_ref(&entry)).await;
        Ok(())
    }

    /// Cancel a still-queued entry for a task. Leased entries are left to
    /// their workers, whose start requests the scheduler will deny.
    pub async fn cancel_pending(&self, execution_id: &str, task_id: &str) -> bool {
        let cancelled = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .per_execution
                .get(execution_id)
                .into_iter()
                .flatten()
                .filter(|id| {
                    inner.entries.get(*id).is_some_and(|e| {
                        e.task_id == task_id && e.status == QueueEntryStatus::Queued
                    })
                })
                .cloned()
                .collect();
            let mut cancelled = Vec::new();
            for id in ids {
                if let Some(mut entry) = inner.entries.remove(&id) {
                    entry.status = QueueEntryStatus::Cancelled;
                    inner.detach(&entry.execution_id.clone(), &id);
                    cancelled.push(entry);
                }
            }
            cancelled
        };
        self.persist(&cancelled).await;
        !cancelled.is_empty()
    }

    /// Cancel every still-queued entry of an execution.
    pub async fn cancel_execution(&self, execution_id: &str) -> usize {
        let cancelled = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .per_execution
                .get(execution_id)
                .into_iter()
                .flatten()
                .filter(|id| {
                    inner
                        .entries
                        .get(*id)
                        .is_some_and(|e| e.status == QueueEntryStatus::Queued)
                })
                .cloned()
                .collect();
            let mut cancelled = Vec::new();
            for id in ids {
                if let Some(mut entry) = inner.entries.remove(&id) {
                    entry.status = QueueEntryStatus::Cancelled;
                    inner.detach(&entry.execution_id.clone(), &id);
                    cancelled.push(entry);
                }
            }
            cancelled
        };
        self.persist(&cancelled).await;
        cancelled.len()
    }

    /// Whether a task still has a queued or leased entry.
    pub fn has_pending(&self, execution_id: &str, task_id: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .any(|e| e.execution_id == execution_id && e.task_id == task_id)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Resolves when new work may be available.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    async fn persist(&self, entries: &[QueueEntry]) {
        for entry in entries {
            if let Err(e) = self.store.save_queue_entry(entry).await {
                tracing::warn!(
                    entry_id = %entry.entry_id,
                    error = %e,
                    "failed to persist queue entry"
                );
            }
        }
    }
}
