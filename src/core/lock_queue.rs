// FILE: src/core/lock_queue.rs
//! The Gatekeeper: per-resource exclusive locks plus per-category FIFO chains.
//!
//! Rules:
//! - A resource lock is taken at enqueue time. A second enqueue on a held resource
//!   fails right away with `LockConflict`; it never waits.
//! - Tasks in one category run strictly in submission order. Categories are independent.
//! - Each task races a timer. On timeout the caller gets `Timeout` and the lock is
//!   released, but the task keeps running and the next task in its category still
//!   waits for it to settle.
//! - When an `op_type` is given, the lifecycle is mirrored into the `OperationStore`
//!   under the same id that holds the lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::{DEFAULT_TIMEOUT_MS, VAULT_DELETE_TIMEOUT_MS};
use crate::core::now_millis;
use crate::core::operations::{OperationId, OperationStore, OperationType, StartOptions};
use crate::error::{CoordError, Result};

pub const CATEGORY_VAULT: &str = "vault";
pub const CATEGORY_FILE: &str = "file";
pub const CATEGORY_TREE: &str = "tree";

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub resource_id: Option<String>,
    /// Recorded for observability. Ordering inside a category is FIFO regardless.
    pub priority: Option<i32>,
    /// Falls back to the queue's default (30s) when unset.
    pub timeout: Option<Duration>,
    pub description: Option<String>,
    /// Mirror the lifecycle into the operation store under this type.
    pub op_type: Option<OperationType>,
    pub metadata: Option<serde_json::Value>,
}

impl EnqueueOptions {
    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tracked(mut self, op_type: OperationType) -> Self {
        self.op_type = Some(op_type);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A task that has been accepted by the queue and not yet settled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOperation {
    pub id: OperationId,
    pub category: String,
    pub resource_id: Option<String>,
    pub description: String,
    pub priority: Option<i32>,
    pub enqueued_at: u64,
    /// Set once the task leaves the queue and starts running.
    pub started_at: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub active_locks: usize,
    pub active_operations: usize,
    pub active_categories: usize,
    pub total_enqueued: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub lock_conflicts: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    lock_conflicts: AtomicU64,
}

struct QueueInner {
    store: OperationStore,
    locks: DashMap<String, OperationId>,
    active: DashMap<OperationId, ActiveOperation>,
    /// Settle signal of the most recently enqueued task, per category.
    tails: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    counters: Counters,
    default_timeout: Duration,
    vault_delete_timeout: Duration,
}

#[derive(Clone)]
pub struct LockQueue {
    inner: Arc<QueueInner>,
}

impl LockQueue {
    pub fn new(store: OperationStore) -> Self {
        Self::with_timeouts(
            store,
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            Duration::from_millis(VAULT_DELETE_TIMEOUT_MS),
        )
    }

    pub fn with_timeouts(
        store: OperationStore,
        default_timeout: Duration,
        vault_delete_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                locks: DashMap::new(),
                active: DashMap::new(),
                tails: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                default_timeout,
                vault_delete_timeout,
            }),
        }
    }

    pub fn store(&self) -> &OperationStore {
        &self.inner.store
    }

    /// Submit `task` to the `category` chain.
    ///
    /// The lock check, lock acquisition and chain placement all happen during this
    /// call; the task is spawned onto the runtime immediately and runs whether or not
    /// the returned future is polled. Awaiting the future yields the task's result,
    /// a `LockConflict`, or a `Timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T, F, Fut>(
        &self,
        category: &str,
        task: F,
        opts: EnqueueOptions,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let launched = self.launch(category, task, opts);
        async move {
            match launched {
                Ok(handle) => handle.await.unwrap_or_else(|e| {
                    Err(CoordError::Aborted(format!("queue runner stopped: {}", e)))
                }),
                Err(e) => Err(e),
            }
        }
    }

    fn launch<T, F, Fut>(
        &self,
        category: &str,
        task: F,
        opts: EnqueueOptions,
    ) -> Result<tokio::task::JoinHandle<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = OperationId::next();
        let description = opts.description.clone().unwrap_or_else(|| match opts.op_type {
            Some(t) => format!("{}:{}", category, t),
            None => format!("{}:task", category),
        });

        if let Some(resource) = &opts.resource_id {
            match self.inner.locks.entry(resource.clone()) {
                Entry::Occupied(held) => {
                    let holder = held.get().clone();
                    self.inner.counters.lock_conflicts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "[LockQueue] Rejected '{}': resource '{}' held by {}",
                        description,
                        resource,
                        holder
                    );
                    return Err(CoordError::LockConflict {
                        resource_id: resource.clone(),
                        holder,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(id.clone());
                    tracing::debug!("[LockQueue] {} acquired lock on '{}'", id, resource);
                }
            }
        }

        if let Some(op_type) = opts.op_type {
            self.inner.store.start_with_id(
                id.clone(),
                op_type,
                StartOptions {
                    resource_id: opts.resource_id.clone(),
                    metadata: opts.metadata.clone(),
                },
            );
        }

        self.inner.active.insert(
            id.clone(),
            ActiveOperation {
                id: id.clone(),
                category: category.to_string(),
                resource_id: opts.resource_id.clone(),
                description: description.clone(),
                priority: opts.priority,
                enqueued_at: now_millis(),
                started_at: None,
            },
        );
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        let (settled_tx, settled_rx) = oneshot::channel::<()>();
        let previous = self
            .inner
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category.to_string(), settled_rx);

        let timeout = opts.timeout.unwrap_or(self.inner.default_timeout);
        let inner = Arc::clone(&self.inner);
        let resource_id = opts.resource_id;
        let tracked = opts.op_type.is_some();

        tracing::debug!("[LockQueue] Enqueued '{}' as {}", description, id);

        Ok(tokio::spawn(async move {
            if let Some(previous) = previous {
                // A dropped sender also means the predecessor is done.
                let _ = previous.await;
            }

            if let Some(mut entry) = inner.active.get_mut(&id) {
                entry.started_at = Some(now_millis());
            }

            // The chain follows this task, not the timer below.
            let work = tokio::spawn(async move {
                let result = task().await;
                let _ = settled_tx.send(());
                result
            });

            let outcome = match tokio::time::timeout(timeout, work).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(CoordError::Aborted(format!(
                    "task '{}' did not finish: {}",
                    description, join_err
                ))),
                Err(_) => {
                    tracing::warn!(
                        "[LockQueue] '{}' ({}) timed out after {}ms; the call may still complete",
                        description,
                        id,
                        timeout.as_millis()
                    );
                    Err(CoordError::Timeout {
                        operation: description.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            inner.settle(&id, resource_id.as_deref(), tracked, &outcome);
            outcome
        }))
    }

    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.inner.locks.contains_key(resource_id)
    }

    pub fn get_lock_holder(&self, resource_id: &str) -> Option<OperationId> {
        self.inner.locks.get(resource_id).map(|h| h.value().clone())
    }

    pub fn get_active_operations(&self) -> Vec<ActiveOperation> {
        let mut ops: Vec<ActiveOperation> =
            self.inner.active.iter().map(|e| e.value().clone()).collect();
        ops.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        ops
    }

    pub fn has_active_operations(&self, category: &str) -> bool {
        self.inner.active.iter().any(|e| e.value().category == category)
    }

    pub fn get_stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        let mut categories: Vec<String> =
            self.inner.active.iter().map(|e| e.value().category.clone()).collect();
        categories.sort();
        categories.dedup();

        QueueStats {
            active_locks: self.inner.locks.len(),
            active_operations: self.inner.active.len(),
            active_categories: categories.len(),
            total_enqueued: c.enqueued.load(Ordering::Relaxed),
            total_succeeded: c.succeeded.load(Ordering::Relaxed),
            total_failed: c.failed.load(Ordering::Relaxed),
            total_timed_out: c.timed_out.load(Ordering::Relaxed),
            lock_conflicts: c.lock_conflicts.load(Ordering::Relaxed),
        }
    }

    /// Drop the lock on `resource_id` no matter who holds it.
    ///
    /// Recovery tool only: the holder's own cleanup will later find the lock gone
    /// (or held by someone else) and leave it alone.
    pub fn force_release_lock(&self, resource_id: &str) -> bool {
        match self.inner.locks.remove(resource_id) {
            Some((_, holder)) => {
                tracing::warn!(
                    "[LockQueue] Force-released lock on '{}' (held by {})",
                    resource_id,
                    holder
                );
                true
            }
            None => false,
        }
    }

    /// Forget all locks, chains and bookkeeping. Already-running tasks are not stopped.
    pub fn clear(&self) {
        self.inner.locks.clear();
        self.inner.active.clear();
        self.inner
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // ---- Category wrappers ----

    pub fn enqueue_vault_create<T, F, Fut>(
        &self,
        name: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_VAULT,
            task,
            EnqueueOptions::default()
                .tracked(OperationType::VaultCreate)
                .describe(format!("create vault '{}'", name)),
        )
    }

    pub fn enqueue_vault_open<T, F, Fut>(
        &self,
        vault_id: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_VAULT,
            task,
            EnqueueOptions::default()
                .resource(vault_id)
                .tracked(OperationType::VaultOpen)
                .describe(format!("open vault {}", vault_id)),
        )
    }

    pub fn enqueue_vault_delete<T, F, Fut>(
        &self,
        vault_id: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_VAULT,
            task,
            EnqueueOptions::default()
                .resource(vault_id)
                .tracked(OperationType::VaultDelete)
                .timeout(self.inner.vault_delete_timeout)
                .describe(format!("delete vault {}", vault_id)),
        )
    }

    pub fn enqueue_file_save<T, F, Fut>(
        &self,
        path: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_FILE,
            task,
            EnqueueOptions::default()
                .resource(path)
                .tracked(OperationType::FileSave)
                .describe(format!("save {}", path)),
        )
    }

    pub fn enqueue_file_delete<T, F, Fut>(
        &self,
        path: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_FILE,
            task,
            EnqueueOptions::default()
                .resource(path)
                .tracked(OperationType::FileDelete)
                .describe(format!("delete {}", path)),
        )
    }

    pub fn enqueue_file_create<T, F, Fut>(
        &self,
        path: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_FILE,
            task,
            EnqueueOptions::default()
                .tracked(OperationType::FileCreate)
                .describe(format!("create {}", path)),
        )
    }

    /// Renames lock the source path so a concurrent save or delete of it is refused.
    pub fn enqueue_file_rename<T, F, Fut>(
        &self,
        from: &str,
        to: &str,
        task: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.enqueue(
            CATEGORY_FILE,
            task,
            EnqueueOptions::default()
                .resource(from)
                .describe(format!("rename {} -> {}", from, to)),
        )
    }
}

impl QueueInner {
    /// Runs exactly once per accepted task, whatever the outcome.
    fn settle<T>(&self, id: &OperationId, resource_id: Option<&str>, tracked: bool, outcome: &Result<T>) {
        if let Some(resource) = resource_id {
            // Only release our own lock; a forced release may have handed it to someone else.
            let released = self.locks.remove_if(resource, |_, holder| holder == id).is_some();
            if released {
                tracing::debug!("[LockQueue] {} released lock on '{}'", id, resource);
            }
        }
        self.active.remove(id);

        match outcome {
            Ok(_) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                if tracked {
                    self.store.complete(id);
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!("[LockQueue] {} failed: {}", id, e);
                if tracked {
                    self.store.fail(id, e);
                }
            }
        }
    }
}
