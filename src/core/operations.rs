// FILE: src/core/operations.rs
//! The Operation Ledger: lifecycle records for every named async action.
//!
//! Purely observational. Controllers read it to grey out buttons and to refuse
//! a second vault action while one is running; nothing in here ever fails a caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::OPERATION_CLEANUP_DELAY_MS;
use crate::core::now_millis;
use crate::events::{Listeners, Subscription};

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    pub fn next() -> Self {
        let n = NEXT_OPERATION.fetch_add(1, Ordering::Relaxed);
        OperationId(format!("op_{}_{}", n, now_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    VaultCreate,
    VaultDelete,
    VaultOpen,
    FileSave,
    FileDelete,
    FileCreate,
    TreeLoad,
    HealthCheck,
    Cleanup,
}

impl OperationType {
    /// Vault-level actions exclude each other globally, whatever vault they target.
    pub fn is_vault_operation(self) -> bool {
        matches!(
            self,
            OperationType::VaultCreate | OperationType::VaultDelete | OperationType::VaultOpen
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::VaultCreate => "vault_create",
            OperationType::VaultDelete => "vault_delete",
            OperationType::VaultOpen => "vault_open",
            OperationType::FileSave => "file_save",
            OperationType::FileDelete => "file_delete",
            OperationType::FileCreate => "file_create",
            OperationType::TreeLoad => "tree_load",
            OperationType::HealthCheck => "health_check",
            OperationType::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub state: OperationState,
    pub resource_id: Option<String>,
    pub error: Option<String>,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub metadata: Option<serde_json::Value>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub resource_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl StartOptions {
    pub fn resource(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingCheck {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl BlockingCheck {
    fn clear() -> Self {
        Self { blocked: false, reason: None }
    }

    fn blocked(reason: String) -> Self {
        Self { blocked: true, reason: Some(reason) }
    }
}

pub type OperationSnapshot = Vec<Operation>;

struct StoreInner {
    operations: Mutex<HashMap<OperationId, Operation>>,
    listeners: Listeners<OperationSnapshot>,
    cleanup_delay: Duration,
    seq: AtomicU64,
}

/// Shared handle to the ledger. Cloning is cheap; all clones see the same records.
#[derive(Clone)]
pub struct OperationStore {
    inner: Arc<StoreInner>,
}

impl Default for OperationStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(OPERATION_CLEANUP_DELAY_MS))
    }
}

impl OperationStore {
    pub fn new(cleanup_delay: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                operations: Mutex::new(HashMap::new()),
                listeners: Listeners::new("OperationStore"),
                cleanup_delay,
                seq: AtomicU64::new(0),
            }),
        }
    }

    fn ops(&self) -> MutexGuard<'_, HashMap<OperationId, Operation>> {
        self.inner
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new in-progress operation and return its id.
    pub fn start(&self, op_type: OperationType, opts: StartOptions) -> OperationId {
        self.start_with_id(OperationId::next(), op_type, opts)
    }

    /// Same as [`start`](Self::start) with an id minted by the caller, so the lock
    /// table and the ledger can refer to one operation by one id.
    pub(crate) fn start_with_id(
        &self,
        id: OperationId,
        op_type: OperationType,
        opts: StartOptions,
    ) -> OperationId {
        let op = Operation {
            id: id.clone(),
            op_type,
            state: OperationState::InProgress,
            resource_id: opts.resource_id,
            error: None,
            start_time: now_millis(),
            end_time: None,
            metadata: opts.metadata,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
        };

        tracing::debug!(
            "[OperationStore] Started {} ({}) resource={:?}",
            op_type,
            id,
            op.resource_id
        );
        self.ops().insert(id.clone(), op);
        self.notify();
        id
    }

    pub fn complete(&self, id: &OperationId) {
        self.finish(id, OperationState::Completed, None);
    }

    pub fn fail(&self, id: &OperationId, error: impl std::fmt::Display) {
        self.finish(id, OperationState::Failed, Some(error.to_string()));
    }

    fn finish(&self, id: &OperationId, state: OperationState, error: Option<String>) {
        {
            let mut ops = self.ops();
            let Some(op) = ops.get_mut(id) else {
                tracing::warn!("[OperationStore] Cannot finish unknown operation {}", id);
                return;
            };
            if op.state.is_terminal() {
                tracing::warn!(
                    "[OperationStore] Operation {} already {:?}, ignoring transition to {:?}",
                    id,
                    op.state,
                    state
                );
                return;
            }
            op.state = state;
            op.error = error;
            op.end_time = Some(now_millis());

            match state {
                OperationState::Failed => tracing::debug!(
                    "[OperationStore] {} ({}) failed: {}",
                    op.op_type,
                    id,
                    op.error.as_deref().unwrap_or("")
                ),
                _ => tracing::debug!("[OperationStore] {} ({}) completed", op.op_type, id),
            }
        }
        self.notify();
        self.schedule_removal(id.clone());
    }

    fn schedule_removal(&self, id: OperationId) {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let delay = self.inner.cleanup_delay;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        OperationStore { inner }.remove_terminal(&id);
                    }
                });
            }
            Err(_) => {
                tracing::debug!("[OperationStore] No runtime, {} kept until clear()", id);
            }
        }
    }

    fn remove_terminal(&self, id: &OperationId) {
        let removed = {
            let mut ops = self.ops();
            match ops.get(id) {
                Some(op) if op.state.is_terminal() => ops.remove(id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.notify();
        }
    }

    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.ops().get(id).cloned()
    }

    /// All tracked operations in start order.
    pub fn snapshot(&self) -> OperationSnapshot {
        let mut all: Vec<Operation> = self.ops().values().cloned().collect();
        all.sort_by_key(|op| op.seq);
        all
    }

    pub fn in_progress(&self) -> OperationSnapshot {
        self.snapshot()
            .into_iter()
            .filter(|op| op.state == OperationState::InProgress)
            .collect()
    }

    pub fn is_type_in_progress(&self, op_type: OperationType) -> bool {
        self.ops()
            .values()
            .any(|op| op.op_type == op_type && op.state == OperationState::InProgress)
    }

    pub fn is_resource_busy(&self, resource_id: &str) -> bool {
        self.ops().values().any(|op| {
            op.state == OperationState::InProgress && op.resource_id.as_deref() == Some(resource_id)
        })
    }

    /// Decide whether an action of `op_type` may start now.
    pub fn check_blocking(&self, op_type: OperationType, resource_id: Option<&str>) -> BlockingCheck {
        let ops = self.ops();
        let mut running = ops
            .values()
            .filter(|op| op.state == OperationState::InProgress);

        if op_type.is_vault_operation() {
            if let Some(op) = running.clone().find(|op| op.op_type.is_vault_operation()) {
                return BlockingCheck::blocked(format!(
                    "Another vault operation is in progress ({})",
                    op.op_type
                ));
            }
        }

        if let Some(resource) = resource_id {
            if let Some(op) = running.find(|op| op.resource_id.as_deref() == Some(resource)) {
                return BlockingCheck::blocked(format!(
                    "'{}' is busy with {}",
                    resource, op.op_type
                ));
            }
        }

        BlockingCheck::clear()
    }

    /// Register a listener; it receives a fresh snapshot after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OperationSnapshot) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    fn notify(&self) {
        if self.inner.listeners.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.inner.listeners.emit(&snapshot);
    }

    /// Forget every record. Listeners stay registered and see the empty snapshot.
    pub fn clear(&self) {
        self.ops().clear();
        self.notify();
    }

    pub fn len(&self) -> usize {
        self.ops().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_start_complete_lifecycle() {
        let store = OperationStore::default();
        let id = store.start(OperationType::FileSave, StartOptions::resource("/v/a.md"));

        let op = store.get(&id).unwrap();
        assert_eq!(op.state, OperationState::InProgress);
        assert!(op.end_time.is_none());
        assert!(store.is_resource_busy("/v/a.md"));

        store.complete(&id);
        let op = store.get(&id).unwrap();
        assert_eq!(op.state, OperationState::Completed);
        assert!(op.end_time.is_some());
        assert!(!store.is_resource_busy("/v/a.md"));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let store = OperationStore::default();
        let id = store.start(OperationType::VaultOpen, StartOptions::resource("v1"));
        store.fail(&id, "disk gone");
        store.complete(&id);

        let op = store.get(&id).unwrap();
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.error.as_deref(), Some("disk gone"));
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let store = OperationStore::default();
        store.complete(&OperationId::next());
        store.fail(&OperationId::next(), "whatever");
        assert!(store.is_empty());
    }

    #[test]
    fn test_vault_operations_block_each_other() {
        let store = OperationStore::default();
        let open = store.start(OperationType::VaultOpen, StartOptions::resource("a"));
        let create = store.start(OperationType::VaultCreate, StartOptions::default());

        let check = store.check_blocking(OperationType::VaultDelete, Some("b"));
        assert!(check.blocked);
        assert!(check.reason.unwrap().contains("vault"));

        store.complete(&open);
        assert!(store.check_blocking(OperationType::VaultDelete, None).blocked);

        store.fail(&create, "nope");
        assert!(!store.check_blocking(OperationType::VaultDelete, Some("b")).blocked);
    }

    #[test]
    fn test_file_operation_checks_resource_only() {
        let store = OperationStore::default();
        let _open = store.start(OperationType::VaultOpen, StartOptions::resource("a"));
        let _save = store.start(OperationType::FileSave, StartOptions::resource("/a/x.md"));

        assert!(!store.check_blocking(OperationType::FileSave, Some("/a/y.md")).blocked);
        assert!(store.check_blocking(OperationType::FileDelete, Some("/a/x.md")).blocked);
        assert!(store.is_type_in_progress(OperationType::VaultOpen));
        assert!(!store.is_type_in_progress(OperationType::VaultDelete));
    }

    #[test]
    fn test_listener_receives_snapshots_and_panics_are_contained() {
        let store = OperationStore::default();
        let last_len = Arc::new(AtomicUsize::new(usize::MAX));

        let _bad = store.subscribe(|_| panic!("listener bug"));
        let seen = Arc::clone(&last_len);
        let _good = store.subscribe(move |snapshot| {
            seen.store(snapshot.len(), Ordering::SeqCst);
        });

        let id = store.start(OperationType::TreeLoad, StartOptions::default());
        assert_eq!(last_len.load(Ordering::SeqCst), 1);
        store.complete(&id);
        assert_eq!(store.get(&id).unwrap().state, OperationState::Completed);

        store.clear();
        assert_eq!(last_len.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_operations_are_removed_after_delay() {
        let store = OperationStore::default();
        let done = store.start(OperationType::FileCreate, StartOptions::default());
        let running = store.start(OperationType::FileCreate, StartOptions::default());
        store.complete(&done);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(store.get(&done).is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.get(&done).is_none());
        assert!(store.get(&running).is_some());
    }

    #[test]
    fn test_operation_serializes_with_type_field() {
        let store = OperationStore::default();
        let id = store.start(
            OperationType::VaultDelete,
            StartOptions::resource("v9").with_metadata(serde_json::json!({ "deleteFiles": true })),
        );
        let value = serde_json::to_value(store.get(&id).unwrap()).unwrap();
        assert_eq!(value["type"], "vault_delete");
        assert_eq!(value["state"], "in_progress");
        assert_eq!(value["resourceId"], "v9");
        assert_eq!(value["metadata"]["deleteFiles"], true);
    }
}
