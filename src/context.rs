// FILE: src/context.rs
//! The Switchboard: one place that builds and owns every coordination service.
//!
//! Constructed once at startup and handed to controllers. Tests build their own,
//! so no state leaks between them.

use std::sync::Arc;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::controllers::{EditorController, VaultController};
use crate::core::lock_queue::LockQueue;
use crate::core::operations::OperationStore;
use crate::engine::sync_service::SyncService;
use crate::engine::tree_loader::TreeLoader;
use crate::state::{AppState, SharedState};
use crate::storage::backend::Backend;

#[derive(Clone)]
pub struct Coordinator {
    pub config: CoordinatorConfig,
    pub state: SharedState,
    pub store: OperationStore,
    pub queue: LockQueue,
    pub tree_loader: Arc<TreeLoader>,
    pub sync: Arc<SyncService>,
    pub backend: Arc<dyn Backend>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, backend: Arc<dyn Backend>) -> Self {
        let state: SharedState = Arc::new(AppState::new());
        let store = OperationStore::new(config.cleanup_delay());
        let queue = LockQueue::with_timeouts(
            store.clone(),
            Duration::from_millis(config.default_timeout_ms),
            Duration::from_millis(config.vault_delete_timeout_ms),
        );
        let tree_loader = Arc::new(TreeLoader::new(
            Arc::clone(&backend),
            queue.clone(),
            config.tree.clone(),
        ));
        let sync = Arc::new(SyncService::new(
            Arc::clone(&state),
            queue.clone(),
            Arc::clone(&backend),
        ));

        tracing::debug!(
            "[Coordinator] Ready (timeout {}ms, delete timeout {}ms)",
            config.default_timeout_ms,
            config.vault_delete_timeout_ms
        );

        Self {
            config,
            state,
            store,
            queue,
            tree_loader,
            sync,
            backend,
        }
    }

    pub fn vault_controller(&self) -> VaultController {
        VaultController::new(self.clone())
    }

    pub fn editor_controller(&self) -> EditorController {
        EditorController::new(self.clone())
    }

    /// Forget all records, locks, handlers, listeners and UI state.
    pub fn reset(&self) {
        self.queue.clear();
        self.store.clear();
        self.sync.clear();
        self.state.reset();
        tracing::debug!("[Coordinator] Reset");
    }
}
