// FILE: src/engine/sync_service.rs
//! The Courier: keeps editor buffers and vault-level actions in step.
//!
//! Before a vault is deleted (or another one opened) the unsaved buffer of that vault
//! is flushed through whatever save handler the editor registered, or through a direct
//! write when none is registered. After a deletion the dependent UI state is dropped and
//! the app is told to leave the editor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Serialize;

use crate::core::lock_queue::LockQueue;
use crate::core::now_millis;
use crate::core::operations::{OperationStore, OperationType};
use crate::error::Result;
use crate::events::{AppEvent, Listeners, Subscription};
use crate::state::AppState;
use crate::storage::backend::Backend;

/// Flushes the editor buffer of one vault. Registered by the editor, never built here.
pub type SaveHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub saved: bool,
    pub error: Option<String>,
}

impl SaveOutcome {
    fn ok() -> Self {
        Self { saved: true, error: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Another vault action is running. Not recoverable by the caller.
    ConcurrentOperation,
    /// The vault's resource lock is held.
    LockHeld,
    /// The vault has a dirty buffer. Recoverable by saving first.
    UnsavedChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub kind: Option<ConflictKind>,
    pub reason: Option<String>,
    pub suggestion: Option<String>,
}

impl ConflictCheck {
    fn none() -> Self {
        Self {
            has_conflict: false,
            kind: None,
            reason: None,
            suggestion: None,
        }
    }

    fn conflict(kind: ConflictKind, reason: String, suggestion: &str) -> Self {
        Self {
            has_conflict: true,
            kind: Some(kind),
            reason: Some(reason),
            suggestion: Some(suggestion.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReadiness {
    pub ready: bool,
    pub error: Option<String>,
    /// The buffer could not be saved; the user decides whether to discard it.
    pub requires_confirmation: bool,
    pub message: Option<String>,
}

/// Write the open buffer through the file-save queue.
///
/// Returns `Ok(false)` when there was nothing to write. The buffer is only marked
/// clean if it was not edited again while the write was in flight.
pub async fn flush_unsaved(state: &AppState, backend: &Arc<dyn Backend>, queue: &LockQueue) -> Result<bool> {
    let (path, content) = {
        let fs = state.file_system();
        match (&fs.current_file, fs.has_unsaved_changes) {
            (Some(path), true) => (path.clone(), fs.content.clone()),
            _ => return Ok(false),
        }
    };

    let writer = Arc::clone(backend);
    let target = path.clone();
    let written = content.clone();
    queue
        .enqueue_file_save(&path, move || async move { writer.write_file(&target, &written).await })
        .await?;

    let mut fs = state.file_system_mut();
    if fs.current_file.as_deref() == Some(path.as_str()) {
        fs.saved_content = content.clone();
        if fs.content == content {
            fs.has_unsaved_changes = false;
        }
        fs.last_saved_at = Some(now_millis());
    }
    tracing::debug!("[SyncService] Flushed {}", path);
    Ok(true)
}

pub struct SyncService {
    state: Arc<AppState>,
    queue: LockQueue,
    backend: Arc<dyn Backend>,
    handlers: Mutex<HashMap<String, SaveHandler>>,
    events: Listeners<AppEvent>,
}

impl SyncService {
    pub fn new(state: Arc<AppState>, queue: LockQueue, backend: Arc<dyn Backend>) -> Self {
        Self {
            state,
            queue,
            backend,
            handlers: Mutex::new(HashMap::new()),
            events: Listeners::new("SyncService"),
        }
    }

    fn store(&self) -> &OperationStore {
        self.queue.store()
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, SaveHandler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_save_handler(&self, vault_id: &str, handler: SaveHandler) {
        self.handlers().insert(vault_id.to_string(), handler);
        tracing::debug!("[SyncService] Save handler registered for {}", vault_id);
    }

    pub fn unregister_save_handler(&self, vault_id: &str) {
        if self.handlers().remove(vault_id).is_some() {
            tracing::debug!("[SyncService] Save handler removed for {}", vault_id);
        }
    }

    pub fn has_save_handler(&self, vault_id: &str) -> bool {
        self.handlers().contains_key(vault_id)
    }

    pub async fn ensure_saved_before_vault_operation(&self, vault_id: &str) -> SaveOutcome {
        let dirty_here = self.state.file_system().unsaved_vault() == Some(vault_id);
        if !dirty_here {
            return SaveOutcome::ok();
        }

        let handler = self.handlers().get(vault_id).cloned();
        let result = match handler {
            Some(save) => save().await,
            None => {
                tracing::debug!("[SyncService] No save handler for {}, writing buffer directly", vault_id);
                flush_unsaved(&self.state, &self.backend, &self.queue).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                tracing::info!("[SyncService] Saved pending changes in {}", vault_id);
                SaveOutcome::ok()
            }
            Err(e) => {
                tracing::warn!("[SyncService] Could not save pending changes in {}: {}", vault_id, e);
                SaveOutcome {
                    saved: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn check_vault_operation_conflict(&self, vault_id: &str, op_type: OperationType) -> ConflictCheck {
        let blocking = self.store().check_blocking(op_type, Some(vault_id));
        if blocking.blocked {
            return ConflictCheck::conflict(
                ConflictKind::ConcurrentOperation,
                blocking.reason.unwrap_or_else(|| "Another operation is in progress".to_string()),
                "Wait for the current operation to finish and try again",
            );
        }

        if let Some(holder) = self.queue.get_lock_holder(vault_id) {
            return ConflictCheck::conflict(
                ConflictKind::LockHeld,
                format!("Vault {} is locked by {}", vault_id, holder),
                "Wait for the current operation to finish and try again",
            );
        }

        if op_type == OperationType::VaultDelete
            && self.state.file_system().unsaved_vault() == Some(vault_id)
        {
            return ConflictCheck::conflict(
                ConflictKind::UnsavedChanges,
                "The vault has unsaved changes".to_string(),
                "Save your changes before deleting the vault",
            );
        }

        ConflictCheck::none()
    }

    pub async fn prepare_for_vault_deletion(&self, vault_id: &str) -> DeletionReadiness {
        let conflict = self.check_vault_operation_conflict(vault_id, OperationType::VaultDelete);

        match conflict.kind {
            None => DeletionReadiness {
                ready: true,
                error: None,
                requires_confirmation: false,
                message: None,
            },
            Some(ConflictKind::UnsavedChanges) => {
                let outcome = self.ensure_saved_before_vault_operation(vault_id).await;
                if outcome.saved {
                    DeletionReadiness {
                        ready: true,
                        error: None,
                        requires_confirmation: false,
                        message: None,
                    }
                } else {
                    let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                    DeletionReadiness {
                        ready: false,
                        message: Some(format!(
                            "Unsaved changes could not be saved ({}). Delete anyway and discard them?",
                            error
                        )),
                        error: Some(error),
                        requires_confirmation: true,
                    }
                }
            }
            Some(_) => DeletionReadiness {
                ready: false,
                error: conflict.reason,
                requires_confirmation: false,
                message: conflict.suggestion,
            },
        }
    }

    /// Drop everything that referred to `vault_id` and, if it was the open vault,
    /// send the app back to the vault list.
    pub fn handle_vault_deleted(&self, vault_id: &str) {
        self.unregister_save_handler(vault_id);

        let was_active = {
            let vaults = self.state.vault();
            let fs = self.state.file_system();
            vaults.active_id() == Some(vault_id) || fs.vault_id.as_deref() == Some(vault_id)
        };

        {
            let mut vaults = self.state.vault_mut();
            vaults.vaults.retain(|v| v.id != vault_id);
            vaults.broken.retain(|b| b.id != vault_id);
            if vaults.last_vault_id.as_deref() == Some(vault_id) {
                vaults.last_vault_id = None;
            }
            if was_active {
                vaults.active_vault = None;
            }
        }

        if was_active {
            self.state.clear_file_system();
            tracing::info!("[SyncService] Active vault {} deleted, leaving editor", vault_id);
            self.notify(&AppEvent::NavigateToVaults);
        }
        self.notify(&AppEvent::VaultDeleted {
            vault_id: vault_id.to_string(),
        });
    }

    /// Only the newly opened vault keeps a save handler.
    pub fn handle_vault_opened(&self, vault_id: &str) {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|id, _| id == vault_id);
        if handlers.len() != before {
            tracing::debug!("[SyncService] Dropped {} stale save handler(s)", before - handlers.len());
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn notify(&self, event: &AppEvent) {
        tracing::debug!("[SyncService] Event {}", event.name());
        self.events.emit(event);
    }

    pub fn clear(&self) {
        self.handlers().clear();
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock_queue::{EnqueueOptions, CATEGORY_VAULT};
    use crate::core::operations::StartOptions;
    use crate::error::CoordError;
    use crate::state::FileSystemState;
    use crate::storage::backend::Vault;
    use crate::storage::memory::MemoryBackend;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    struct Fixture {
        state: Arc<AppState>,
        queue: LockQueue,
        backend: Arc<MemoryBackend>,
        sync: SyncService,
    }

    fn fixture() -> Fixture {
        let state = Arc::new(AppState::new());
        let queue = LockQueue::new(OperationStore::default());
        let backend = Arc::new(MemoryBackend::new());
        let sync = SyncService::new(Arc::clone(&state), queue.clone(), backend.clone());
        Fixture { state, queue, backend, sync }
    }

    fn vault(id: &str) -> Vault {
        Vault {
            id: id.to_string(),
            name: id.to_string(),
            path: format!("/{}", id),
            created_at: 0,
            last_opened: None,
        }
    }

    fn dirty_buffer(state: &AppState, vault_id: &str, path: &str, content: &str) {
        let mut fs = state.file_system_mut();
        *fs = FileSystemState::for_vault(&vault(vault_id));
        fs.current_file = Some(path.to_string());
        fs.content = content.to_string();
        fs.has_unsaved_changes = true;
    }

    fn counting_handler(counter: Arc<AtomicUsize>, fail: bool) -> SaveHandler {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(CoordError::backend("write_file", "disk full"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_unsaved_changes_elsewhere_do_not_touch_handlers() {
        let f = fixture();
        dirty_buffer(&f.state, "v2", "/v2/a.md", "draft");
        let calls = Arc::new(AtomicUsize::new(0));
        f.sync.register_save_handler("v2", counting_handler(Arc::clone(&calls), false));

        let readiness = f.sync.prepare_for_vault_deletion("v1").await;
        assert!(readiness.ready);
        assert!(!readiness.requires_confirmation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_asks_for_confirmation() {
        let f = fixture();
        dirty_buffer(&f.state, "v1", "/v1/a.md", "draft");
        let calls = Arc::new(AtomicUsize::new(0));
        f.sync.register_save_handler("v1", counting_handler(Arc::clone(&calls), true));

        let readiness = f.sync.prepare_for_vault_deletion("v1").await;
        assert!(!readiness.ready);
        assert!(readiness.requires_confirmation);
        assert!(readiness.error.unwrap().contains("disk full"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_handler_makes_deletion_ready() {
        let f = fixture();
        dirty_buffer(&f.state, "v1", "/v1/a.md", "draft");
        let calls = Arc::new(AtomicUsize::new(0));
        f.sync.register_save_handler("v1", counting_handler(Arc::clone(&calls), false));

        assert_eq!(
            f.sync.check_vault_operation_conflict("v1", OperationType::VaultDelete).kind,
            Some(ConflictKind::UnsavedChanges)
        );
        assert!(f.sync.prepare_for_vault_deletion("v1").await.ready);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_flush_writes_buffer_without_handler() {
        let f = fixture();
        f.backend.add_file("/v1/a.md", "old");
        dirty_buffer(&f.state, "v1", "/v1/a.md", "new");

        let outcome = f.sync.ensure_saved_before_vault_operation("v1").await;
        assert_eq!(outcome, SaveOutcome::ok());
        assert_eq!(f.backend.file("/v1/a.md").as_deref(), Some("new"));

        let fs = f.state.file_system();
        assert!(!fs.has_unsaved_changes);
        assert_eq!(fs.saved_content, "new");
        assert!(fs.last_saved_at.is_some());
    }

    #[tokio::test]
    async fn test_running_vault_operation_is_a_hard_conflict() {
        let f = fixture();
        let id = f.queue.store().start(OperationType::VaultOpen, StartOptions::resource("v2"));

        let check = f.sync.check_vault_operation_conflict("v1", OperationType::VaultDelete);
        assert_eq!(check.kind, Some(ConflictKind::ConcurrentOperation));

        let readiness = f.sync.prepare_for_vault_deletion("v1").await;
        assert!(!readiness.ready);
        assert!(!readiness.requires_confirmation);

        f.queue.store().complete(&id);
        assert!(!f.sync.check_vault_operation_conflict("v1", OperationType::VaultDelete).has_conflict);
    }

    #[tokio::test]
    async fn test_held_lock_is_reported() {
        let f = fixture();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let pending = f.queue.enqueue(
            CATEGORY_VAULT,
            move || async move {
                let _ = release_rx.await;
                Ok(())
            },
            EnqueueOptions::default().resource("v1"),
        );

        let check = f.sync.check_vault_operation_conflict("v1", OperationType::VaultDelete);
        assert_eq!(check.kind, Some(ConflictKind::LockHeld));

        release_tx.send(()).unwrap();
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_deleting_active_vault_clears_state_and_navigates() {
        let f = fixture();
        {
            let mut vaults = f.state.vault_mut();
            vaults.vaults = vec![vault("v1"), vault("v2")];
            vaults.active_vault = Some(vault("v1"));
            vaults.last_vault_id = Some("v1".to_string());
        }
        dirty_buffer(&f.state, "v1", "/v1/a.md", "draft");
        f.sync.register_save_handler("v1", counting_handler(Arc::new(AtomicUsize::new(0)), false));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = f.sync.subscribe(move |e| seen_clone.lock().unwrap().push(e.clone()));

        f.sync.handle_vault_deleted("v1");

        assert!(!f.sync.has_save_handler("v1"));
        assert!(f.state.file_system().vault_id.is_none());
        assert!(!f.state.file_system().has_unsaved_changes);
        let vaults = f.state.vault();
        assert!(vaults.active_vault.is_none());
        assert!(vaults.last_vault_id.is_none());
        assert_eq!(vaults.vaults.len(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                AppEvent::NavigateToVaults,
                AppEvent::VaultDeleted { vault_id: "v1".to_string() }
            ]
        );
    }

    #[tokio::test]
    async fn test_deleting_inactive_vault_keeps_editor() {
        let f = fixture();
        f.state.vault_mut().active_vault = Some(vault("v1"));
        dirty_buffer(&f.state, "v1", "/v1/a.md", "draft");

        f.sync.handle_vault_deleted("v2");
        assert_eq!(f.state.file_system().vault_id.as_deref(), Some("v1"));
        assert!(f.state.vault().active_vault.is_some());
    }

    #[test]
    fn test_opening_vault_drops_other_handlers() {
        let f = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        f.sync.register_save_handler("v1", counting_handler(Arc::clone(&counter), false));
        f.sync.register_save_handler("v2", counting_handler(counter, false));

        f.sync.handle_vault_opened("v2");
        assert!(!f.sync.has_save_handler("v1"));
        assert!(f.sync.has_save_handler("v2"));
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = f.sync.subscribe(|_| panic!("listener bug"));
        let hits_clone = Arc::clone(&hits);
        let _good = f.sync.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        f.sync.notify(&AppEvent::FileSaved { path: "/v/a.md".to_string() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
