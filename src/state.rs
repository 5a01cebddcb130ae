// FILE: src/state.rs

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::tree_loader::TreeSnapshot;
use crate::storage::backend::{BrokenVault, Vault};

/// What the editor pane shows: the active vault's tree and the open file buffer.
#[derive(Debug, Clone, Default)]
pub struct FileSystemState {
    pub vault_id: Option<String>,
    pub root_path: Option<String>,
    pub tree: Option<TreeSnapshot>,
    pub tree_error: Option<String>,
    pub current_file: Option<String>,
    pub content: String,
    /// Content as last read from or written to the backend.
    pub saved_content: String,
    pub has_unsaved_changes: bool,
    pub last_saved_at: Option<u64>,
}

impl FileSystemState {
    pub fn for_vault(vault: &Vault) -> Self {
        Self {
            vault_id: Some(vault.id.clone()),
            root_path: Some(vault.path.clone()),
            ..Self::default()
        }
    }

    /// Vault owning the dirty buffer, if there is one.
    pub fn unsaved_vault(&self) -> Option<&str> {
        if self.has_unsaved_changes {
            self.vault_id.as_deref()
        } else {
            None
        }
    }
}

/// What the vault picker shows.
#[derive(Debug, Clone, Default)]
pub struct VaultState {
    pub vaults: Vec<Vault>,
    pub active_vault: Option<Vault>,
    pub last_vault_id: Option<String>,
    pub broken: Vec<BrokenVault>,
}

impl VaultState {
    pub fn active_id(&self) -> Option<&str> {
        self.active_vault.as_ref().map(|v| v.id.as_str())
    }
}

/// Shared UI-facing state. Only controllers write to it.
#[derive(Debug, Default)]
pub struct AppState {
    file_system: RwLock<FileSystemState>,
    vault: RwLock<VaultState>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_system(&self) -> RwLockReadGuard<'_, FileSystemState> {
        self.file_system.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn file_system_mut(&self) -> RwLockWriteGuard<'_, FileSystemState> {
        self.file_system.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn vault(&self) -> RwLockReadGuard<'_, VaultState> {
        self.vault.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn vault_mut(&self) -> RwLockWriteGuard<'_, VaultState> {
        self.vault.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clear_file_system(&self) {
        *self.file_system_mut() = FileSystemState::default();
    }

    pub fn reset(&self) {
        self.clear_file_system();
        *self.vault_mut() = VaultState::default();
    }
}
