// FILE: src/controllers/vault.rs
//! Vault picker actions: list, create, open, delete and broken-vault housekeeping.

use serde::Serialize;

use crate::context::Coordinator;
use crate::core::lock_queue::{EnqueueOptions, CATEGORY_VAULT};
use crate::core::operations::OperationType;
use crate::error::{CoordError, Result};
use crate::events::AppEvent;
use crate::state::FileSystemState;
use crate::storage::backend::{CleanupReport, HealthReport, Vault};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// Unsaved changes could not be written. Retry with `force` to discard them.
    NeedsConfirmation { message: String },
}

#[derive(Clone)]
pub struct VaultController {
    ctx: Coordinator,
}

impl VaultController {
    pub fn new(ctx: Coordinator) -> Self {
        Self { ctx }
    }

    fn ensure_not_blocked(&self, op_type: OperationType, vault_id: Option<&str>) -> Result<()> {
        let check = self.ctx.store.check_blocking(op_type, vault_id);
        if check.blocked {
            let reason = check.reason.unwrap_or_else(|| format!("{} is blocked", op_type));
            tracing::info!("[VaultController] {} refused: {}", op_type, reason);
            return Err(CoordError::Blocked(reason));
        }
        Ok(())
    }

    fn upsert_vault(&self, vault: &Vault) {
        let mut vaults = self.ctx.state.vault_mut();
        match vaults.vaults.iter_mut().find(|v| v.id == vault.id) {
            Some(existing) => *existing = vault.clone(),
            None => vaults.vaults.push(vault.clone()),
        }
    }

    pub async fn list_vaults(&self) -> Result<Vec<Vault>> {
        let list = self.ctx.backend.list_vaults().await?;
        let mut vaults = self.ctx.state.vault_mut();
        vaults.vaults = list.vaults.clone();
        vaults.last_vault_id = list.last_vault_id;
        Ok(list.vaults)
    }

    pub async fn create_vault(&self, name: &str) -> Result<Vault> {
        self.ensure_not_blocked(OperationType::VaultCreate, None)?;

        let backend = self.ctx.backend.clone();
        let vault_name = name.to_string();
        let vault = self
            .ctx
            .queue
            .enqueue_vault_create(name, move || async move { backend.create_vault(&vault_name).await })
            .await?;

        self.upsert_vault(&vault);
        tracing::info!("[VaultController] ✓ Created vault '{}' ({})", vault.name, vault.id);
        Ok(vault)
    }

    pub async fn add_external_vault(&self, path: &str, name: &str) -> Result<Vault> {
        self.ensure_not_blocked(OperationType::VaultCreate, None)?;

        let backend = self.ctx.backend.clone();
        let vault_path = path.to_string();
        let vault_name = name.to_string();
        let vault = self
            .ctx
            .queue
            .enqueue(
                CATEGORY_VAULT,
                move || async move { backend.add_external_vault(&vault_path, &vault_name).await },
                EnqueueOptions::default()
                    .resource(path)
                    .tracked(OperationType::VaultCreate)
                    .describe(format!("add external vault {}", path)),
            )
            .await?;

        self.upsert_vault(&vault);
        tracing::info!("[VaultController] ✓ Added external vault '{}' at {}", vault.name, vault.path);
        Ok(vault)
    }

    /// Open `vault_id` and load its tree.
    ///
    /// A dirty buffer, including one in the vault being reopened, is flushed first; if that fails
    /// the open is refused so the edits are not thrown away. A tree load failure does
    /// not fail the open, it lands in `tree_error`.
    pub async fn open_vault(&self, vault_id: &str) -> Result<Vault> {
        let conflict = self
            .ctx
            .sync
            .check_vault_operation_conflict(vault_id, OperationType::VaultOpen);
        if conflict.has_conflict {
            return Err(CoordError::Blocked(
                conflict.reason.unwrap_or_else(|| "vault is busy".to_string()),
            ));
        }

        let previous = self.ctx.state.file_system().unsaved_vault().map(str::to_string);
        // Reopening the same vault resets the buffer too, so it is flushed either way.
        if let Some(previous) = previous {
            let outcome = self.ctx.sync.ensure_saved_before_vault_operation(&previous).await;
            if !outcome.saved {
                return Err(CoordError::Blocked(format!(
                    "unsaved changes in {} could not be saved: {}",
                    previous,
                    outcome.error.unwrap_or_default()
                )));
            }
        }

        let backend = self.ctx.backend.clone();
        let id = vault_id.to_string();
        let vault = self
            .ctx
            .queue
            .enqueue_vault_open(vault_id, move || async move { backend.open_vault(&id).await })
            .await?;

        self.upsert_vault(&vault);
        {
            let mut vaults = self.ctx.state.vault_mut();
            vaults.active_vault = Some(vault.clone());
            vaults.last_vault_id = Some(vault.id.clone());
        }
        *self.ctx.state.file_system_mut() = FileSystemState::for_vault(&vault);

        self.ctx.sync.handle_vault_opened(&vault.id);
        self.ctx.sync.notify(&AppEvent::VaultOpened {
            vault_id: vault.id.clone(),
        });
        tracing::info!("[VaultController] Opened vault '{}'", vault.name);

        let loaded = self.ctx.tree_loader.load_directory(&vault.id, &vault.path).await;
        let mut fs = self.ctx.state.file_system_mut();
        if fs.vault_id.as_deref() == Some(vault.id.as_str()) {
            match loaded {
                Ok(snapshot) => {
                    fs.tree = Some(snapshot);
                    fs.tree_error = None;
                }
                Err(e) => fs.tree_error = Some(e.to_string()),
            }
        }
        drop(fs);

        Ok(vault)
    }

    pub fn navigate_to_vault(&self, vault_id: &str) {
        self.ctx.sync.notify(&AppEvent::NavigateToVault {
            vault_id: vault_id.to_string(),
        });
    }

    /// Delete `vault_id`, optionally with its files.
    ///
    /// Unsaved changes in the vault are saved first. When that save fails the call
    /// returns `NeedsConfirmation` unless `force` is set, in which case the edits are
    /// discarded.
    pub async fn delete_vault(&self, vault_id: &str, delete_files: bool, force: bool) -> Result<DeleteOutcome> {
        let readiness = self.ctx.sync.prepare_for_vault_deletion(vault_id).await;
        if !readiness.ready {
            if !readiness.requires_confirmation {
                return Err(CoordError::Blocked(
                    readiness.error.unwrap_or_else(|| "vault is busy".to_string()),
                ));
            }
            if !force {
                return Ok(DeleteOutcome::NeedsConfirmation {
                    message: readiness
                        .message
                        .unwrap_or_else(|| "Discard unsaved changes?".to_string()),
                });
            }
            tracing::warn!("[VaultController] Discarding unsaved changes in {} on request", vault_id);
        }

        let backend = self.ctx.backend.clone();
        let id = vault_id.to_string();
        self.ctx
            .queue
            .enqueue_vault_delete(vault_id, move || async move {
                backend.delete_vault(&id, delete_files).await
            })
            .await?;

        self.ctx.sync.handle_vault_deleted(vault_id);
        tracing::info!(
            "[VaultController] 🗑️ Deleted vault {}{}",
            vault_id,
            if delete_files { " and its files" } else { "" }
        );
        Ok(DeleteOutcome::Deleted)
    }

    pub async fn check_health(&self) -> Result<HealthReport> {
        let backend = self.ctx.backend.clone();
        let report = self
            .ctx
            .queue
            .enqueue(
                CATEGORY_VAULT,
                move || async move { backend.check_vault_health().await },
                EnqueueOptions::default()
                    .tracked(OperationType::HealthCheck)
                    .describe("check vault health"),
            )
            .await?;

        if !report.broken.is_empty() {
            tracing::warn!("[VaultController] {} broken vault(s) found", report.broken.len());
        }
        self.ctx.state.vault_mut().broken = report.broken.clone();
        Ok(report)
    }

    pub async fn remove_broken_vault(&self, vault_id: &str) -> Result<()> {
        let backend = self.ctx.backend.clone();
        let id = vault_id.to_string();
        self.ctx
            .queue
            .enqueue(
                CATEGORY_VAULT,
                move || async move { backend.remove_broken_vault(&id).await },
                EnqueueOptions::default()
                    .resource(vault_id)
                    .tracked(OperationType::Cleanup)
                    .describe(format!("remove broken vault {}", vault_id)),
            )
            .await?;

        let mut vaults = self.ctx.state.vault_mut();
        vaults.vaults.retain(|v| v.id != vault_id);
        vaults.broken.retain(|b| b.id != vault_id);
        Ok(())
    }

    pub async fn cleanup_broken_vaults(&self) -> Result<CleanupReport> {
        let backend = self.ctx.backend.clone();
        let report = self
            .ctx
            .queue
            .enqueue(
                CATEGORY_VAULT,
                move || async move { backend.cleanup_all_broken_vaults().await },
                EnqueueOptions::default()
                    .tracked(OperationType::Cleanup)
                    .describe("clean up broken vaults"),
            )
            .await?;

        let mut vaults = self.ctx.state.vault_mut();
        vaults.vaults.retain(|v| !report.cleaned_ids.contains(&v.id));
        vaults.broken.retain(|b| !report.cleaned_ids.contains(&b.id));
        tracing::info!("[VaultController] Cleaned up {} broken vault(s)", report.cleaned);
        Ok(report)
    }
}
