// FILE: src/storage/wal.rs
//! Operation journal for destructive registry changes.
//!
//! An entry is written (and fsynced) before a vault is created, deleted or a batch
//! of broken vaults is dropped, and removed once the change is done. If the process
//! dies in between, the next `LocalBackend::open` finds the entry and rolls back:
//! - delete / cleanup: the registry is restored from the backup inside the entry
//! - create: the half-made vault folder is removed if it holds at most one entry

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::now_millis;
use crate::error::{CoordError, Result};

pub const JOURNAL_FILE: &str = "operation.wal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalOperation {
    DeleteVault {
        vault_id: String,
        vault_path: String,
        delete_files: bool,
        /// Registry JSON as it was before the change.
        registry_backup: String,
    },
    CreateVault {
        vault_id: String,
        vault_path: String,
    },
    CleanupBrokenVaults {
        registry_backup: String,
        vault_ids: Vec<String>,
    },
}

impl JournalOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            JournalOperation::DeleteVault { .. } => "delete_vault",
            JournalOperation::CreateVault { .. } => "create_vault",
            JournalOperation::CleanupBrokenVaults { .. } => "cleanup_broken",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStatus {
    Pending,
    InProgress,
    Completed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub operation: JournalOperation,
    pub started_at: u64,
    pub status: JournalStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub recovered: bool,
    pub message: Option<String>,
    pub operation_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    registry_path: PathBuf,
}

impl Journal {
    pub fn new(data_dir: &Path, registry_path: PathBuf) -> Self {
        Self {
            path: data_dir.join(JOURNAL_FILE),
            registry_path,
        }
    }

    /// Write a new pending entry. Refuses if a previous entry was never cleared.
    pub fn begin(&self, operation: JournalOperation) -> Result<String> {
        if self.path.exists() {
            return Err(CoordError::State(
                "previous journaled operation still pending; restart to recover".into(),
            ));
        }

        let entry = JournalEntry {
            id: format!("txn_{}", now_millis()),
            operation,
            started_at: now_millis(),
            status: JournalStatus::Pending,
            error: None,
        };
        write_synced(&self.path, &serde_json::to_string_pretty(&entry)?)?;
        tracing::debug!("[Journal] Began {} ({})", entry.operation.kind(), entry.id);
        Ok(entry.id)
    }

    pub fn update_status(&self, status: JournalStatus) -> Result<()> {
        let Some(mut entry) = self.current_entry()? else {
            return Ok(());
        };
        entry.status = status;
        write_synced(&self.path, &serde_json::to_string_pretty(&entry)?)
    }

    pub fn mark_failed(&self, error: &str) -> Result<()> {
        let Some(mut entry) = self.current_entry()? else {
            return Ok(());
        };
        entry.status = JournalStatus::RolledBack;
        entry.error = Some(error.to_string());
        write_synced(&self.path, &serde_json::to_string_pretty(&entry)?)
    }

    /// The change is done; forget the entry.
    pub fn commit(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Undo the current entry's change, then clear it.
    pub fn rollback(&self, reason: &str) -> Result<Option<String>> {
        let Some(entry) = self.current_entry()? else {
            return Ok(None);
        };
        let message = self.undo(&entry)?;
        self.mark_failed(reason)?;
        self.commit()?;
        tracing::warn!("[Journal] {} ({})", message, reason);
        Ok(Some(message))
    }

    /// Startup check: roll back anything that was interrupted.
    pub fn recover_incomplete(&self) -> Result<RecoveryResult> {
        let Some(entry) = self.current_entry()? else {
            return Ok(RecoveryResult::default());
        };

        match entry.status {
            JournalStatus::Pending | JournalStatus::InProgress => {
                let message = self.undo(&entry)?;
                self.mark_failed("Recovered from interrupted operation")?;
                self.commit()?;
                tracing::warn!("[Journal] 🔄 {}", message);
                Ok(RecoveryResult {
                    recovered: true,
                    message: Some(message),
                    operation_type: Some(entry.operation.kind().to_string()),
                })
            }
            JournalStatus::Completed | JournalStatus::RolledBack => {
                self.commit()?;
                Ok(RecoveryResult {
                    recovered: false,
                    message: Some("Cleaned up finished journal entry".to_string()),
                    operation_type: None,
                })
            }
        }
    }

    fn undo(&self, entry: &JournalEntry) -> Result<String> {
        match &entry.operation {
            JournalOperation::DeleteVault { vault_id, registry_backup, .. } => {
                write_synced(&self.registry_path, registry_backup)?;
                Ok(format!("Rolled back incomplete vault deletion: {}", vault_id))
            }
            JournalOperation::CreateVault { vault_id, vault_path } => {
                let path = Path::new(vault_path);
                if path.exists() {
                    if let Ok(entries) = fs::read_dir(path) {
                        if entries.count() <= 1 {
                            if let Err(e) = fs::remove_dir_all(path) {
                                tracing::warn!(
                                    "[Journal] Could not remove partial vault folder {}: {}",
                                    vault_path,
                                    e
                                );
                            }
                        }
                    }
                }
                Ok(format!("Cleaned up incomplete vault creation: {}", vault_id))
            }
            JournalOperation::CleanupBrokenVaults { registry_backup, vault_ids } => {
                write_synced(&self.registry_path, registry_backup)?;
                Ok(format!(
                    "Rolled back incomplete cleanup of {} broken vaults",
                    vault_ids.len()
                ))
            }
        }
    }

    pub fn has_active_transaction(&self) -> bool {
        self.path.exists()
    }

    pub fn current_entry(&self) -> Result<Option<JournalEntry>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Write `content` to a sibling temp file, fsync it, then rename it over `path`.
/// Readers see either the old file or the new one, never a truncated one.
pub fn write_synced(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(dir: &Path) -> Journal {
        Journal::new(dir, dir.join("vaults.json"))
    }

    #[test]
    fn test_begin_commit_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());

        j.begin(JournalOperation::CreateVault {
            vault_id: "v1".into(),
            vault_path: dir.path().join("v1").to_string_lossy().into(),
        })
        .unwrap();
        assert!(j.has_active_transaction());

        j.update_status(JournalStatus::InProgress).unwrap();
        assert_eq!(j.current_entry().unwrap().unwrap().status, JournalStatus::InProgress);

        j.commit().unwrap();
        assert!(!j.has_active_transaction());
    }

    #[test]
    fn test_second_begin_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let op = JournalOperation::CleanupBrokenVaults {
            registry_backup: "{}".into(),
            vault_ids: vec![],
        };
        j.begin(op.clone()).unwrap();
        assert!(matches!(j.begin(op), Err(CoordError::State(_))));
    }

    #[test]
    fn test_interrupted_delete_restores_registry() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let registry = dir.path().join("vaults.json");
        std::fs::write(&registry, r#"{"vaults":[],"lastVaultId":null}"#).unwrap();

        j.begin(JournalOperation::DeleteVault {
            vault_id: "v1".into(),
            vault_path: "/nowhere".into(),
            delete_files: false,
            registry_backup: r#"{"vaults":["backup"]}"#.into(),
        })
        .unwrap();
        j.update_status(JournalStatus::InProgress).unwrap();

        let result = j.recover_incomplete().unwrap();
        assert!(result.recovered);
        assert_eq!(result.operation_type.as_deref(), Some("delete_vault"));
        assert_eq!(std::fs::read_to_string(&registry).unwrap(), r#"{"vaults":["backup"]}"#);
        assert!(!j.has_active_transaction());
    }

    #[test]
    fn test_interrupted_create_removes_sparse_folder_only() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let sparse = dir.path().join("sparse");
        std::fs::create_dir_all(&sparse).unwrap();
        std::fs::write(sparse.join("Welcome.md"), "hi").unwrap();

        j.begin(JournalOperation::CreateVault {
            vault_id: "s".into(),
            vault_path: sparse.to_string_lossy().into(),
        })
        .unwrap();
        j.recover_incomplete().unwrap();
        assert!(!sparse.exists());

        let full = dir.path().join("full");
        std::fs::create_dir_all(&full).unwrap();
        std::fs::write(full.join("a.md"), "a").unwrap();
        std::fs::write(full.join("b.md"), "b").unwrap();
        j.begin(JournalOperation::CreateVault {
            vault_id: "f".into(),
            vault_path: full.to_string_lossy().into(),
        })
        .unwrap();
        j.recover_incomplete().unwrap();
        assert!(full.exists());
    }

    #[test]
    fn test_write_synced_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("vaults.json");

        write_synced(&target, "first").unwrap();
        write_synced(&target, "second").unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        let names: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("vaults.json")]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unremovable_partial_vault_still_recovers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let locked = dir.path().join("locked");
        let partial = locked.join("partial");
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join("Welcome.md"), "hi").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        j.begin(JournalOperation::CreateVault {
            vault_id: "p".into(),
            vault_path: partial.to_string_lossy().into(),
        })
        .unwrap();
        let result = j.recover_incomplete();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = result.unwrap();
        assert!(result.recovered);
        assert!(!j.has_active_transaction());
    }

    #[test]
    fn test_finished_entry_is_just_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        j.begin(JournalOperation::CleanupBrokenVaults {
            registry_backup: "{}".into(),
            vault_ids: vec!["x".into()],
        })
        .unwrap();
        j.update_status(JournalStatus::Completed).unwrap();

        let result = j.recover_incomplete().unwrap();
        assert!(!result.recovered);
        assert!(!j.has_active_transaction());
        assert!(!dir.path().join("vaults.json").exists());
    }
}
