// FILE: src/storage/local.rs
//! Local disk backend.
//!
//! Layout under the data directory:
//! - `vaults.json`   registry of known vaults (+ last opened id)
//! - `operation.wal` journal entry while a destructive registry change is running
//! - `vaults/<name>` folders for vaults created through the app
//!
//! File calls only accept absolute paths inside a registered vault.

use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::now_millis;
use crate::error::{CoordError, Result};
use crate::storage::backend::{
    Backend, BrokenVault, CleanupReport, DirEntry, HealthReport, Vault, VaultList,
};
use crate::storage::wal::{write_synced, Journal, JournalOperation, JournalStatus, RecoveryResult};

pub const REGISTRY_FILE: &str = "vaults.json";
pub const WELCOME_FILE: &str = "Welcome.md";
const WELCOME_CONTENT: &str = "# Welcome\n\nThis is your new vault.\n";

/// Stable FNV-1a hash of a key, rendered as 16 hex digits. Used for vault ids.
pub fn stable_id(key: &str) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{:016x}", hash)
}

/// Run synchronous disk work (fsync, journal writes) off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|_| CoordError::Other(anyhow::anyhow!("Task panic")))?
}

fn vault_roots(registry: &VaultList) -> Vec<PathBuf> {
    registry.vaults.iter().map(|v| PathBuf::from(&v.path)).collect()
}

pub struct LocalBackend {
    data_dir: PathBuf,
    registry_path: PathBuf,
    vaults_root: PathBuf,
    journal: Journal,
    /// Serializes read-modify-write cycles on the registry file.
    registry_lock: Mutex<()>,
    /// Registered vault folders, replaced after every registry write.
    /// File calls check containment here and never read the registry file.
    roots: RwLock<Vec<PathBuf>>,
    recovery: RecoveryResult,
}

impl LocalBackend {
    /// Prepare the data directory and roll back any interrupted journaled change.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let vaults_root = data_dir.join("vaults");
        std::fs::create_dir_all(&vaults_root)?;

        let registry_path = data_dir.join(REGISTRY_FILE);
        let journal = Journal::new(&data_dir, registry_path.clone());
        let recovery = journal.recover_incomplete()?;
        if recovery.recovered {
            tracing::warn!(
                "[LocalBackend] Recovered interrupted operation: {}",
                recovery.message.as_deref().unwrap_or("")
            );
        }

        let registry: VaultList = match std::fs::read_to_string(&registry_path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VaultList::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!("[LocalBackend] Data directory: {}", data_dir.display());
        Ok(Self {
            data_dir,
            registry_path,
            vaults_root,
            journal,
            registry_lock: Mutex::new(()),
            roots: RwLock::new(vault_roots(&registry)),
            recovery,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// What `open` found in the journal.
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    /// Callers hold `registry_lock`.
    async fn load_registry(&self) -> Result<VaultList> {
        match tokio::fs::read_to_string(&self.registry_path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VaultList::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Callers hold `registry_lock`. The roots cache follows the file.
    async fn save_registry(&self, registry: &VaultList) -> Result<()> {
        let json = serde_json::to_string_pretty(registry)?;
        let path = self.registry_path.clone();
        blocking(move || write_synced(&path, &json)).await?;
        *self.roots.write().unwrap_or_else(PoisonError::into_inner) = vault_roots(registry);
        Ok(())
    }

    async fn registry_backup(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.load_registry().await?)?)
    }

    /// Run a journal step on the blocking pool.
    async fn journaled<T, F>(&self, step: F) -> Result<T>
    where
        F: FnOnce(&Journal) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let journal = self.journal.clone();
        blocking(move || step(&journal)).await
    }

    /// Accept `path` only if it is absolute, has no `..`, and sits inside a registered vault.
    fn ensure_within_vault(&self, path: &str) -> Result<PathBuf> {
        let candidate = PathBuf::from(path);
        if !candidate.is_absolute()
            || candidate.components().any(|c| matches!(c, Component::ParentDir))
        {
            return Err(CoordError::InvalidPath(path.to_string()));
        }

        let roots = self.roots.read().unwrap_or_else(PoisonError::into_inner);
        if roots.iter().any(|root| candidate.starts_with(root)) {
            Ok(candidate)
        } else {
            Err(CoordError::InvalidPath(format!("{} is outside every vault", path)))
        }
    }

    fn validate_vault_name(name: &str) -> Result<()> {
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed == "."
            || trimmed == ".."
        {
            return Err(CoordError::InvalidPath(format!("invalid vault name '{}'", name)));
        }
        Ok(())
    }

    async fn is_broken(vault: &Vault) -> Option<String> {
        match tokio::fs::metadata(&vault.path).await {
            Err(_) => Some("folder missing".to_string()),
            Ok(meta) if !meta.is_dir() => Some("not a directory".to_string()),
            Ok(_) => None,
        }
    }

    async fn create_vault_files(vault_path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(vault_path).await?;
        tokio::fs::write(vault_path.join(WELCOME_FILE), WELCOME_CONTENT).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn list_vaults(&self) -> Result<VaultList> {
        let _guard = self.registry_lock.lock().await;
        self.load_registry().await
    }

    async fn create_vault(&self, name: &str) -> Result<Vault> {
        Self::validate_vault_name(name)?;
        let _guard = self.registry_lock.lock().await;

        let vault_path = self.vaults_root.join(name.trim());
        if tokio::fs::try_exists(&vault_path).await? {
            return Err(CoordError::State(format!("'{}' already exists", vault_path.display())));
        }

        let created_at = now_millis();
        let path_str = vault_path.to_string_lossy().to_string();
        let vault = Vault {
            id: stable_id(&format!("{}:{}", path_str, created_at)),
            name: name.trim().to_string(),
            path: path_str.clone(),
            created_at,
            last_opened: None,
        };

        let operation = JournalOperation::CreateVault {
            vault_id: vault.id.clone(),
            vault_path: path_str,
        };
        self.journaled(move |j| {
            j.begin(operation)?;
            j.update_status(JournalStatus::InProgress)
        })
        .await?;

        let mut result = Self::create_vault_files(&vault_path).await;
        if result.is_ok() {
            result = match self.load_registry().await {
                Ok(mut registry) => {
                    registry.vaults.push(vault.clone());
                    self.save_registry(&registry).await
                }
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(()) => {
                self.journaled(|j| j.commit()).await?;
                tracing::info!("[LocalBackend] Created vault '{}' ({})", vault.name, vault.id);
                Ok(vault)
            }
            Err(e) => {
                let reason = e.to_string();
                self.journaled(move |j| j.rollback(&reason)).await?;
                Err(CoordError::backend("createVault", e))
            }
        }
    }

    async fn add_external_vault(&self, path: &str, name: &str) -> Result<Vault> {
        Self::validate_vault_name(name)?;
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| CoordError::backend("addExternalVault", e))?;
        let is_dir = tokio::fs::metadata(&canonical).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(CoordError::InvalidPath(format!("{} is not a directory", path)));
        }
        let path_str = canonical.to_string_lossy().to_string();

        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        if registry.vaults.iter().any(|v| v.path == path_str) {
            return Err(CoordError::State(format!("{} is already registered", path_str)));
        }

        let created_at = now_millis();
        let vault = Vault {
            id: stable_id(&format!("{}:{}", path_str, created_at)),
            name: name.trim().to_string(),
            path: path_str,
            created_at,
            last_opened: None,
        };
        registry.vaults.push(vault.clone());
        self.save_registry(&registry).await?;
        tracing::info!("[LocalBackend] Registered external vault {} at {}", vault.id, vault.path);
        Ok(vault)
    }

    async fn open_vault(&self, vault_id: &str) -> Result<Vault> {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        let vault = registry
            .vaults
            .iter_mut()
            .find(|v| v.id == vault_id)
            .ok_or_else(|| CoordError::NotFound(format!("vault {}", vault_id)))?;

        if let Some(reason) = Self::is_broken(vault).await {
            return Err(CoordError::backend("openVault", format!("{}: {}", vault.path, reason)));
        }

        vault.last_opened = Some(now_millis());
        let opened = vault.clone();
        registry.last_vault_id = Some(vault_id.to_string());
        self.save_registry(&registry).await?;
        Ok(opened)
    }

    async fn delete_vault(&self, vault_id: &str, delete_files: bool) -> Result<()> {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        let idx = registry
            .vaults
            .iter()
            .position(|v| v.id == vault_id)
            .ok_or_else(|| CoordError::NotFound(format!("vault {}", vault_id)))?;
        let vault = registry.vaults.remove(idx);

        let operation = JournalOperation::DeleteVault {
            vault_id: vault.id.clone(),
            vault_path: vault.path.clone(),
            delete_files,
            registry_backup: self.registry_backup().await?,
        };
        self.journaled(move |j| {
            j.begin(operation)?;
            j.update_status(JournalStatus::InProgress)
        })
        .await?;

        if registry.last_vault_id.as_deref() == Some(vault_id) {
            registry.last_vault_id = None;
        }

        let mut result = self.save_registry(&registry).await;
        if result.is_ok() && delete_files && tokio::fs::try_exists(&vault.path).await.unwrap_or(false) {
            result = tokio::fs::remove_dir_all(&vault.path).await.map_err(CoordError::from);
        }

        match result {
            Ok(()) => {
                self.journaled(|j| j.commit()).await?;
                tracing::info!(
                    "[LocalBackend] Deleted vault {} (files removed: {})",
                    vault_id,
                    delete_files
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.journaled(move |j| j.rollback(&reason)).await?;
                // The rollback rewrote the registry from its backup.
                let restored = self.load_registry().await?;
                *self.roots.write().unwrap_or_else(PoisonError::into_inner) = vault_roots(&restored);
                Err(CoordError::backend("deleteVault", e))
            }
        }
    }

    async fn remove_broken_vault(&self, vault_id: &str) -> Result<()> {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        let vault = registry
            .vaults
            .iter()
            .find(|v| v.id == vault_id)
            .ok_or_else(|| CoordError::NotFound(format!("vault {}", vault_id)))?;
        if Self::is_broken(vault).await.is_none() {
            return Err(CoordError::State(format!("vault {} is healthy", vault_id)));
        }
        registry.vaults.retain(|v| v.id != vault_id);
        if registry.last_vault_id.as_deref() == Some(vault_id) {
            registry.last_vault_id = None;
        }
        self.save_registry(&registry).await
    }

    async fn check_vault_health(&self) -> Result<HealthReport> {
        let _guard = self.registry_lock.lock().await;
        let registry = self.load_registry().await?;
        let mut report = HealthReport::default();
        for vault in &registry.vaults {
            match Self::is_broken(vault).await {
                None => report.healthy.push(vault.id.clone()),
                Some(reason) => report.broken.push(BrokenVault {
                    id: vault.id.clone(),
                    name: vault.name.clone(),
                    path: vault.path.clone(),
                    reason,
                }),
            }
        }
        Ok(report)
    }

    async fn cleanup_all_broken_vaults(&self) -> Result<CleanupReport> {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        let mut broken = Vec::new();
        for vault in &registry.vaults {
            if Self::is_broken(vault).await.is_some() {
                broken.push(vault.id.clone());
            }
        }
        if broken.is_empty() {
            return Ok(CleanupReport::default());
        }

        let operation = JournalOperation::CleanupBrokenVaults {
            registry_backup: self.registry_backup().await?,
            vault_ids: broken.clone(),
        };
        self.journaled(move |j| {
            j.begin(operation)?;
            j.update_status(JournalStatus::InProgress)
        })
        .await?;

        registry.vaults.retain(|v| !broken.contains(&v.id));
        if let Some(last) = &registry.last_vault_id {
            if broken.contains(last) {
                registry.last_vault_id = None;
            }
        }

        match self.save_registry(&registry).await {
            Ok(()) => {
                self.journaled(|j| j.commit()).await?;
                tracing::info!("[LocalBackend] Removed {} broken vaults", broken.len());
                Ok(CleanupReport {
                    cleaned: broken.len(),
                    cleaned_ids: broken,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.journaled(move |j| j.rollback(&reason)).await?;
                Err(CoordError::backend("cleanupAllBrokenVaults", e))
            }
        }
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let path = self.ensure_within_vault(path)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CoordError::backend("readFile", format!("{}: {}", path.display(), e)))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let path = self.ensure_within_vault(path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| CoordError::backend("writeFile", format!("{}: {}", path.display(), e)))
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.ensure_within_vault(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CoordError::backend("listDirectory", format!("{}: {}", dir.display(), e)))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let entry_path = entry.path();
            // Follows symlinks so a linked folder shows up as a folder.
            let is_directory = tokio::fs::metadata(&entry_path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry_path.to_string_lossy().to_string(),
                is_directory,
            });
        }
        Ok(entries)
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let path = self.ensure_within_vault(path)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| CoordError::backend("createDirectory", format!("{}: {}", path.display(), e)))
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let target = self.ensure_within_vault(path)?;
        let meta = tokio::fs::symlink_metadata(&target)
            .await
            .map_err(|e| CoordError::backend("deletePath", format!("{}: {}", target.display(), e)))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        result.map_err(|e| CoordError::backend("deletePath", format!("{}: {}", target.display(), e)))
    }

    async fn rename_path(&self, old_path: &str, new_path: &str) -> Result<()> {
        let from = self.ensure_within_vault(old_path)?;
        let to = self.ensure_within_vault(new_path)?;
        if tokio::fs::try_exists(&to).await.unwrap_or(false) {
            return Err(CoordError::State(format!("{} already exists", to.display())));
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| CoordError::backend("renamePath", format!("{} -> {}: {}", from.display(), to.display(), e)))
    }

    async fn get_canonical_path(&self, path: &str) -> Result<String> {
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| CoordError::backend("getCanonicalPath", format!("{}: {}", path, e)))?;
        Ok(canonical.to_string_lossy().to_string())
    }
}
