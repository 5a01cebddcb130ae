// FILE: src/controllers/editor.rs
//! The open vault's editor: file buffer, file operations and tree refresh.

use std::sync::Arc;

use futures::FutureExt;

use crate::context::Coordinator;
use crate::core::lock_queue::{EnqueueOptions, CATEGORY_FILE};
use crate::core::operations::OperationType;
use crate::engine::sync_service::{flush_unsaved, SaveHandler};
use crate::error::{CoordError, Result};
use crate::events::AppEvent;

#[derive(Clone)]
pub struct EditorController {
    ctx: Coordinator,
}

fn is_same_or_inside(path: &str, target: &str) -> bool {
    path == target
        || path
            .strip_prefix(target)
            .map_or(false, |rest| rest.starts_with('/'))
}

impl EditorController {
    pub fn new(ctx: Coordinator) -> Self {
        Self { ctx }
    }

    /// Register the save handler the sync service uses before vault actions.
    pub fn activate(&self, vault_id: &str) {
        let state = Arc::clone(&self.ctx.state);
        let backend = Arc::clone(&self.ctx.backend);
        let queue = self.ctx.queue.clone();
        // Weak: the service owns this handler.
        let sync = Arc::downgrade(&self.ctx.sync);

        let handler: SaveHandler = Arc::new(move || {
            let state = Arc::clone(&state);
            let backend = Arc::clone(&backend);
            let queue = queue.clone();
            let sync = sync.clone();
            async move {
                let path = state.file_system().current_file.clone();
                if flush_unsaved(&state, &backend, &queue).await? {
                    if let (Some(sync), Some(path)) = (sync.upgrade(), path) {
                        sync.notify(&AppEvent::FileSaved { path });
                    }
                }
                Ok::<(), CoordError>(())
            }
            .boxed()
        });

        self.ctx.sync.register_save_handler(vault_id, handler);
        tracing::debug!("[Editor] Active for vault {}", vault_id);
    }

    pub fn deactivate(&self) {
        let vault_id = self.ctx.state.file_system().vault_id.clone();
        if let Some(vault_id) = vault_id {
            self.ctx.sync.unregister_save_handler(&vault_id);
        }
    }

    /// Open `path` in the buffer. Pending edits to the previous file are saved first.
    /// Selecting the file that is already open with pending edits keeps the buffer.
    pub async fn select_file(&self, path: &str) -> Result<String> {
        let (dirty, same) = {
            let fs = self.ctx.state.file_system();
            (fs.has_unsaved_changes, fs.current_file.as_deref() == Some(path))
        };
        if dirty && same {
            return Ok(self.ctx.state.file_system().content.clone());
        }
        if dirty {
            self.save().await?;
        }

        let content = self.ctx.backend.read_file(path).await?;
        {
            let mut fs = self.ctx.state.file_system_mut();
            fs.current_file = Some(path.to_string());
            fs.content = content.clone();
            fs.saved_content = content.clone();
            fs.has_unsaved_changes = false;
        }

        self.ctx.sync.notify(&AppEvent::FileSelected {
            path: path.to_string(),
        });
        Ok(content)
    }

    pub fn update_content(&self, content: &str) -> Result<()> {
        let mut fs = self.ctx.state.file_system_mut();
        if fs.current_file.is_none() {
            return Err(CoordError::State("no file is open".to_string()));
        }
        fs.content = content.to_string();
        fs.has_unsaved_changes = fs.content != fs.saved_content;
        Ok(())
    }

    /// Write the buffer. Returns `false` when it was already clean.
    pub async fn save(&self) -> Result<bool> {
        let path = self.ctx.state.file_system().current_file.clone();
        let saved = flush_unsaved(&self.ctx.state, &self.ctx.backend, &self.ctx.queue).await?;
        if let (true, Some(path)) = (saved, path) {
            tracing::info!("[Editor] 💾 Saved {}", path);
            self.ctx.sync.notify(&AppEvent::FileSaved { path });
        }
        Ok(saved)
    }

    pub async fn create_file(&self, path: &str) -> Result<()> {
        let backend = Arc::clone(&self.ctx.backend);
        let target = path.to_string();
        self.ctx
            .queue
            .enqueue_file_create(path, move || async move { backend.write_file(&target, "").await })
            .await?;
        self.refresh_quietly().await;
        Ok(())
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let backend = Arc::clone(&self.ctx.backend);
        let target = path.to_string();
        self.ctx
            .queue
            .enqueue(
                CATEGORY_FILE,
                move || async move { backend.create_directory(&target).await },
                EnqueueOptions::default()
                    .resource(path)
                    .tracked(OperationType::FileCreate)
                    .describe(format!("create folder {}", path)),
            )
            .await?;
        self.refresh_quietly().await;
        Ok(())
    }

    /// Delete a file or folder. An open buffer inside it is dropped.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let backend = Arc::clone(&self.ctx.backend);
        let target = path.to_string();
        self.ctx
            .queue
            .enqueue_file_delete(path, move || async move { backend.delete_path(&target).await })
            .await?;

        {
            let mut fs = self.ctx.state.file_system_mut();
            let open_inside = fs
                .current_file
                .as_deref()
                .map_or(false, |current| is_same_or_inside(current, path));
            if open_inside {
                fs.current_file = None;
                fs.content.clear();
                fs.saved_content.clear();
                fs.has_unsaved_changes = false;
            }
        }
        self.refresh_quietly().await;
        Ok(())
    }

    pub async fn rename_path(&self, from: &str, to: &str) -> Result<()> {
        let backend = Arc::clone(&self.ctx.backend);
        let (source, dest) = (from.to_string(), to.to_string());
        self.ctx
            .queue
            .enqueue_file_rename(from, to, move || async move { backend.rename_path(&source, &dest).await })
            .await?;

        {
            let mut fs = self.ctx.state.file_system_mut();
            let renamed = fs.current_file.as_deref().and_then(|current| {
                if is_same_or_inside(current, from) {
                    Some(format!("{}{}", to, &current[from.len()..]))
                } else {
                    None
                }
            });
            if renamed.is_some() {
                fs.current_file = renamed;
            }
        }
        self.refresh_quietly().await;
        Ok(())
    }

    /// Reload the tree of the open vault into the shared state.
    pub async fn refresh_tree(&self) -> Result<()> {
        let (vault_id, root) = {
            let fs = self.ctx.state.file_system();
            match (&fs.vault_id, &fs.root_path) {
                (Some(id), Some(root)) => (id.clone(), root.clone()),
                _ => return Err(CoordError::State("no vault is open".to_string())),
            }
        };

        let loaded = self.ctx.tree_loader.load_directory(&vault_id, &root).await;
        let mut fs = self.ctx.state.file_system_mut();
        // The vault may have changed while the tree was loading.
        if fs.vault_id.as_deref() != Some(vault_id.as_str()) {
            return Ok(());
        }
        match loaded {
            Ok(snapshot) => {
                fs.tree = Some(snapshot);
                fs.tree_error = None;
                Ok(())
            }
            Err(e) => {
                fs.tree_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn refresh_quietly(&self) {
        if let Err(e) = self.refresh_tree().await {
            tracing::warn!("[Editor] Tree refresh failed: {}", e);
        }
    }
}
