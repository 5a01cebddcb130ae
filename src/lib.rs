//! vaultsync: operation coordination for a local note vault app.
//!
//! Four cooperating pieces sit between the UI controllers and the storage backend:
//! - Operation Ledger (`core::operations`): what is running, for the UI
//! - Gatekeeper (`core::lock_queue`): per-resource locks and per-category FIFO chains
//! - Tree loader (`engine::tree_loader`): bounded, cycle-safe directory walks
//! - Courier (`engine::sync_service`): flushes editor buffers around vault actions

pub mod config;
pub mod context;
pub mod controllers;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod state;
pub mod storage;

pub use config::{CoordinatorConfig, TreeLimits};
pub use context::Coordinator;
pub use controllers::{DeleteOutcome, EditorController, VaultController};
pub use crate::core::{EnqueueOptions, LockQueue, Operation, OperationId, OperationState, OperationStore, OperationType};
pub use engine::{FileNode, SyncService, TreeLoader, TreeSnapshot};
pub use error::{CoordError, Result};
pub use events::AppEvent;
pub use state::{AppState, SharedState};
pub use storage::{Backend, LocalBackend};
