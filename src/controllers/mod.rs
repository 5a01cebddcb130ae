// FILE: src/controllers/mod.rs
//! UI-facing controllers. The only writers of `AppState`.

pub mod editor;
pub mod vault;

pub use editor::EditorController;
pub use vault::{DeleteOutcome, VaultController};
