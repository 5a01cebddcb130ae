// FILE: src/events.rs
//! Listener registry and the typed application events.
//!
//! Every observer in the crate goes through [`Listeners`]: registration hands back a
//! [`Subscription`], and a panicking listener is caught and logged so it never reaches
//! the code that emitted the event or the listeners after it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};

/// Events raised to the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppEvent {
    VaultOpened { vault_id: String },
    VaultDeleted { vault_id: String },
    /// The active vault went away; the editor view must be left.
    NavigateToVaults,
    NavigateToVault { vault_id: String },
    FileSelected { path: String },
    FileSaved { path: String },
}

impl AppEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::VaultOpened { .. } => "vault-opened",
            AppEvent::VaultDeleted { .. } => "vault-deleted",
            AppEvent::NavigateToVaults => "navigate-to-vaults",
            AppEvent::NavigateToVault { .. } => "navigate-to-vault",
            AppEvent::FileSelected { .. } => "file-selected",
            AppEvent::FileSaved { .. } => "file-saved",
        }
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<T>)>>,
}

/// A set of observers for values of type `T`.
pub struct Listeners<T> {
    inner: Arc<Registry<T>>,
    label: &'static str,
}

impl<T: 'static> Listeners<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
            label,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        let weak: Weak<Registry<T>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry
                        .entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Deliver `value` to every listener registered at the time of the call.
    pub fn emit(&self, value: &T) {
        // Snapshot first so listeners may subscribe/unsubscribe while being called.
        let callbacks: Vec<Callback<T>> = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for cb in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(value))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("[{}] Listener panicked: {}", self.label, msg);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Handle returned by [`Listeners::subscribe`]. Dropping it keeps the listener alive;
/// call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
