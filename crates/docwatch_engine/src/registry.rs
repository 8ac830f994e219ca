//! Named token stores shared by the watches of one process.
//!
//! The registry is owned by whoever composes the watches. Other parts of the
//! process never touch it directly; they queue changes through a
//! [`RegistryUpdater`], and the owner applies them with
//! [`TokenStoreRegistry::apply_pending`] at a point of its choosing.

use crate::error::{WatchError, WatchResult};
use crate::token::TokenStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

enum RegistryUpdate {
    Register(String, Arc<dyn TokenStore>),
    Remove(String),
}

/// Queues changes to a [`TokenStoreRegistry`].
#[derive(Clone)]
pub struct RegistryUpdater {
    tx: mpsc::UnboundedSender<RegistryUpdate>,
}

impl RegistryUpdater {
    /// Queues registration of `store` under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, store: Arc<dyn TokenStore>) -> WatchResult<()> {
        self.send(RegistryUpdate::Register(name.into(), store))
    }

    /// Queues removal of `name`.
    pub fn remove(&self, name: impl Into<String>) -> WatchResult<()> {
        self.send(RegistryUpdate::Remove(name.into()))
    }

    fn send(&self, update: RegistryUpdate) -> WatchResult<()> {
        self.tx
            .send(update)
            .map_err(|_| WatchError::TokenStore("token store registry was dropped".into()))
    }
}

/// Named token stores.
pub struct TokenStoreRegistry {
    stores: HashMap<String, Arc<dyn TokenStore>>,
    tx: mpsc::UnboundedSender<RegistryUpdate>,
    rx: mpsc::UnboundedReceiver<RegistryUpdate>,
}

impl Default for TokenStoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStoreRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            stores: HashMap::new(),
            tx,
            rx,
        }
    }

    /// A handle queueing updates to this registry.
    pub fn updater(&self) -> RegistryUpdater {
        RegistryUpdater {
            tx: self.tx.clone(),
        }
    }

    /// Applies every queued update in order. Returns how many were applied.
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.rx.try_recv() {
            match update {
                RegistryUpdate::Register(name, store) => {
                    debug!(name = %name, "token store registered");
                    self.stores.insert(name, store);
                }
                RegistryUpdate::Remove(name) => {
                    debug!(name = %name, "token store removed");
                    self.stores.remove(&name);
                }
            }
            applied += 1;
        }
        applied
    }

    /// Looks up a store by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TokenStore>> {
        self.stores.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns true if no store is registered.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
