//! Remote listener registry
//!
//! One `ListenerHandle` per collection. Teardown runs every handle's
//! unsubscribe first and only then empties the map.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::remote::Unsubscribe;

/// An installed change-stream listener
pub struct ListenerHandle {
    collection: String,
    uid: String,
    unsubscribe: Option<Unsubscribe>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("collection", &self.collection)
            .field("uid", &self.uid)
            .field("active", &self.is_active())
            .finish()
    }
}

impl ListenerHandle {
    pub fn new(
        collection: impl Into<String>,
        uid: impl Into<String>,
        unsubscribe: Unsubscribe,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            collection: collection.into(),
            uid: uid.into(),
            unsubscribe: Some(unsubscribe),
            task,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Whether unsubscribe has not run yet
    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    /// Unsubscribe and stop the delivery task; safe to call twice
    pub fn teardown(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Collection name → active listener
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    handles: HashMap<String, ListenerHandle>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handle, tearing down any previous one for the collection
    pub fn insert(&mut self, handle: ListenerHandle) {
        if let Some(mut previous) = self.handles.remove(handle.collection()) {
            debug!("Replacing listener for '{}'", previous.collection());
            previous.teardown();
        }
        self.handles.insert(handle.collection().to_string(), handle);
    }

    /// Tear down a single collection's listener
    pub fn remove(&mut self, collection: &str) -> bool {
        match self.handles.remove(collection) {
            Some(mut handle) => {
                handle.teardown();
                true
            }
            None => false,
        }
    }

    /// Tear down every listener, then clear; returns how many were active
    pub fn teardown_all(&mut self) -> usize {
        let mut torn_down = 0;
        for handle in self.handles.values_mut() {
            if handle.is_active() {
                torn_down += 1;
            }
            handle.teardown();
        }
        self.handles.clear();
        torn_down
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.handles.contains_key(collection)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Registered collection names, sorted
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.keys().cloned().collect();
        names.sort();
        names
    }
}
