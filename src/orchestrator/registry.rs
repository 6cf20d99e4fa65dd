//! Task → agent channel registry.
//!
//! The registry is the single source of truth for "is this task connected".
//! Entries are inserted only once the agent acknowledged readiness and are
//! removed on stop or when the agent connection is lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::AgentChannel;
use crate::models::lock;

/// Registered channels keyed by task id.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Arc<dyn AgentChannel>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel registered for `task_id`.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<Arc<dyn AgentChannel>> {
        lock(&self.entries).get(task_id).cloned()
    }

    /// Whether `task_id` has a registered channel.
    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        lock(&self.entries).contains_key(task_id)
    }

    /// Register `channel` for `task_id`, returning the entry it replaced.
    pub fn insert(
        &self,
        task_id: &str,
        channel: Arc<dyn AgentChannel>,
    ) -> Option<Arc<dyn AgentChannel>> {
        lock(&self.entries).insert(task_id.to_owned(), channel)
    }

    /// Remove and return the channel for `task_id`.
    pub fn remove(&self, task_id: &str) -> Option<Arc<dyn AgentChannel>> {
        lock(&self.entries).remove(task_id)
    }

    /// Whether `task_id` is registered with exactly `channel`.
    #[must_use]
    pub fn is_registered_with(&self, task_id: &str, channel: &Arc<dyn AgentChannel>) -> bool {
        lock(&self.entries)
            .get(task_id)
            .is_some_and(|current| Arc::ptr_eq(current, channel))
    }

    /// Identifiers of all registered tasks.
    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}
