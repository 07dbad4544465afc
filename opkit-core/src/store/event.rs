//! Watch events emitted by store changes.

use crate::model::{Action, ResourceInstance, ResourceKey};

/// A change observed on a single resource instance.
///
/// Stores dispatch these via broadcast channels; the event loop consumes them.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub action: Action,
    pub resource: ResourceInstance,
}

impl WatchEvent {
    pub fn new(action: Action, resource: ResourceInstance) -> Self {
        Self { action, resource }
    }

    pub fn added(resource: ResourceInstance) -> Self {
        Self::new(Action::Added, resource)
    }

    pub fn modified(resource: ResourceInstance) -> Self {
        Self::new(Action::Modified, resource)
    }

    pub fn deleted(resource: ResourceInstance) -> Self {
        Self::new(Action::Deleted, resource)
    }

    /// Get the identity this event refers to.
    pub fn key(&self) -> ResourceKey {
        self.resource.key()
    }
}
