//! MemoryStore implementation - an in-process resource store with store semantics.
//!
//! Versions come from a single store-wide counter, so every successful write
//! produces a fresh `resource_version`. Deletion follows the finalizer
//! protocol: an instance carrying finalizers is only marked, and is removed
//! by whichever write leaves it marked with an empty finalizer list.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::model::{ResourceInstance, ResourceKey};

use super::error::{Result, StoreError};
use super::event::WatchEvent;
use super::traits::{PatchScope, ResourceFacade, ResourceLookup};

/// Result of a delete request.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Finalizers are pending; the instance now carries a deletion timestamp.
    MarkedForDeletion(ResourceInstance),
    /// The instance is gone.
    Removed(ResourceInstance),
}

struct State {
    objects: BTreeMap<ResourceKey, ResourceInstance>,
    last_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

/// In-memory store emitting a [`WatchEvent`] for every change.
pub struct MemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store whose watch channel buffers `capacity` events
    /// (at least one).
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(State {
                objects: BTreeMap::new(),
                last_version: 0,
            }),
            events,
            available: AtomicBool::new(true),
        }
    }

    /// Subscribe to changes made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Simulate the store becoming (un)reachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is not reachable".into()))
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn create(&self, mut resource: ResourceInstance) -> Result<ResourceInstance> {
        self.ensure_available()?;
        let key = resource.key();
        let mut state = self.state.write().await;
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        resource.metadata.resource_version = state.next_version();
        resource.metadata.deletion_timestamp = None;
        state.objects.insert(key, resource.clone());
        debug!(resource = %resource.identifier(), "Created resource");
        self.emit(WatchEvent::added(resource.clone()));
        Ok(resource)
    }

    /// Request deletion. Repeated requests on a marked instance are no-ops.
    pub async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if current.finalizers().is_empty() {
            state.objects.remove(key);
            debug!(resource = %current.identifier(), "Removed resource");
            self.emit(WatchEvent::deleted(current.clone()));
            return Ok(DeleteOutcome::Removed(current));
        }

        if current.is_marked_for_deletion() {
            return Ok(DeleteOutcome::MarkedForDeletion(current));
        }

        let mut marked = current;
        marked.metadata.deletion_timestamp =
            Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        marked.metadata.resource_version = state.next_version();
        state.objects.insert(key.clone(), marked.clone());
        debug!(resource = %marked.identifier(), "Marked resource for deletion");
        self.emit(WatchEvent::modified(marked.clone()));
        Ok(DeleteOutcome::MarkedForDeletion(marked))
    }

    /// Snapshot of every stored instance, ordered by identity.
    pub async fn list(&self) -> Vec<ResourceInstance> {
        let state = self.state.read().await;
        state.objects.values().cloned().collect()
    }

    /// Apply a write on top of `current`, finishing a pending deletion if the
    /// last finalizer is gone.
    fn commit(
        &self,
        state: &mut State,
        current: &ResourceInstance,
        mut next: ResourceInstance,
    ) -> ResourceInstance {
        let key = current.key();
        next.kind = current.kind.clone();
        next.metadata.name = current.metadata.name.clone();
        next.metadata.namespace = current.metadata.namespace.clone();
        // Only delete() may set or clear the deletion timestamp.
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        next.metadata.resource_version = state.next_version();

        if next.is_marked_for_deletion() && next.finalizers().is_empty() {
            state.objects.remove(&key);
            debug!(resource = %next.identifier(), "Last finalizer removed, resource deleted");
            self.emit(WatchEvent::deleted(next.clone()));
        } else {
            state.objects.insert(key, next.clone());
            self.emit(WatchEvent::modified(next.clone()));
        }
        next
    }
}

#[async_trait]
impl ResourceFacade for MemoryStore {
    async fn patch(&self, resource: &ResourceInstance, scope: PatchScope) -> Result<ResourceInstance> {
        self.ensure_available()?;
        let key = resource.key();
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound(key))?;

        let next = match scope {
            PatchScope::Full => resource.clone(),
            PatchScope::Finalizers => {
                let mut merged = current.clone();
                merged.metadata.finalizers = resource.metadata.finalizers.clone();
                merged
            }
        };
        Ok(self.commit(&mut state, &current, next))
    }

    async fn replace_with_version_lock(&self, resource: &ResourceInstance) -> Result<ResourceInstance> {
        self.ensure_available()?;
        let key = resource.key();
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if current.resource_version() != resource.resource_version() {
            return Err(StoreError::VersionConflict {
                key,
                expected: resource.resource_version().to_string(),
                actual: current.resource_version().to_string(),
            });
        }
        Ok(self.commit(&mut state, &current, resource.clone()))
    }
}

#[async_trait]
impl ResourceLookup for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceInstance>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state.objects.get(key).cloned())
    }
}
