//! Event dispatcher - routes one watch event to the controller and keeps the
//! finalizer in step with the outcome.
//!
//! Every call makes at most one store write: a patch (finalizer added on
//! adoption, or removed after cleanup) or a version-locked replace of the
//! body returned by the controller. Never both.
//!
//! Callers must serialize calls per resource identity. Calls for different
//! identities may run concurrently.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::audit::DispatchObserver;
use crate::controller::Controller;
use crate::finalizer::{DEFAULT_FINALIZER, FinalizerManager};
use crate::model::{Action, ResourceInstance, ResourceKey};
use crate::store::{PatchScope, ResourceFacade, StoreError};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Finalizer this controller owns.
    pub finalizer: String,
    /// What finalizer-only patches write.
    pub patch_scope: PatchScope,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            finalizer: DEFAULT_FINALIZER.to_string(),
            patch_scope: PatchScope::default(),
        }
    }
}

/// What a successful `handle` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// `Error` action, nothing done.
    Ignored,
    /// No write was needed.
    Unchanged,
    /// Controller output persisted with a version-locked replace.
    Replaced(ResourceInstance),
    /// Finalizer added to an unmarked resource with a patch.
    Adopted(ResourceInstance),
    /// Cleanup finished and the finalizer was released with a patch.
    FinalizerRemoved(ResourceInstance),
    /// The resource vanished before the write landed.
    Dropped,
}

/// Failures surfaced to the event loop for requeue.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The store moved on; re-observe and recompute.
    #[error("version conflict on {key}: {source}")]
    VersionConflict {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    /// Transient store failure; retry later.
    #[error("store unavailable for {key}: {source}")]
    StoreUnavailable {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    /// The controller itself failed.
    #[error("controller failed for {key}: {source}")]
    Controller {
        key: ResourceKey,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    pub fn key(&self) -> &ResourceKey {
        match self {
            DispatchError::VersionConflict { key, .. }
            | DispatchError::StoreUnavailable { key, .. }
            | DispatchError::Controller { key, .. } => key,
        }
    }

    /// Retrying needs a fresh snapshot rather than the same one.
    pub fn needs_reobserve(&self) -> bool {
        matches!(self, DispatchError::VersionConflict { .. })
    }
}

/// Dispatches events to the controller and handles finalizers for one resource kind.
pub struct EventDispatcher {
    controller: Arc<dyn Controller>,
    store: Arc<dyn ResourceFacade>,
    observer: Arc<dyn DispatchObserver>,
    finalizers: FinalizerManager,
    patch_scope: PatchScope,
}

impl EventDispatcher {
    pub fn new(
        controller: Arc<dyn Controller>,
        store: Arc<dyn ResourceFacade>,
        observer: Arc<dyn DispatchObserver>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            controller,
            store,
            observer,
            finalizers: FinalizerManager::new(config.finalizer),
            patch_scope: config.patch_scope,
        }
    }

    pub fn finalizer(&self) -> &str {
        self.finalizers.finalizer()
    }

    /// Handle a single event for one resource.
    ///
    /// Finalizer changes are applied to `resource` in place before they are
    /// written, so a caller redelivering the same snapshot sees them. If an
    /// error is returned the snapshot may hold changes that never reached the
    /// store; retry from a fresh copy.
    pub async fn handle(
        &self,
        action: Action,
        resource: &mut ResourceInstance,
    ) -> Result<Disposition, DispatchError> {
        info!(%action, resource = %resource.identifier(), "Handling event");
        self.observer.event_received(action, resource);

        if action == Action::Error {
            // Nothing trustworthy to act on; the source redelivers a real event later.
            error!(name = %resource.name(), "Received error for resource");
            self.observer.malformed_event(resource);
            return Ok(Disposition::Ignored);
        }

        // Delete runs on every delete intent, even if our finalizer is already
        // gone: it may never have been added, and other finalizers can keep
        // the resource around after we released ours.
        if resource.is_marked_for_deletion() || action == Action::Deleted {
            self.handle_delete(resource).await
        } else {
            self.handle_create_or_update(resource).await
        }
    }

    async fn handle_delete(&self, resource: &mut ResourceInstance) -> Result<Disposition, DispatchError> {
        let release = self
            .controller
            .delete(resource)
            .await
            .map_err(|source| DispatchError::Controller {
                key: resource.key(),
                source,
            })?;

        if !release {
            debug!(resource = %resource.identifier(), "Cleanup not complete, keeping finalizer");
            return Ok(Disposition::Unchanged);
        }

        // Redelivered delete intents usually find the finalizer already gone.
        if !self.finalizers.remove_marker(resource) {
            debug!(
                resource = %resource.identifier(),
                "Attempt to remove finalizer, but was not found on resource"
            );
            self.observer.finalizer_already_absent(resource);
            return Ok(Disposition::Unchanged);
        }
        debug!(resource = %resource.identifier(), "Removing finalizer");

        Ok(match self.patch(resource).await? {
            Some(stored) => {
                self.observer.finalizer_removed(&stored);
                Disposition::FinalizerRemoved(stored)
            }
            None => Disposition::Dropped,
        })
    }

    async fn handle_create_or_update(
        &self,
        resource: &mut ResourceInstance,
    ) -> Result<Disposition, DispatchError> {
        let updated = self
            .controller
            .create_or_update(resource)
            .await
            .map_err(|source| DispatchError::Controller {
                key: resource.key(),
                source,
            })?;

        match updated {
            Some(mut updated) => {
                debug!(
                    resource = %resource.identifier(),
                    version = %resource.resource_version(),
                    "Updating resource"
                );
                trace!(before = ?resource, "Resource before update");
                let added = self.finalizers.requires_marker(&updated);
                if added {
                    info!(resource = %updated.identifier(), "Adding default finalizer");
                    self.finalizers.add_marker_if_absent(&mut updated);
                }

                Ok(match self.replace(&updated).await? {
                    Some(stored) => {
                        trace!(after = ?stored, "Resource after update");
                        if added {
                            self.observer.finalizer_added(&stored);
                        }
                        self.observer.resource_replaced(&stored);
                        Disposition::Replaced(stored)
                    }
                    None => Disposition::Dropped,
                })
            }
            None if self.finalizers.requires_marker(resource) => {
                // Seen without our finalizer and nothing else to write: adopt it.
                debug!(resource = %resource.identifier(), "Adding finalizer (patch)");
                self.finalizers.add_marker_if_absent(resource);

                Ok(match self.patch(resource).await? {
                    Some(stored) => {
                        self.observer.finalizer_added(&stored);
                        Disposition::Adopted(stored)
                    }
                    None => Disposition::Dropped,
                })
            }
            None => Ok(Disposition::Unchanged),
        }
    }

    async fn patch(&self, resource: &ResourceInstance) -> Result<Option<ResourceInstance>, DispatchError> {
        let result = self.store.patch(resource, self.patch_scope).await;
        self.settle(resource, result)
    }

    async fn replace(&self, resource: &ResourceInstance) -> Result<Option<ResourceInstance>, DispatchError> {
        debug!(resource = %resource.identifier(), "Trying to replace resource");
        let result = self.store.replace_with_version_lock(resource).await;
        self.settle(resource, result)
    }

    /// Map a store result onto the dispatch error policy. `Ok(None)` means the
    /// write was dropped because the resource is gone.
    fn settle(
        &self,
        resource: &ResourceInstance,
        result: Result<ResourceInstance, StoreError>,
    ) -> Result<Option<ResourceInstance>, DispatchError> {
        match result {
            Ok(stored) => Ok(Some(stored)),
            Err(err @ StoreError::NotFound(_)) => {
                info!(resource = %resource.identifier(), "Resource no longer exists, dropping write");
                self.observer.write_dropped(resource, &err);
                Ok(None)
            }
            // Both mean the store's copy is not what this snapshot assumed.
            Err(source @ (StoreError::VersionConflict { .. } | StoreError::AlreadyExists(_))) => {
                warn!(resource = %resource.identifier(), error = %source, "Write rejected, requeue needed");
                Err(DispatchError::VersionConflict {
                    key: resource.key(),
                    source,
                })
            }
            Err(source @ StoreError::Unavailable(_)) => {
                warn!(resource = %resource.identifier(), error = %source, "Store unavailable");
                Err(DispatchError::StoreUnavailable {
                    key: resource.key(),
                    source,
                })
            }
        }
    }
}
