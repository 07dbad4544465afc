//! Dispatcher integration tests against the in-memory store.
//!
//! These verify the single-write policy and the finalizer protocol end to end,
//! including how the store reacts to each write.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use opkit_core::{
    Action, DEFAULT_FINALIZER, DispatchError, DispatcherConfig, Disposition, EventDispatcher,
    MemoryStore, NoopObserver, PatchScope, ResourceFacade, ResourceInstance, ResourceLookup,
    StoreError,
};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use common::{StatusController, key, widget};

/// Counts writes on their way to the real store.
struct CountingFacade {
    inner: Arc<MemoryStore>,
    patches: AtomicUsize,
    replaces: AtomicUsize,
}

impl CountingFacade {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            patches: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
        }
    }

    fn writes(&self) -> (usize, usize) {
        (
            self.patches.load(Ordering::SeqCst),
            self.replaces.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl ResourceFacade for CountingFacade {
    async fn patch(
        &self,
        resource: &ResourceInstance,
        scope: PatchScope,
    ) -> opkit_core::store::Result<ResourceInstance> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        self.inner.patch(resource, scope).await
    }

    async fn replace_with_version_lock(
        &self,
        resource: &ResourceInstance,
    ) -> opkit_core::store::Result<ResourceInstance> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.inner.replace_with_version_lock(resource).await
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    facade: Arc<CountingFacade>,
    controller: Arc<StatusController>,
    dispatcher: EventDispatcher,
}

fn harness_with(patch_scope: PatchScope) -> Harness {
    let store = Arc::new(MemoryStore::new(64));
    let facade = Arc::new(CountingFacade::new(store.clone()));
    let controller = Arc::new(StatusController::default());
    let dispatcher = EventDispatcher::new(
        controller.clone(),
        facade.clone(),
        Arc::new(NoopObserver),
        DispatcherConfig {
            finalizer: DEFAULT_FINALIZER.to_string(),
            patch_scope,
        },
    );
    Harness {
        store,
        facade,
        controller,
        dispatcher,
    }
}

fn harness() -> Harness {
    harness_with(PatchScope::Full)
}

// =============================================================================
// Active path
// =============================================================================

#[tokio::test]
async fn test_added_resource_is_replaced_with_finalizer() {
    let h = harness();
    let mut created = h
        .store
        .create(widget("foo", 1).with_finalizers(Vec::<String>::new()))
        .await
        .unwrap();

    let result = h.dispatcher.handle(Action::Added, &mut created).await;
    let disposition = assert_ok!(result);
    assert!(matches!(disposition, Disposition::Replaced(_)));
    assert_eq!(h.facade.writes(), (0, 1));

    let stored = h.store.get(&key("foo")).await.unwrap().unwrap();
    assert_eq!(stored.finalizers(), [DEFAULT_FINALIZER.to_string()]);
    assert_eq!(stored.status, Some(StatusController::desired_status(&stored)));
    assert_ne!(stored.resource_version(), created.resource_version());
}

#[tokio::test]
async fn test_converged_resource_is_adopted_with_single_patch() {
    let h = harness();
    let mut r = widget("foo", 1);
    r.status = Some(StatusController::desired_status(&r));
    let mut created = h.store.create(r).await.unwrap();

    let disposition = h.dispatcher.handle(Action::Added, &mut created).await.unwrap();
    let Disposition::Adopted(stored) = disposition else {
        panic!("expected adoption, got {disposition:?}");
    };
    assert_eq!(h.facade.writes(), (1, 0));
    assert_eq!(stored.finalizers(), [DEFAULT_FINALIZER.to_string()]);
    assert_eq!(stored.spec, json!({"size": 1}));

    // Next observation is a no-op.
    let mut observed = stored;
    let disposition = h.dispatcher.handle(Action::Modified, &mut observed).await.unwrap();
    assert_eq!(disposition, Disposition::Unchanged);
    assert_eq!(h.facade.writes(), (1, 0));
}

#[tokio::test]
async fn test_stale_snapshot_conflict_surfaces() {
    let h = harness();
    let created = h.store.create(widget("foo", 1)).await.unwrap();

    // Someone else writes first.
    let mut concurrent = created.clone();
    concurrent.spec = json!({"size": 2});
    h.store.replace_with_version_lock(&concurrent).await.unwrap();

    let mut stale = created.clone();
    let err = assert_err!(h.dispatcher.handle(Action::Modified, &mut stale).await);
    assert!(matches!(
        err,
        DispatchError::VersionConflict {
            source: StoreError::VersionConflict { .. },
            ..
        }
    ));
    assert_eq!(h.facade.writes(), (0, 1));

    let stored = h.store.get(&key("foo")).await.unwrap().unwrap();
    assert_eq!(stored.spec, json!({"size": 2}));
    assert!(stored.status.is_none());
}

#[tokio::test]
async fn test_write_for_vanished_resource_is_dropped() {
    let h = harness();
    let mut ghost = widget("ghost", 1).with_resource_version("1");

    let disposition = h.dispatcher.handle(Action::Modified, &mut ghost).await.unwrap();
    assert_eq!(disposition, Disposition::Dropped);
    assert!(h.store.list().await.is_empty());
}

#[tokio::test]
async fn test_unavailable_store_surfaces() {
    let h = harness();
    let mut created = h.store.create(widget("foo", 1)).await.unwrap();
    h.store.set_available(false);

    let err = h.dispatcher.handle(Action::Added, &mut created).await.unwrap_err();
    assert!(matches!(err, DispatchError::StoreUnavailable { .. }));
}

// =============================================================================
// Deletion path
// =============================================================================

#[tokio::test]
async fn test_marked_resource_is_released_and_removed() {
    let h = harness();
    let created = h
        .store
        .create(widget("foo", 1).with_finalizers([DEFAULT_FINALIZER]))
        .await
        .unwrap();
    let opkit_core::DeleteOutcome::MarkedForDeletion(mut marked) =
        h.store.delete(&created.key()).await.unwrap()
    else {
        panic!("expected resource to be marked");
    };

    let disposition = h.dispatcher.handle(Action::Modified, &mut marked).await.unwrap();
    let Disposition::FinalizerRemoved(released) = disposition else {
        panic!("expected finalizer removal, got {disposition:?}");
    };
    assert_eq!(released.metadata.finalizers, Some(vec![]));
    assert_eq!(h.facade.writes(), (1, 0));
    assert_eq!(h.controller.deleted(), vec!["foo".to_string()]);

    // Last finalizer gone: the store completes the delete.
    assert!(h.store.get(&key("foo")).await.unwrap().is_none());

    // The DELETED event that follows still reaches the controller, no write.
    let disposition = h.dispatcher.handle(Action::Deleted, &mut marked).await.unwrap();
    assert_eq!(disposition, Disposition::Unchanged);
    assert_eq!(h.facade.writes(), (1, 0));
    assert_eq!(h.controller.deleted().len(), 2);
}

#[tokio::test]
async fn test_release_keeps_foreign_finalizers_pending() {
    let h = harness_with(PatchScope::Finalizers);
    let created = h
        .store
        .create(widget("foo", 1).with_finalizers(["other.finalizer", DEFAULT_FINALIZER]))
        .await
        .unwrap();
    let opkit_core::DeleteOutcome::MarkedForDeletion(mut marked) =
        h.store.delete(&created.key()).await.unwrap()
    else {
        panic!("expected resource to be marked");
    };

    h.dispatcher.handle(Action::Modified, &mut marked).await.unwrap();

    let stored = h.store.get(&key("foo")).await.unwrap().unwrap();
    assert!(stored.is_marked_for_deletion());
    assert_eq!(stored.finalizers(), ["other.finalizer".to_string()]);
}

#[tokio::test]
async fn test_release_on_vanished_resource_is_benign() {
    let h = harness();
    let mut marked = widget("foo", 1)
        .with_resource_version("3")
        .with_finalizers([DEFAULT_FINALIZER])
        .with_deletion_timestamp("2024-01-01T00:00:00Z");

    let disposition = h.dispatcher.handle(Action::Modified, &mut marked).await.unwrap();
    assert_eq!(disposition, Disposition::Dropped);
    assert_eq!(h.facade.writes(), (1, 0));
}
