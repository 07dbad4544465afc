//! Reconciliation capability for a single resource kind.
//!
//! A controller computes desired state for live instances and performs
//! cleanup for instances that are going away. It never writes to the store
//! itself; the dispatcher persists whatever it returns.

use anyhow::Result;
use async_trait::async_trait;

use crate::model::ResourceInstance;

/// Trait implemented once per resource kind.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Reconcile a live instance.
    ///
    /// Returns the body to write back, or `None` when nothing needs persisting
    /// this cycle.
    async fn create_or_update(&self, resource: &ResourceInstance) -> Result<Option<ResourceInstance>>;

    /// Clean up after an instance that is marked for deletion or already gone.
    ///
    /// Returns `true` once cleanup is complete and the finalizer may be
    /// released. Called again on every redelivery, so it must be idempotent.
    async fn delete(&self, resource: &ResourceInstance) -> Result<bool>;
}
