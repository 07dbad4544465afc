//! Dispatch observability.
//!
//! The dispatcher reports lifecycle events through an injected
//! [`DispatchObserver`] instead of a process-wide logger.

use std::sync::Arc;

use crate::model::{Action, ResourceInstance};
use crate::store::StoreError;

/// Receives lifecycle events from the dispatcher. All methods default to no-ops.
pub trait DispatchObserver: Send + Sync {
    fn event_received(&self, _action: Action, _resource: &ResourceInstance) {}

    /// An `Error` action was delivered and skipped.
    fn malformed_event(&self, _resource: &ResourceInstance) {}

    fn finalizer_added(&self, _resource: &ResourceInstance) {}

    fn finalizer_removed(&self, _resource: &ResourceInstance) {}

    /// Removal was attempted but the finalizer was already gone.
    fn finalizer_already_absent(&self, _resource: &ResourceInstance) {}

    fn resource_replaced(&self, _resource: &ResourceInstance) {}

    /// A write was abandoned because the resource vanished.
    fn write_dropped(&self, _resource: &ResourceInstance, _reason: &StoreError) {}
}

/// Observer that discards everything (for testing).
#[derive(Debug, Default)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}

/// Observer that logs lifecycle events under the `audit` tracing target.
pub struct TracingObserver {
    component: String,
}

impl TracingObserver {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }
}

impl DispatchObserver for TracingObserver {
    fn event_received(&self, action: Action, resource: &ResourceInstance) {
        tracing::debug!(target: "audit", component = %self.component, %action, resource = %resource.identifier(), "Event received");
    }

    fn malformed_event(&self, resource: &ResourceInstance) {
        tracing::warn!(target: "audit", component = %self.component, name = %resource.name(), "Malformed event skipped");
    }

    fn finalizer_added(&self, resource: &ResourceInstance) {
        tracing::info!(target: "audit", component = %self.component, resource = %resource.identifier(), "Finalizer added");
    }

    fn finalizer_removed(&self, resource: &ResourceInstance) {
        tracing::info!(target: "audit", component = %self.component, resource = %resource.identifier(), "Finalizer removed");
    }

    fn finalizer_already_absent(&self, resource: &ResourceInstance) {
        tracing::debug!(target: "audit", component = %self.component, resource = %resource.identifier(), "Finalizer already absent");
    }

    fn resource_replaced(&self, resource: &ResourceInstance) {
        tracing::info!(target: "audit", component = %self.component, resource = %resource.identifier(), "Resource replaced");
    }

    fn write_dropped(&self, resource: &ResourceInstance, reason: &StoreError) {
        tracing::info!(target: "audit", component = %self.component, resource = %resource.identifier(), %reason, "Write dropped");
    }
}

pub fn create_observer(component: &str) -> Arc<dyn DispatchObserver> {
    Arc::new(TracingObserver::new(component))
}
