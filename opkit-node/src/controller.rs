//! Sample controller: mirrors `spec` into `status` and reports `Ready`.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use opkit_core::{Controller, ResourceInstance};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Keeps `status` equal to `{"phase": "Ready", "observed": <spec>}`.
#[derive(Debug, Default)]
pub struct StatusController {
    updates: AtomicU64,
    cleanups: AtomicU64,
}

impl StatusController {
    pub fn new() -> Self {
        Self::default()
    }

    fn desired_status(resource: &ResourceInstance) -> Value {
        json!({
            "phase": "Ready",
            "observed": resource.spec,
        })
    }

    /// Bodies returned for the store to persist.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn cleanups(&self) -> u64 {
        self.cleanups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Controller for StatusController {
    async fn create_or_update(&self, resource: &ResourceInstance) -> Result<Option<ResourceInstance>> {
        let desired = Self::desired_status(resource);
        if resource.status.as_ref() == Some(&desired) {
            debug!(resource = %resource.identifier(), "Status up to date");
            return Ok(None);
        }

        let mut updated = resource.clone();
        updated.status = Some(desired);
        self.updates.fetch_add(1, Ordering::Relaxed);
        info!(resource = %resource.identifier(), "Status refreshed");
        Ok(Some(updated))
    }

    async fn delete(&self, resource: &ResourceInstance) -> Result<bool> {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        info!(resource = %resource.identifier(), "Cleanup complete");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> ResourceInstance {
        ResourceInstance::new("Widget", "default", "foo").with_spec(json!({"size": 2}))
    }

    #[tokio::test]
    async fn test_fresh_resource_gets_status() {
        let controller = StatusController::new();
        let updated = controller.create_or_update(&widget()).await.unwrap().unwrap();
        assert_eq!(
            updated.status,
            Some(json!({"phase": "Ready", "observed": {"size": 2}}))
        );
        assert_eq!(controller.updates(), 1);
    }

    #[tokio::test]
    async fn test_converged_resource_needs_no_write() {
        let controller = StatusController::new();
        let mut resource = widget();
        resource.status = Some(json!({"phase": "Ready", "observed": {"size": 2}}));
        assert!(controller.create_or_update(&resource).await.unwrap().is_none());
        assert_eq!(controller.updates(), 0);
    }

    #[tokio::test]
    async fn test_spec_change_refreshes_status() {
        let controller = StatusController::new();
        let mut resource = widget();
        resource.status = Some(json!({"phase": "Ready", "observed": {"size": 1}}));
        let updated = controller.create_or_update(&resource).await.unwrap().unwrap();
        assert_eq!(updated.status.unwrap()["observed"], json!({"size": 2}));
    }

    #[tokio::test]
    async fn test_delete_always_completes() {
        let controller = StatusController::new();
        assert!(controller.delete(&widget()).await.unwrap());
        assert_eq!(controller.cleanups(), 1);
    }
}
