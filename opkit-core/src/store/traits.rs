//! Store trait definitions.
//!
//! These traits abstract away the store transport, allowing the dispatcher
//! and event loop to work with resource snapshots only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{ResourceInstance, ResourceKey};

use super::error::Result;

/// How much of the resource body an unconditional patch writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchScope {
    /// Whole body. Can clobber unrelated concurrent changes.
    #[default]
    Full,
    /// Only the finalizer list is merged into the store's current copy.
    Finalizers,
}

/// Writes the dispatcher may perform, scoped by namespace and name.
#[async_trait]
pub trait ResourceFacade: Send + Sync {
    /// Unconditional update. Never fails on a stale `resource_version`.
    async fn patch(&self, resource: &ResourceInstance, scope: PatchScope) -> Result<ResourceInstance>;

    /// Full update that only succeeds if `resource_version` matches the store.
    async fn replace_with_version_lock(&self, resource: &ResourceInstance) -> Result<ResourceInstance>;
}

/// Point reads used to re-observe an identity.
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceInstance>>;
}
