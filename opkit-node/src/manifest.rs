//! Manifest loading - a JSON array of resources used to seed the store.

use std::path::Path;

use anyhow::{Context, Result};
use opkit_core::ResourceInstance;
use tracing::{debug, warn};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Read `path` and keep the resources of `kind`.
///
/// Entries without a `kind` take the given one, entries without a namespace
/// land in `default`. Entries of another kind are
/// skipped with a warning.
pub async fn load(path: &Path, kind: &str) -> Result<Vec<ResourceInstance>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    parse(&raw, kind).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn parse(raw: &str, kind: &str) -> Result<Vec<ResourceInstance>> {
    let entries: Vec<ResourceInstance> =
        serde_json::from_str(raw).context("Expected a JSON array of resources")?;

    let mut resources = Vec::with_capacity(entries.len());
    for mut resource in entries {
        if resource.kind.is_empty() {
            resource.kind = kind.to_string();
        }
        if resource.metadata.namespace.is_empty() {
            resource.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if resource.kind != kind {
            warn!(resource = %resource.identifier(), expected = kind, "Skipping resource of another kind");
            continue;
        }
        if resource.name().is_empty() {
            anyhow::bail!("Resource without a name in namespace '{}'", resource.namespace());
        }
        debug!(resource = %resource.identifier(), "Loaded resource");
        resources.push(resource);
    }
    Ok(resources)
}
