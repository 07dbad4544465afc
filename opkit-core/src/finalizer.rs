//! Finalizer bookkeeping on in-memory resources.
//!
//! None of these touch the store. The dispatcher decides whether a change
//! made here is worth persisting.

use crate::model::ResourceInstance;

/// Finalizer used when none is configured.
pub const DEFAULT_FINALIZER: &str = "default.finalizer";

/// Owns the finalizer string this controller is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerManager {
    finalizer: String,
}

impl Default for FinalizerManager {
    fn default() -> Self {
        Self::new(DEFAULT_FINALIZER)
    }
}

impl FinalizerManager {
    pub fn new(finalizer: impl Into<String>) -> Self {
        Self {
            finalizer: finalizer.into(),
        }
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    pub fn has_marker(&self, resource: &ResourceInstance) -> bool {
        resource
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|m| *m == self.finalizer))
    }

    /// Appends the finalizer unless already present, creating the list if unset.
    pub fn add_marker_if_absent(&self, resource: &mut ResourceInstance) {
        if self.has_marker(resource) {
            return;
        }
        resource
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(self.finalizer.clone());
    }

    /// Returns whether anything was removed.
    pub fn remove_marker(&self, resource: &mut ResourceInstance) -> bool {
        let Some(finalizers) = resource.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|m| *m != self.finalizer);
        finalizers.len() != before
    }

    /// The marker is missing and the resource is not on its way out.
    pub fn requires_marker(&self, resource: &ResourceInstance) -> bool {
        !self.has_marker(resource) && !resource.is_marked_for_deletion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> ResourceInstance {
        ResourceInstance::new("Widget", "default", "foo")
    }

    #[test]
    fn test_has_marker() {
        let fm = FinalizerManager::default();
        assert!(!fm.has_marker(&resource()));
        assert!(!fm.has_marker(&resource().with_finalizers(Vec::<String>::new())));
        assert!(!fm.has_marker(&resource().with_finalizers(["other.finalizer"])));
        assert!(fm.has_marker(&resource().with_finalizers(["other.finalizer", DEFAULT_FINALIZER])));
    }

    #[test]
    fn test_add_marker_initializes_unset_list() {
        let fm = FinalizerManager::default();
        let mut r = resource();
        assert!(r.metadata.finalizers.is_none());

        fm.add_marker_if_absent(&mut r);
        assert_eq!(r.metadata.finalizers, Some(vec![DEFAULT_FINALIZER.to_string()]));
    }

    #[test]
    fn test_add_marker_is_idempotent() {
        let fm = FinalizerManager::new("widgets.example.com/cleanup");
        let mut r = resource().with_finalizers(["other.finalizer"]);

        fm.add_marker_if_absent(&mut r);
        fm.add_marker_if_absent(&mut r);
        assert_eq!(
            r.finalizers(),
            ["other.finalizer".to_string(), "widgets.example.com/cleanup".to_string()]
        );
    }

    #[test]
    fn test_remove_marker_reports_removal() {
        let fm = FinalizerManager::default();
        let mut r = resource().with_finalizers([DEFAULT_FINALIZER, "other.finalizer"]);

        assert!(fm.remove_marker(&mut r));
        assert_eq!(r.finalizers(), ["other.finalizer".to_string()]);

        // Second removal finds nothing.
        assert!(!fm.remove_marker(&mut r));
        assert_eq!(r.finalizers(), ["other.finalizer".to_string()]);
    }

    #[test]
    fn test_remove_marker_on_unset_list() {
        let fm = FinalizerManager::default();
        let mut r = resource();
        assert!(!fm.remove_marker(&mut r));
        assert!(r.metadata.finalizers.is_none());
    }

    #[test]
    fn test_requires_marker() {
        let fm = FinalizerManager::default();
        assert!(fm.requires_marker(&resource()));
        assert!(!fm.requires_marker(&resource().with_finalizers([DEFAULT_FINALIZER])));
        assert!(!fm.requires_marker(&resource().with_deletion_timestamp("2024-01-01T00:00:00Z")));
    }
}
