//! Configuration for a store.

use mirra_protocol::SnapshotOptions;

/// Configuration for a store and the contexts nested in it.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Identifier of the root context.
    pub identifier: String,
    /// Options used for every live subscription.
    pub snapshot_options: SnapshotOptions,
    /// Destroy transfer tasks once they leave `storage.tasks`
    /// instead of keeping them alive for their holders.
    pub destroy_completed_tasks: bool,
}

impl StoreConfig {
    /// Creates a configuration with the given root identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            snapshot_options: SnapshotOptions::default(),
            destroy_completed_tasks: false,
        }
    }

    /// Requests snapshots for metadata-only changes.
    #[must_use]
    pub fn with_metadata_changes(mut self, include: bool) -> Self {
        self.snapshot_options.include_metadata_changes = include;
        self
    }

    /// Sets whether completed tasks are destroyed.
    #[must_use]
    pub fn with_destroy_completed_tasks(mut self, destroy: bool) -> Self {
        self.destroy_completed_tasks = destroy;
        self
    }

    /// Configuration of a nested context.
    pub(crate) fn nested(&self, identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            ..self.clone()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.identifier, "store");
        assert!(!config.snapshot_options.include_metadata_changes);
        assert!(!config.destroy_completed_tasks);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new("app")
            .with_metadata_changes(true)
            .with_destroy_completed_tasks(true);

        assert_eq!(config.identifier, "app");
        assert!(config.snapshot_options.include_metadata_changes);
        assert!(config.destroy_completed_tasks);
    }

    #[test]
    fn nested_inherits_options() {
        let config = StoreConfig::new("app").with_metadata_changes(true);
        let nested = config.nested("child");
        assert_eq!(nested.identifier, "child");
        assert!(nested.snapshot_options.include_metadata_changes);
    }
}
