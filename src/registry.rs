//! Experiment type registry.
//!
//! Maps a type name to a factory that builds an [`Experiment`] from a task's
//! configuration payload. The registry is filled before the framework
//! starts and read concurrently by every worker afterwards.
//!
//! # Example
//!
//! ```
//! use labgrid::registry::{ExperimentMetadata, ExperimentRegistry};
//! use labgrid::lifecycle::shell::ShellExperiment;
//!
//! let mut registry = ExperimentRegistry::new();
//! registry.register(
//!     "bench",
//!     |config| Ok(Box::new(ShellExperiment::from_config(config)?) as _),
//!     ExperimentMetadata::new("Runs the benchmark suite").tag("perf"),
//! );
//!
//! assert!(registry.contains("bench"));
//! assert_eq!(registry.metadata("bench").unwrap().tags, vec!["perf"]);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::lifecycle::Experiment;
use crate::lifecycle::shell::{SHELL_EXPERIMENT, ShellExperiment};

/// Builds an experiment instance from its configuration payload.
pub type ExperimentFactory =
    Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<Box<dyn Experiment>> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExperimentMetadata {
    pub description: String,
    pub tags: Vec<String>,
}

impl ExperimentMetadata {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown experiment type '{0}'")]
    UnknownType(String),

    #[error("Failed to create experiment of type '{experiment_type}': {source:#}")]
    CreateFailed {
        experiment_type: String,
        source: anyhow::Error,
    },
}

struct Entry {
    factory: ExperimentFactory,
    metadata: ExperimentMetadata,
}

/// Registered experiment types, keyed by name.
#[derive(Default)]
pub struct ExperimentRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ExperimentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `shell` type.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            SHELL_EXPERIMENT,
            |config| Ok(Box::new(ShellExperiment::from_config(config)?) as Box<dyn Experiment>),
            ExperimentMetadata::new("Runs configured shell commands on the allocated server")
                .tag("builtin"),
        );
        registry
    }

    /// Registers (or replaces) a type.
    pub fn register<F>(
        &mut self,
        experiment_type: impl Into<String>,
        factory: F,
        metadata: ExperimentMetadata,
    ) where
        F: Fn(&serde_json::Value) -> anyhow::Result<Box<dyn Experiment>> + Send + Sync + 'static,
    {
        let experiment_type = experiment_type.into();
        debug!("Registered experiment type '{}'", experiment_type);
        self.entries.insert(
            experiment_type,
            Entry {
                factory: Arc::new(factory),
                metadata,
            },
        );
    }

    pub fn resolve(&self, experiment_type: &str) -> Result<ExperimentFactory, RegistryError> {
        self.entries
            .get(experiment_type)
            .map(|entry| entry.factory.clone())
            .ok_or_else(|| RegistryError::UnknownType(experiment_type.to_string()))
    }

    /// Builds a fresh instance for one run.
    pub fn create(
        &self,
        experiment_type: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Experiment>, RegistryError> {
        let factory = self.resolve(experiment_type)?;
        factory(config).map_err(|source| RegistryError::CreateFailed {
            experiment_type: experiment_type.to_string(),
            source,
        })
    }

    pub fn contains(&self, experiment_type: &str) -> bool {
        self.entries.contains_key(experiment_type)
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn metadata(&self, experiment_type: &str) -> Option<&ExperimentMetadata> {
        self.entries.get(experiment_type).map(|e| &e.metadata)
    }
}

impl std::fmt::Debug for ExperimentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRegistry")
            .field("types", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_shell() {
        let registry = ExperimentRegistry::with_builtin();
        assert_eq!(registry.list(), vec!["shell".to_string()]);
        assert!(registry.metadata("shell").unwrap().tags.contains(&"builtin".to_string()));

        let ok = registry.create("shell", &serde_json::json!({"command": "true"}));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let registry = ExperimentRegistry::with_builtin();
        assert!(matches!(
            registry.create("nope", &serde_json::Value::Null),
            Err(RegistryError::UnknownType(t)) if t == "nope"
        ));
        assert!(registry.metadata("nope").is_none());
    }

    #[test]
    fn test_bad_config_reports_type() {
        let registry = ExperimentRegistry::with_builtin();
        let err = registry
            .create("shell", &serde_json::json!({"setup": []}))
            .err()
            .unwrap();
        assert!(err.to_string().contains("'shell'"));
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ExperimentRegistry::new();
        registry.register(
            "x",
            |_| anyhow::bail!("first"),
            ExperimentMetadata::new("first"),
        );
        registry.register(
            "x",
            |_| anyhow::bail!("second"),
            ExperimentMetadata::new("second"),
        );

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.metadata("x").unwrap().description, "second");
    }
}
