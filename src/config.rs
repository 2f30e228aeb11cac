//! Configuration loading and schema definitions for labgrid.
//!
//! This module provides types and functions for loading labgrid configuration
//! from TOML files or strings. The configuration is read once at startup;
//! the rest of the crate only consumes the resulting in-memory structures.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads labgrid configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - The configuration fails [`validate_config`]
///
/// # Example
///
/// ```no_run
/// use labgrid::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("labgrid.toml"))?;
/// println!("Workers: {}", config.labgrid.workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate_config(&config)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads labgrid configuration from a TOML string.
///
/// # Example
///
/// ```
/// use labgrid::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [labgrid]
///     workers = 2
///
///     [[servers]]
///     name = "node-a"
///     host = "10.0.0.1"
///     max_concurrent_tasks = 3
/// "#)?;
///
/// assert_eq!(config.labgrid.workers, 2);
/// assert_eq!(config.servers[0].max_concurrent_tasks, 3);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Ten years.
const MAX_HISTORY_HOURS: u64 = 24 * 365 * 10;

/// Checks the structural rules serde cannot express.
///
/// Dependencies must name experiments of the same manifest. Cycles are not
/// checked here; the scheduler rejects them on submission.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.labgrid.workers == 0 {
        bail!("labgrid.workers must be at least 1");
    }
    if config.labgrid.resource_history_hours > MAX_HISTORY_HOURS {
        bail!(
            "labgrid.resource_history_hours must be at most {}, got {}",
            MAX_HISTORY_HOURS,
            config.labgrid.resource_history_hours
        );
    }

    let mut names = HashSet::new();
    for server in &config.servers {
        if server.name.is_empty() {
            bail!("server with host '{}' has an empty name", server.host);
        }
        if server.max_concurrent_tasks == 0 {
            bail!("server '{}' has max_concurrent_tasks = 0", server.name);
        }
        if !names.insert(server.name.as_str()) {
            bail!("duplicate server name '{}'", server.name);
        }
    }

    if let AllocationConfig::PriorityBased {
        reserved_fraction, ..
    } = &config.allocation
        && !(0.0..1.0).contains(reserved_fraction)
    {
        bail!(
            "allocation.reserved_fraction must be in [0, 1), got {}",
            reserved_fraction
        );
    }

    let mut experiments = HashSet::new();
    for experiment in &config.experiments {
        if !experiments.insert(experiment.name.as_str()) {
            bail!("duplicate experiment name '{}'", experiment.name);
        }
    }
    for experiment in &config.experiments {
        if let Some(missing) = experiment
            .depends_on
            .iter()
            .find(|dep| !experiments.contains(dep.as_str()))
        {
            bail!(
                "experiment '{}' depends on unknown experiment '{}'",
                experiment.name,
                missing
            );
        }
    }

    Ok(())
}
