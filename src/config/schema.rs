//! Configuration schema definitions for labgrid.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for serialization and
//! tagged enums for executor/allocation/backoff selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── LabgridConfig          - Framework tunables (workers, timeouts, retention)
//! │   └── BackoffConfig      - Tagged enum selecting the retry backoff
//! │       ├── Fixed
//! │       └── Exponential
//! ├── AllocationConfig       - Tagged enum selecting the placement strategy
//! │   ├── RoundRobin
//! │   ├── LeastLoaded
//! │   └── PriorityBased
//! ├── ExecutorConfig         - Tagged enum selecting the remote transport
//! │   ├── Ssh
//! │   └── Local
//! ├── Vec<ServerConfig>      - The server pool
//! ├── ResultsConfig          - Export settings
//! └── Vec<ExperimentConfig>  - Experiment manifest used by `labgrid run`
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for labgrid.
///
/// # TOML Structure
///
/// ```toml
/// [labgrid]
/// workers = 4
/// default_timeout_secs = 3600
///
/// [allocation]
/// strategy = "least_loaded"
///
/// [executor]
/// type = "ssh"
///
/// [[servers]]
/// name = "gpu-1"
/// host = "10.0.0.11"
/// user = "lab"
/// max_concurrent_tasks = 2
///
/// [[experiments]]
/// name = "baseline"
/// type = "shell"
/// params = { command = "python train.py" }
/// ```
///
/// # Example
///
/// ```
/// use labgrid::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [[servers]]
///     name = "local-1"
///     host = "localhost"
/// "#).unwrap();
/// assert_eq!(config.servers.len(), 1);
/// assert_eq!(config.labgrid.workers, 4);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core framework settings (workers, timeouts, retries, retention).
    #[serde(default)]
    pub labgrid: LabgridConfig,

    /// Server placement strategy.
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Remote execution transport.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// The server pool.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Result export settings.
    #[serde(default)]
    pub results: ResultsConfig,

    /// Experiments submitted by `labgrid run`.
    #[serde(default)]
    pub experiments: Vec<ExperimentConfig>,
}

/// Core framework settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `workers` | 4 |
/// | `default_timeout_secs` | 3600 (1 hour) |
/// | `default_max_retries` | 0 |
/// | `result_retention_days` | 30 |
/// | `poll_interval_ms` | 1000 |
/// | `health_check_interval_secs` | 60 |
/// | `max_queue_size` | 1000 |
/// | `resource_history_hours` | 24 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabgridConfig {
    /// Number of worker tasks pulling from the scheduler.
    ///
    /// Default: 4
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-attempt timeout applied when an experiment does not set one.
    ///
    /// Default: 3600 (1 hour)
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// Retry budget applied when an experiment does not set one.
    #[serde(default)]
    pub default_max_retries: u32,

    /// Result versions older than this are dropped by the retention pass.
    /// The newest version of each experiment is always kept.
    ///
    /// Default: 30
    #[serde(default = "default_retention_days")]
    pub result_retention_days: u64,

    /// How often idle workers re-check the queue without being notified.
    ///
    /// Default: 1000
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Interval between server health probes. Set to 0 to disable the
    /// background monitor (health checks can still be run on demand).
    ///
    /// Default: 60
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Submissions are refused while this many tasks are waiting to run.
    /// 0 removes the bound.
    ///
    /// Default: 1000
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long per-server resource samples from health checks are kept.
    ///
    /// Default: 24
    #[serde(default = "default_resource_history_hours")]
    pub resource_history_hours: u64,

    /// Delay applied between a failed attempt and its retry.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for LabgridConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_timeout_secs: default_timeout(),
            default_max_retries: 0,
            result_retention_days: default_retention_days(),
            poll_interval_ms: default_poll_interval(),
            health_check_interval_secs: default_health_interval(),
            max_queue_size: default_max_queue_size(),
            resource_history_hours: default_resource_history_hours(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl LabgridConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Returns `None` when the background monitor is disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.result_retention_days as i64)
    }

    pub fn resource_history(&self) -> chrono::Duration {
        chrono::Duration::hours(self.resource_history_hours as i64)
    }
}

fn default_workers() -> usize {
    4
}

fn default_timeout() -> u64 {
    3600 // 1 hour
}

fn default_retention_days() -> u64 {
    30
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_resource_history_hours() -> u64 {
    24
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_health_interval() -> u64 {
    60
}

/// Retry backoff selection.
///
/// ```toml
/// [labgrid.backoff]
/// type = "exponential"
/// base_ms = 1000
/// max_ms = 60000
/// jitter = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffConfig {
    /// The same delay before every retry.
    Fixed {
        #[serde(default = "default_backoff_base")]
        delay_ms: u64,
    },

    /// `base_ms * 2^(retry - 1)`, capped at `max_ms`, optionally jittered
    /// by up to +25%.
    Exponential {
        #[serde(default = "default_backoff_base")]
        base_ms: u64,
        #[serde(default = "default_backoff_max")]
        max_ms: u64,
        #[serde(default = "default_true")]
        jitter: bool,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            base_ms: default_backoff_base(),
            max_ms: default_backoff_max(),
            jitter: true,
        }
    }
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

/// Server placement strategy.
///
/// | Strategy | Behavior |
/// |----------|----------|
/// | `round_robin` | Cycle through servers in name order |
/// | `least_loaded` | Lowest `current / max` ratio, ties by name |
/// | `priority_based` | Reserve part of each server for high-priority tasks |
///
/// ```toml
/// [allocation]
/// strategy = "priority_based"
/// reserved_fraction = 0.25
/// priority_threshold = 5
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AllocationConfig {
    RoundRobin,
    LeastLoaded,
    PriorityBased {
        /// Fraction of each server's capacity held back for tasks whose
        /// priority exceeds `priority_threshold`.
        #[serde(default = "default_reserved_fraction")]
        reserved_fraction: f64,

        #[serde(default = "default_priority_threshold")]
        priority_threshold: i32,
    },
}

impl Default for AllocationConfig {
    fn default() -> Self {
        AllocationConfig::LeastLoaded
    }
}

fn default_reserved_fraction() -> f64 {
    0.25
}

fn default_priority_threshold() -> i32 {
    5
}

/// Remote execution transport.
///
/// ```toml
/// # Commands run over the system ssh/scp binaries
/// [executor]
/// type = "ssh"
/// connect_timeout_secs = 30
///
/// # Commands run as local processes under root_dir/<server>
/// [executor]
/// type = "local"
/// root_dir = "/tmp/labgrid"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorConfig {
    Ssh(SshExecutorConfig),
    Local(LocalExecutorConfig),
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig::Ssh(SshExecutorConfig::default())
    }
}

/// Settings shared by every SSH connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshExecutorConfig {
    /// Passed to ssh as `ConnectTimeout`.
    ///
    /// Default: 30
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SshExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

/// Settings for the local process executor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalExecutorConfig {
    /// Each server gets its own directory below this root.
    ///
    /// Default: `<system temp dir>/labgrid`
    #[serde(default = "default_local_root")]
    pub root_dir: PathBuf,

    /// Shell used to run commands (`{shell} -c "{command}"`).
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            root_dir: default_local_root(),
            shell: default_shell(),
        }
    }
}

fn default_local_root() -> PathBuf {
    std::env::temp_dir().join("labgrid")
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// One machine of the server pool.
///
/// # Example
///
/// ```toml
/// [[servers]]
/// name = "gpu-1"
/// host = "10.0.0.11"
/// user = "lab"
/// port = 22
/// key_path = "~/.ssh/id_ed25519"
/// max_concurrent_tasks = 2
/// description = "A100 box"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique name used for placement, logging and results.
    pub name: String,

    /// Hostname or address.
    pub host: String,

    /// Login user. Empty means the ssh default.
    #[serde(default)]
    pub user: String,

    /// Default: 22
    #[serde(default = "default_port")]
    pub port: u16,

    /// Private key, `~` is expanded.
    pub key_path: Option<PathBuf>,

    /// Skip host key verification. Only for throwaway lab machines.
    #[serde(default)]
    pub disable_host_key_check: bool,

    /// Maximum number of experiments running on this server at once.
    ///
    /// Default: 1
    #[serde(default = "default_capacity")]
    pub max_concurrent_tasks: usize,

    pub description: Option<String>,
}

impl ServerConfig {
    /// Creates a server entry with default connection settings.
    ///
    /// # Example
    ///
    /// ```
    /// use labgrid::config::ServerConfig;
    ///
    /// let server = ServerConfig::new("gpu-1", "10.0.0.11").with_capacity(2);
    /// assert_eq!(server.max_concurrent_tasks, 2);
    /// assert_eq!(server.port, 22);
    /// ```
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: String::new(),
            port: default_port(),
            key_path: None,
            disable_host_key_check: false,
            max_concurrent_tasks: default_capacity(),
            description: None,
        }
    }

    pub fn with_capacity(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// `user@host`, or just `host` when no user is configured.
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_capacity() -> usize {
    1
}

/// Result export settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResultsConfig {
    /// Where `labgrid run` writes the result export. Skipped if unset.
    pub export_path: Option<PathBuf>,

    /// Default: json
    #[serde(default)]
    pub export_format: ExportFormatConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormatConfig {
    #[default]
    Json,
    Csv,
}

/// One experiment of the manifest run by `labgrid run`.
///
/// The name doubles as the task identifier, so `depends_on` refers to other
/// experiment names.
///
/// ```toml
/// [[experiments]]
/// name = "train"
/// type = "shell"
/// priority = 10
/// max_retries = 2
/// timeout_secs = 7200
/// tags = ["resnet"]
///
/// [experiments.params]
/// command = "python train.py --epochs 10"
///
/// [[experiments]]
/// name = "evaluate"
/// type = "shell"
/// depends_on = ["train"]
/// params = { command = "python eval.py" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    pub name: String,

    /// Registered experiment type.
    #[serde(rename = "type")]
    pub experiment_type: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Falls back to `labgrid.default_max_retries`.
    pub max_retries: Option<u32>,

    /// Falls back to `labgrid.default_timeout_secs`.
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Passed to the experiment type untouched.
    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,
}

impl ExperimentConfig {
    /// Converts the TOML parameter table into the JSON payload handed to the
    /// experiment factory.
    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }
}
