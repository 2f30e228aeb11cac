//! Framework coordinator: the object callers talk to.
//!
//! A [`Framework`] owns one scheduler, one resource pool and one result
//! store, plus the registry and remote executor it was built with. There
//! is no global instance; create one per run and drop it when done.
//!
//! # Architecture
//!
//! ```text
//!   caller ── submit_experiment ──► Scheduler ◄──── finish ────┐
//!                                       │                      │
//!                                       │ try_dispatch         │
//!                                       ▼                      │
//!                         ResourcePool.allocate                │
//!                                       │                      │
//!                                       ▼                      │
//!                         worker ── registry.create ──► LifecycleController
//!                                                              │
//!                                        ResultStore ◄── save ─┘
//! ```
//!
//! `workers` tokio tasks pull from the scheduler. An idle worker sleeps
//! until the scheduler or the pool signals a change, or the poll interval
//! elapses (which also picks up tasks whose retry backoff expired).
//!
//! A background monitor probes servers every `health_check_interval_secs`
//! and applies result retention. Leases lost to an unreachable server abort
//! their runs with [`AbortReason::ServerLost`]; such attempts count as
//! failures and are retried if the task has retries left.
//!
//! # Example
//!
//! ```no_run
//! use labgrid::config::load_config;
//! use labgrid::framework::{ExperimentRequest, Framework};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("labgrid.toml"))?;
//!     let framework = Framework::from_config(config);
//!     framework.start()?;
//!
//!     let id = framework.submit_experiment(
//!         ExperimentRequest::new("shell", serde_json::json!({ "command": "nproc" }))
//!             .priority(5),
//!     )?;
//!     let task = framework.wait_for_experiment(&id, None).await?;
//!     println!("{} finished: {}", id, task.status);
//!
//!     framework.shutdown().await;
//!     Ok(())
//! }
//! ```

mod worker;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TaskId;
use crate::config::{Config, ExperimentConfig, ExportFormatConfig};
use crate::lifecycle::{AbortReason, LifecycleController};
use crate::pool::{ClusterSummary, HealthReport, ResourcePool, ResourceSample};
use crate::registry::{ExperimentRegistry, RegistryError};
use crate::remote::{self, RemoteExecutor};
use crate::results::{ExperimentResult, ExportFormat, ResultStore, StoreError};
use crate::scheduler::{
    CancelOutcome, RetryPolicy, Scheduler, SchedulerError, TaskCounts, TaskSnapshot, TaskSpec,
    TaskStatus,
};

/// Fallback period of the monitor when health probes are disabled.
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Framework is already running")]
    AlreadyStarted,

    #[error("Framework has been shut down")]
    ShutDown,
}

/// An experiment to submit. Unset fields fall back to the framework's
/// configured defaults.
#[derive(Debug, Clone)]
pub struct ExperimentRequest {
    pub id: Option<TaskId>,
    pub experiment_type: String,
    pub config: serde_json::Value,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
}

impl ExperimentRequest {
    pub fn new(experiment_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            id: None,
            experiment_type: experiment_type.into(),
            config,
            priority: 0,
            dependencies: Vec::new(),
            max_retries: None,
            timeout: None,
            tags: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task: impl Into<TaskId>) -> Self {
        self.dependencies.push(task.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

impl From<&ExperimentConfig> for ExperimentRequest {
    fn from(experiment: &ExperimentConfig) -> Self {
        Self {
            id: Some(experiment.name.clone()),
            experiment_type: experiment.experiment_type.clone(),
            config: experiment.params_json(),
            priority: experiment.priority,
            dependencies: experiment.depends_on.clone(),
            max_retries: experiment.max_retries,
            timeout: experiment.timeout_secs.map(Duration::from_secs),
            tags: experiment.tags.clone(),
        }
    }
}

impl From<ExportFormatConfig> for ExportFormat {
    fn from(format: ExportFormatConfig) -> Self {
        match format {
            ExportFormatConfig::Json => ExportFormat::Json,
            ExportFormatConfig::Csv => ExportFormat::Csv,
        }
    }
}

/// Snapshot returned by [`Framework::get_framework_status`].
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkStatus {
    pub running: bool,
    pub workers: usize,
    pub uptime_secs: f64,
    /// PENDING + READY tasks.
    pub queue_depth: usize,
    /// Whether new submissions are refused until the queue drains.
    pub queue_full: bool,
    pub cluster_load: f64,
    pub tasks: TaskCounts,
    /// Experiments with at least one stored result.
    pub stored_results: usize,
}

/// What a retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub result_versions: usize,
    pub tasks: usize,
}

/// State shared between the framework handle, its workers and its monitor.
pub(crate) struct Shared {
    pub config: Config,
    pub registry: ExperimentRegistry,
    pub executor: Arc<dyn RemoteExecutor>,
    pub scheduler: Scheduler,
    pub pool: ResourcePool,
    pub results: ResultStore,
    pub controller: LifecycleController,
    pub shutdown: CancellationToken,
}

impl Shared {
    pub async fn health_check(&self) -> HealthReport {
        let report = self.pool.health_check(self.executor.as_ref()).await;
        for lost in &report.lost {
            if self.scheduler.abort(&lost.task, AbortReason::ServerLost) {
                warn!(
                    "Task {} lost its lease on {}, aborting",
                    lost.task, lost.server
                );
            }
        }
        if !report.unreachable.is_empty() {
            debug!("Unreachable servers: {:?}", report.unreachable);
        }
        report
    }

    pub fn apply_retention(&self) -> RetentionReport {
        let cutoff = Utc::now() - self.config.labgrid.retention();
        RetentionReport {
            result_versions: self.results.cleanup(cutoff),
            tasks: self.scheduler.purge_finished(cutoff),
        }
    }
}

enum RunState {
    Idle,
    Running(JoinSet<()>),
    Stopped,
}

/// Coordinates the scheduler, the resource pool and the result store.
pub struct Framework {
    shared: Arc<Shared>,
    state: Mutex<RunState>,
    created_at: Instant,
}

impl Framework {
    pub fn new(
        config: Config,
        registry: ExperimentRegistry,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let scheduler = Scheduler::new(RetryPolicy::new(config.labgrid.backoff.clone()))
            .with_max_queue_size(config.labgrid.max_queue_size);
        let pool = ResourcePool::new(config.servers.clone(), config.allocation.clone())
            .with_resource_history(config.labgrid.resource_history());

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                executor,
                scheduler,
                pool,
                results: ResultStore::new(),
                controller: LifecycleController::new(),
                shutdown: CancellationToken::new(),
            }),
            state: Mutex::new(RunState::Idle),
            created_at: Instant::now(),
        }
    }

    /// Built-in experiment types and the executor selected by the config.
    pub fn from_config(config: Config) -> Self {
        let executor = remote::from_config(&config.executor);
        Self::new(config, ExperimentRegistry::with_builtin(), executor)
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the workers and the background monitor. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), FrameworkError> {
        let mut state = self.lock_state();
        match *state {
            RunState::Idle => {}
            RunState::Running(_) => return Err(FrameworkError::AlreadyStarted),
            RunState::Stopped => return Err(FrameworkError::ShutDown),
        }

        let workers = self.shared.config.labgrid.workers.max(1);
        let mut tasks = JoinSet::new();
        for index in 0..workers {
            tasks.spawn(worker::run(self.shared.clone(), index));
        }
        tasks.spawn(worker::monitor(self.shared.clone()));

        info!(
            "Started {} workers over {} servers ({})",
            workers,
            self.shared.config.servers.len(),
            crate::pool::strategy_name(self.shared.pool.strategy())
        );
        *state = RunState::Running(tasks);
        Ok(())
    }

    /// Stops the workers. Running experiments are cancelled and go through
    /// CLEANUP before this returns; queued tasks stay queued.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), RunState::Stopped);
        let RunState::Running(mut tasks) = previous else {
            return;
        };

        info!("Shutting down");
        self.shared.shutdown.cancel();
        let aborted = self.shared.scheduler.abort_all(AbortReason::Cancelled);
        if aborted > 0 {
            info!("Cancelling {} running experiments", aborted);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        debug!("All workers stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), RunState::Running(_))
    }

    /// Queues an experiment and returns its task id.
    ///
    /// # Errors
    ///
    /// Unknown experiment types and payloads the type's factory rejects are
    /// refused here, before anything is queued. Dependency errors come from
    /// the scheduler. After [`shutdown`](Self::shutdown) nothing is
    /// accepted.
    pub fn submit_experiment(&self, request: ExperimentRequest) -> Result<TaskId, FrameworkError> {
        if matches!(*self.lock_state(), RunState::Stopped) {
            return Err(FrameworkError::ShutDown);
        }
        self.shared
            .registry
            .create(&request.experiment_type, &request.config)?;

        let defaults = &self.shared.config.labgrid;
        let mut spec = TaskSpec::new(request.experiment_type, request.config)
            .priority(request.priority)
            .max_retries(request.max_retries.unwrap_or(defaults.default_max_retries))
            .timeout(request.timeout.unwrap_or_else(|| defaults.default_timeout()));
        spec.id = request.id;
        spec.dependencies = request.dependencies;
        spec.tags = request.tags;

        Ok(self.shared.scheduler.submit(spec)?)
    }

    pub fn cancel_experiment(&self, id: &str) -> Result<CancelOutcome, FrameworkError> {
        Ok(self.shared.scheduler.cancel(id)?)
    }

    /// Waits for the task to reach a terminal status. `None` waits
    /// indefinitely.
    pub async fn wait_for_experiment(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<TaskSnapshot, FrameworkError> {
        Ok(self.shared.scheduler.wait_for(id, timeout).await?)
    }

    pub fn get_experiment_status(&self, id: &str) -> Result<TaskSnapshot, FrameworkError> {
        self.shared
            .scheduler
            .snapshot(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()).into())
    }

    /// Newest stored result of the task (one version per attempt).
    pub fn get_experiment_result(&self, id: &str) -> Result<ExperimentResult, FrameworkError> {
        Ok(self.shared.results.get(id)?)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskSnapshot> {
        self.shared.scheduler.list(status)
    }

    pub fn get_cluster_summary(&self) -> ClusterSummary {
        self.shared.pool.summary()
    }

    /// Resource samples of `server` taken by health checks within the last
    /// `within`, oldest first. Empty for unknown servers.
    pub fn get_resource_history(
        &self,
        server: &str,
        within: chrono::Duration,
    ) -> Vec<ResourceSample> {
        self.shared.pool.resource_history(server, within)
    }

    /// Records progress for a running experiment. Experiments normally
    /// report through
    /// [`ExperimentContext::report_progress`](crate::lifecycle::ExperimentContext::report_progress).
    pub fn update_experiment_progress(&self, id: &str, progress: f64) -> bool {
        self.shared.scheduler.update_progress(id, progress)
    }

    pub fn get_framework_status(&self) -> FrameworkStatus {
        FrameworkStatus {
            running: self.is_running(),
            workers: self.shared.config.labgrid.workers,
            uptime_secs: self.created_at.elapsed().as_secs_f64(),
            queue_depth: self.shared.scheduler.queue_depth(),
            queue_full: self.shared.scheduler.is_queue_full(),
            cluster_load: self.shared.pool.cluster_load(),
            tasks: self.shared.scheduler.counts(),
            stored_results: self.shared.results.len(),
        }
    }

    /// Probes every server now. Runs on leases lost to unreachable servers
    /// are aborted and retried.
    pub async fn health_check(&self) -> HealthReport {
        self.shared.health_check().await
    }

    /// Drops result versions that ended more than `older_than` ago, keeping
    /// the newest version of each experiment.
    pub fn cleanup_results(&self, older_than: chrono::Duration) -> usize {
        self.shared.results.cleanup(Utc::now() - older_than)
    }

    /// Applies the configured retention to results and finished tasks.
    pub fn apply_retention(&self) -> RetentionReport {
        self.shared.apply_retention()
    }

    pub fn export_results(&self, format: ExportFormat) -> Result<String, FrameworkError> {
        Ok(self.shared.results.export(format)?)
    }

    /// Writes the export configured under `[results]`. Returns `false` if
    /// no export path is configured.
    pub fn export_configured(&self) -> Result<bool, FrameworkError> {
        let results = &self.shared.config.results;
        let Some(path) = &results.export_path else {
            return Ok(false);
        };
        self.shared
            .results
            .export_to(path, results.export_format.into())?;
        Ok(true)
    }

    /// The result store, for searches and comparisons.
    pub fn results(&self) -> &ResultStore {
        &self.shared.results
    }

    pub fn registry(&self) -> &ExperimentRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        // Workers hold their own Arc; stop them if shutdown was skipped.
        self.shared.shutdown.cancel();
        self.shared.scheduler.abort_all(AbortReason::Cancelled);
    }
}
