//! Experiment lifecycle: the fixed stage sequence every run goes through.
//!
//! An experiment type implements [`Experiment`]; the [`LifecycleController`]
//! drives one instance through its stages on an allocated server and
//! produces a [`LifecycleReport`].
//!
//! # Stages
//!
//! ```text
//!   INIT ──► EXECUTING ──► COLLECTING ──► ANALYZING ──► SAVING
//!    │           │              │              │           │
//!    └───────────┴──────┬───────┴──────────────┴───────────┘
//!                       │ (any stage, on success or failure)
//!                       ▼
//!                    CLEANUP ──► COMPLETED | FAILED
//! ```
//!
//! | From | Success | Failure or abort |
//! |------|---------|------------------|
//! | INIT | EXECUTING | CLEANUP, then FAILED |
//! | EXECUTING | COLLECTING | CLEANUP, then FAILED |
//! | COLLECTING | ANALYZING | CLEANUP, then FAILED |
//! | ANALYZING | SAVING | CLEANUP, then FAILED |
//! | SAVING | CLEANUP, then COMPLETED | CLEANUP, then FAILED |
//!
//! CLEANUP runs exactly once per run. A cleanup failure is logged and
//! recorded in the report but never changes the outcome.
//!
//! # Aborting
//!
//! Cancellation, timeouts and lost servers all arrive through the run's
//! [`AbortHandle`]. The controller checks it at every stage boundary and
//! races the running hook against it, so an in-flight remote command is
//! dropped (and killed by the executor) as soon as the handle fires.
//! Once CLEANUP starts the handle is ignored: cleanup commands always run,
//! bounded only by the controller's cleanup timeout.

pub mod shell;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TaskId;
use crate::config::ServerConfig;
use crate::remote::{Command, ExecResult, RemoteError, RemoteExecutor};
use crate::results::MetricValue;

/// Metrics produced by [`Experiment::analyze_data`].
pub type Metrics = BTreeMap<String, MetricValue>;

/// Receives the progress a hook reports through
/// [`ExperimentContext::report_progress`].
pub type ProgressSink = Box<dyn Fn(f64) + Send + Sync>;

/// A lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    Executing,
    Collecting,
    Analyzing,
    Saving,
    Cleanup,
    Completed,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "INIT",
            Stage::Executing => "EXECUTING",
            Stage::Collecting => "COLLECTING",
            Stage::Analyzing => "ANALYZING",
            Stage::Saving => "SAVING",
            Stage::Cleanup => "CLEANUP",
            Stage::Completed => "COMPLETED",
            Stage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    TimedOut,
    /// The run's server became unreachable.
    ServerLost,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::Cancelled => "cancelled",
            AbortReason::TimedOut => "timed out",
            AbortReason::ServerLost => "server lost",
        };
        f.write_str(s)
    }
}

/// Cooperative abort signal shared between a run and whoever may stop it.
///
/// The first reason wins; later calls to [`abort`](Self::abort) are ignored.
///
/// ```
/// use labgrid::lifecycle::{AbortHandle, AbortReason};
///
/// let handle = AbortHandle::new();
/// assert!(handle.abort(AbortReason::TimedOut));
/// assert!(!handle.abort(AbortReason::Cancelled));
/// assert_eq!(handle.reason(), Some(AbortReason::TimedOut));
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the run to stop. Returns `false` if it was already aborted.
    pub fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle fires.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }
}

/// Error returned by experiment hooks.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A remote command ran but exited non-zero.
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Aborted: {0}")]
    Aborted(AbortReason),

    #[error("Hook panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a run did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleError {
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: Stage, message: String },

    /// The server stopped answering; the framework marks it unreachable.
    #[error("Connection to {server} failed: {message}")]
    Connection { server: String, message: String },

    #[error("Timeout exceeded")]
    TimeoutExceeded,

    #[error("Cancelled")]
    Cancelled,

    #[error("Server {server} became unreachable")]
    ServerLost { server: String },
}

/// Everything a hook may use during a run.
pub struct ExperimentContext {
    pub task_id: TaskId,
    pub experiment_type: String,
    /// The task's configuration payload, untouched.
    pub config: serde_json::Value,
    pub server: ServerConfig,
    /// 1 for the first attempt.
    pub attempt: u32,
    executor: Arc<dyn RemoteExecutor>,
    abort: AbortHandle,
    cleaning: AtomicBool,
    progress: Option<ProgressSink>,
    scratch: tempfile::TempDir,
}

impl ExperimentContext {
    /// Creates a context with a fresh local scratch directory, removed when
    /// the context is dropped.
    pub fn new(
        task_id: impl Into<TaskId>,
        experiment_type: impl Into<String>,
        config: serde_json::Value,
        server: ServerConfig,
        executor: Arc<dyn RemoteExecutor>,
        abort: AbortHandle,
        attempt: u32,
    ) -> std::io::Result<Self> {
        let scratch = tempfile::Builder::new().prefix("labgrid-").tempdir()?;
        Ok(Self {
            task_id: task_id.into(),
            experiment_type: experiment_type.into(),
            config,
            server,
            attempt,
            executor,
            abort,
            cleaning: AtomicBool::new(false),
            progress: None,
            scratch,
        })
    }

    /// Routes [`report_progress`](Self::report_progress) calls to `sink`.
    pub fn with_progress(mut self, sink: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }

    /// Reports how far the experiment is, from 0.0 to 1.0. Ignored when
    /// nobody listens.
    pub fn report_progress(&self, progress: f64) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    /// True once the run has entered CLEANUP.
    pub fn in_cleanup(&self) -> bool {
        self.cleaning.load(Ordering::SeqCst)
    }

    fn begin_cleanup(&self) {
        self.cleaning.store(true, Ordering::SeqCst);
    }

    async fn guard<T>(
        &self,
        operation: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, ExperimentError> {
        if self.in_cleanup() {
            return Ok(operation.await?);
        }
        if let Some(reason) = self.abort.reason() {
            return Err(ExperimentError::Aborted(reason));
        }
        tokio::select! {
            biased;
            _ = self.abort.aborted() => Err(ExperimentError::Aborted(
                self.abort.reason().unwrap_or(AbortReason::Cancelled),
            )),
            result = operation => Ok(result?),
        }
    }

    /// Runs a command on the allocated server. Non-zero exits are returned,
    /// not treated as errors.
    pub async fn run(&self, cmd: &Command) -> Result<ExecResult, ExperimentError> {
        self.guard(self.executor.execute(&self.server, cmd)).await
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error.
    pub async fn run_checked(&self, cmd: &Command) -> Result<ExecResult, ExperimentError> {
        let result = self.run(cmd).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(ExperimentError::CommandFailed {
                command: cmd.to_shell_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            })
        }
    }

    pub async fn upload(&self, local: &Path, remote: &str) -> Result<(), ExperimentError> {
        self.guard(self.executor.upload(&self.server, local, remote))
            .await
    }

    pub async fn download(&self, remote: &str, local: &Path) -> Result<(), ExperimentError> {
        self.guard(self.executor.download(&self.server, remote, local))
            .await
    }
}

/// Hooks an experiment type implements.
///
/// Only [`execute`](Self::execute) is required. A hook fails by returning
/// an error; a panic is caught and recorded as a failure of that stage.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use labgrid::lifecycle::{Experiment, ExperimentContext, ExperimentError, Metrics};
/// use labgrid::remote::Command;
/// use labgrid::results::MetricValue;
///
/// struct Uptime {
///     output: String,
/// }
///
/// #[async_trait]
/// impl Experiment for Uptime {
///     async fn execute(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError> {
///         self.output = ctx.run_checked(&Command::new("uptime")).await?.stdout;
///         Ok(())
///     }
///
///     async fn analyze_data(&mut self, _ctx: &ExperimentContext) -> Result<Metrics, ExperimentError> {
///         let mut metrics = Metrics::new();
///         metrics.insert("raw".into(), MetricValue::Text(self.output.trim().into()));
///         Ok(metrics)
///     }
/// }
/// ```
#[async_trait]
pub trait Experiment: Send {
    async fn initialize(&mut self, _ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        Ok(())
    }

    async fn execute(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError>;

    async fn collect_data(&mut self, _ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        Ok(())
    }

    async fn analyze_data(&mut self, _ctx: &ExperimentContext) -> Result<Metrics, ExperimentError> {
        Ok(Metrics::new())
    }

    /// Returns references (paths, URIs) to the artifacts that were saved.
    async fn save_data(&mut self, _ctx: &ExperimentContext) -> Result<Vec<String>, ExperimentError> {
        Ok(Vec::new())
    }

    async fn cleanup(&mut self, _ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTransition {
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// Result of driving one experiment instance.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub outcome: RunOutcome,
    pub error: Option<LifecycleError>,
    pub cleanup_error: Option<String>,
    pub transitions: Vec<StageTransition>,
    pub metrics: Metrics,
    pub artifacts: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LifecycleReport {
    /// The visited stages, in order.
    pub fn stages(&self) -> Vec<Stage> {
        self.transitions.iter().map(|t| t.stage).collect()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// The connection failure that ended the run, if any.
    pub fn connection_failure(&self) -> Option<(&str, &str)> {
        match &self.error {
            Some(LifecycleError::Connection { server, message }) => Some((server, message)),
            _ => None,
        }
    }
}

/// Drives experiment instances through their stages.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    /// Upper bound on the cleanup hook.
    cleanup_timeout: Duration,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self {
            cleanup_timeout: Duration::from_secs(300),
        }
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Runs `experiment` to completion. Never fails: every problem ends up
    /// in the returned report.
    pub async fn run(
        &self,
        mut experiment: Box<dyn Experiment>,
        ctx: &ExperimentContext,
    ) -> LifecycleReport {
        let started_at = Utc::now();
        let mut transitions = Vec::new();

        let driven = drive(experiment.as_mut(), ctx, &mut transitions).await;

        enter(&mut transitions, Stage::Cleanup, ctx);
        ctx.begin_cleanup();
        let cleanup = tokio::time::timeout(
            self.cleanup_timeout,
            AssertUnwindSafe(experiment.cleanup(ctx)).catch_unwind(),
        )
        .await;
        let cleanup_error = match cleanup {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(panic)) => Some(format!("cleanup panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => Some(format!(
                "cleanup exceeded {}s",
                self.cleanup_timeout.as_secs()
            )),
        };
        if let Some(e) = &cleanup_error {
            warn!("[{}] Cleanup failed: {}", ctx.task_id, e);
        }

        let (outcome, error, metrics, artifacts) = match driven {
            Ok((metrics, artifacts)) => (RunOutcome::Completed, None, metrics, artifacts),
            Err(e) => {
                let outcome = match &e {
                    LifecycleError::Cancelled => RunOutcome::Aborted(AbortReason::Cancelled),
                    LifecycleError::TimeoutExceeded => RunOutcome::Aborted(AbortReason::TimedOut),
                    LifecycleError::ServerLost { .. } => {
                        RunOutcome::Aborted(AbortReason::ServerLost)
                    }
                    _ => RunOutcome::Failed,
                };
                (outcome, Some(e), Metrics::new(), Vec::new())
            }
        };

        let final_stage = if outcome == RunOutcome::Completed {
            Stage::Completed
        } else {
            Stage::Failed
        };
        enter(&mut transitions, final_stage, ctx);

        LifecycleReport {
            outcome,
            error,
            cleanup_error,
            transitions,
            metrics,
            artifacts,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn enter(transitions: &mut Vec<StageTransition>, stage: Stage, ctx: &ExperimentContext) {
    debug!("[{}] -> {}", ctx.task_id, stage);
    transitions.push(StageTransition {
        stage,
        at: Utc::now(),
    });
}

/// Runs the five working stages, stopping at the first failure or abort.
async fn drive(
    experiment: &mut dyn Experiment,
    ctx: &ExperimentContext,
    transitions: &mut Vec<StageTransition>,
) -> Result<(Metrics, Vec<String>), LifecycleError> {
    enter(transitions, Stage::Init, ctx);
    stage(Stage::Init, ctx, experiment.initialize(ctx)).await?;

    enter(transitions, Stage::Executing, ctx);
    stage(Stage::Executing, ctx, experiment.execute(ctx)).await?;

    enter(transitions, Stage::Collecting, ctx);
    stage(Stage::Collecting, ctx, experiment.collect_data(ctx)).await?;

    enter(transitions, Stage::Analyzing, ctx);
    let metrics = stage(Stage::Analyzing, ctx, experiment.analyze_data(ctx)).await?;

    enter(transitions, Stage::Saving, ctx);
    let artifacts = stage(Stage::Saving, ctx, experiment.save_data(ctx)).await?;

    Ok((metrics, artifacts))
}

/// Runs one hook, catching panics and racing it against the abort handle.
async fn stage<T>(
    stage: Stage,
    ctx: &ExperimentContext,
    hook: impl Future<Output = Result<T, ExperimentError>>,
) -> Result<T, LifecycleError> {
    let abort = ctx.abort_handle();
    if let Some(reason) = abort.reason() {
        return Err(aborted(reason, ctx));
    }

    let result = tokio::select! {
        biased;
        _ = abort.aborted() => Err(ExperimentError::Aborted(
            abort.reason().unwrap_or(AbortReason::Cancelled),
        )),
        result = AssertUnwindSafe(hook).catch_unwind() => match result {
            Ok(result) => result,
            Err(panic) => Err(ExperimentError::Panicked(panic_message(panic.as_ref()))),
        },
    };

    result.map_err(|e| {
        // An abort that raced with a hook error takes precedence.
        if let Some(reason) = abort.reason() {
            return aborted(reason, ctx);
        }
        match e {
            ExperimentError::Remote(RemoteError::Connection { server, message }) => {
                LifecycleError::Connection { server, message }
            }
            other => LifecycleError::Stage {
                stage,
                message: other.to_string(),
            },
        }
    })
}

fn aborted(reason: AbortReason, ctx: &ExperimentContext) -> LifecycleError {
    match reason {
        AbortReason::Cancelled => LifecycleError::Cancelled,
        AbortReason::TimedOut => LifecycleError::TimeoutExceeded,
        AbortReason::ServerLost => LifecycleError::ServerLost {
            server: ctx.server.name.clone(),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves a local path for a collected file inside `dir`.
pub(crate) fn local_target(dir: &Path, remote: &str) -> PathBuf {
    let name = Path::new(remote)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| remote.replace('/', "_").into());
    dir.join(name)
}
