//! Task model: what callers submit and what they get back.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::TaskId;
use crate::lifecycle::AbortHandle;

/// Status of a task.
///
/// ```text
///   PENDING ──► READY ──► RUNNING ──► COMPLETED
///      ▲                     │
///      └──── retry ──────────┤
///                            ├──► FAILED
///                            ├──► TIMED_OUT
///                            └──► CANCELLED
/// ```
///
/// PENDING and READY tasks can also go straight to CANCELLED (cancelled by
/// the caller) or FAILED (a dependency failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    /// Terminal without success. Dependents of such a task fail too.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "READY" => Ok(TaskStatus::Ready),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            "TIMED_OUT" => Ok(TaskStatus::TimedOut),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A task to submit.
///
/// ```
/// use labgrid::scheduler::TaskSpec;
/// use std::time::Duration;
///
/// let spec = TaskSpec::new("shell", serde_json::json!({ "command": "make bench" }))
///     .id("bench")
///     .priority(10)
///     .depends_on("build")
///     .max_retries(2)
///     .timeout(Duration::from_secs(600))
///     .tag("nightly");
///
/// assert_eq!(spec.dependencies, vec!["build".to_string()]);
/// ```
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Generated (`task-<uuid>`) when `None`.
    pub id: Option<TaskId>,
    pub experiment_type: String,
    pub config: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub max_retries: u32,
    /// Per-attempt limit, measured from the RUNNING transition.
    pub timeout: Duration,
    pub tags: Vec<String>,
}

impl TaskSpec {
    pub fn new(experiment_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            id: None,
            experiment_type: experiment_type.into(),
            config,
            priority: 0,
            dependencies: Vec::new(),
            max_retries: 0,
            timeout: Duration::from_secs(3600),
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
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Read-only copy of a task's state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub experiment_type: String,
    pub config: serde_json::Value,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
    pub tags: Vec<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: f64,
    pub sequence: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Server of the current or last attempt.
    pub server: Option<String>,
    pub last_error: Option<String>,
    /// Progress of the current attempt as reported by the experiment,
    /// 0.0 to 1.0. Reset on retry, 1.0 once completed.
    pub progress: f64,
}

/// How an attempt ended, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Everything a worker needs to run one attempt.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub experiment_type: String,
    pub config: serde_json::Value,
    pub priority: i32,
    pub tags: Vec<String>,
    pub timeout: Duration,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub allocation: crate::pool::Allocation,
    pub abort: AbortHandle,
}

pub(crate) struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub sequence: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub server: Option<String>,
    pub last_error: Option<String>,
    pub progress: f64,
    /// Backoff: not eligible before this instant.
    pub not_before: Option<Instant>,
    pub abort: Option<AbortHandle>,
    pub cancel_requested: bool,
    pub status_tx: watch::Sender<TaskStatus>,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec, sequence: u64) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        Self {
            id,
            spec,
            status: TaskStatus::Pending,
            retry_count: 0,
            sequence,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            server: None,
            last_error: None,
            progress: 0.0,
            not_before: None,
            abort: None,
            cancel_requested: false,
            status_tx,
        }
    }

    /// Changes status and publishes it to waiters.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        match status {
            TaskStatus::Pending => self.progress = 0.0,
            TaskStatus::Completed => self.progress = 1.0,
            _ => {}
        }
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.status_tx.send_replace(status);
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            experiment_type: self.spec.experiment_type.clone(),
            config: self.spec.config.clone(),
            priority: self.spec.priority,
            dependencies: self.spec.dependencies.clone(),
            tags: self.spec.tags.clone(),
            status: self.status,
            retry_count: self.retry_count,
            max_retries: self.spec.max_retries,
            timeout_secs: self.spec.timeout.as_secs_f64(),
            sequence: self.sequence,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            server: self.server.clone(),
            last_error: self.last_error.clone(),
            progress: self.progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Completed.is_failure());
        assert!(TaskStatus::TimedOut.is_failure());
    }

    #[test]
    fn test_status_round_trips_through_display() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::TimedOut,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("timed_out".parse::<TaskStatus>().unwrap(), TaskStatus::TimedOut);
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
