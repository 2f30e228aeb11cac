//! Task scheduler: priority and dependency ordering, retries, cancellation.
//!
//! The [`Scheduler`] owns every task. Workers pull from it with
//! [`try_dispatch`](Scheduler::try_dispatch) and report back with
//! [`finish`](Scheduler::finish); callers only ever see [`TaskSnapshot`]s.
//!
//! # Ordering
//!
//! A PENDING task becomes READY once every dependency is COMPLETED and its
//! retry backoff (if any) has elapsed. READY tasks are dispatched by
//! priority, highest first, and in submission order within a priority.
//! The order is evaluated on every dispatch, so a late high-priority
//! arrival overtakes tasks that are still waiting.
//!
//! A task whose dependency ends FAILED, CANCELLED or TIMED_OUT is failed
//! without running, and so are its own dependents.
//!
//! Readiness is re-evaluated only for tasks that could have changed: the
//! dependents of a task that just finished, newly submitted tasks, and
//! tasks whose backoff expired. A reverse dependency index keeps that
//! proportional to the number of edges touched.
//!
//! # Queue bound
//!
//! With a maximum queue size set, submissions are refused with
//! [`SchedulerError::QueueFull`] while that many tasks are PENDING or
//! READY.
//!
//! # Dispatch
//!
//! Only the head of the ready queue is offered to the pool. If no server
//! can take it, nothing is dispatched and the caller waits for
//! [`changed`](Scheduler::changed) or the pool's notification. The
//! READY → RUNNING transition and the lease happen under the scheduler
//! lock, so a task is never RUNNING without a server.
//!
//! Lock order is scheduler, then pool. The pool never calls back.

mod retry;
mod task;

pub use retry::RetryPolicy;
pub use task::{AttemptOutcome, Dispatch, TaskSnapshot, TaskSpec, TaskStatus};

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use self::task::Task;
use crate::TaskId;
use crate::lifecycle::{AbortHandle, AbortReason};
use crate::pool::ResourcePool;

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Task {0} depends on itself")]
    SelfDependency(TaskId),

    #[error("Task id {0} is already taken")]
    DuplicateId(TaskId),

    #[error("Task {task} would close a dependency cycle: {}", path.join(" -> "))]
    Cycle { task: TaskId, path: Vec<TaskId> },
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Timed out waiting for task {0}")]
    TimeoutExceeded(TaskId),

    #[error("Task queue is full ({0} tasks waiting)")]
    QueueFull(usize),
}

/// Result of [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task had not started and is now CANCELLED.
    Cancelled,
    /// The task is running; it becomes CANCELLED once its run has torn down.
    Requested,
    /// The task had already finished; nothing changed.
    AlreadyFinished(TaskStatus),
}

/// Number of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub total: usize,
    /// Retries scheduled so far, across all tasks.
    pub retries: u64,
}

type ReadyKey = (Reverse<i32>, u64, TaskId);

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Task>,
    /// READY tasks in dispatch order.
    ready: BTreeSet<ReadyKey>,
    /// Dependency id to the tasks waiting on it. Keys may name tasks that
    /// were never submitted.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// PENDING tasks waiting out a retry backoff.
    backoff: BTreeSet<(Instant, TaskId)>,
    /// Tasks to re-evaluate on the next refresh.
    dirty: Vec<TaskId>,
    next_sequence: u64,
    retries: u64,
}

impl SchedulerState {
    fn ready_key(task: &Task) -> ReadyKey {
        (Reverse(task.spec.priority), task.sequence, task.id.clone())
    }

    /// Walks dependencies from `start` looking for `target`. Returns the
    /// path `start .. target` if found.
    fn path_to(&self, start: &str, target: &str) -> Option<Vec<TaskId>> {
        let mut stack = vec![vec![start.to_string()]];
        let mut seen = HashSet::new();

        while let Some(path) = stack.pop() {
            let Some(current) = path.last() else {
                continue;
            };
            if current == target {
                return Some(path);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get(current) {
                for dep in &task.spec.dependencies {
                    let mut next = path.clone();
                    next.push(dep.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    /// Queues the dependents of `id` for re-evaluation.
    fn wake_dependents(&mut self, id: &str) {
        if let Some(waiting) = self.dependents.get(id) {
            self.dirty.extend(waiting.iter().cloned());
        }
    }

    /// Promotes dirty PENDING tasks whose dependencies completed and fails
    /// those with a failed dependency. Failures cascade through the
    /// dependents index.
    fn refresh(&mut self, now: Instant) -> bool {
        loop {
            match self.backoff.first() {
                Some((at, _)) if *at <= now => {}
                _ => break,
            }
            if let Some((_, id)) = self.backoff.pop_first() {
                self.dirty.push(id);
            }
        }

        let mut changed = false;
        while let Some(id) = self.dirty.pop() {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            let failed_dep = task.spec.dependencies.iter().find_map(|dep| {
                self.tasks
                    .get(dep)
                    .filter(|d| d.status.is_failure())
                    .map(|d| (dep.clone(), d.status))
            });
            let deps_done = task.spec.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            });
            let backoff_elapsed = task.not_before.is_none_or(|t| t <= now);

            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if let Some((dep, status)) = failed_dep {
                warn!("Task {} failed: dependency {} is {}", id, dep, status);
                if let Some(at) = task.not_before.take() {
                    self.backoff.remove(&(at, id.clone()));
                }
                task.last_error = Some(format!("dependency {} is {}", dep, status));
                task.set_status(TaskStatus::Failed);
                self.wake_dependents(&id);
                changed = true;
            } else if deps_done && backoff_elapsed {
                task.not_before = None;
                task.set_status(TaskStatus::Ready);
                let key = Self::ready_key(task);
                self.ready.insert(key);
                changed = true;
            }
        }
        changed
    }

    fn queue_depth(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .count()
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, SchedulerError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }
}

/// Owns all tasks and decides what runs next.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    changed: Notify,
    retry: RetryPolicy,
    /// `None` means unbounded.
    max_queue_size: Option<usize>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Scheduler {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            changed: Notify::new(),
            retry,
            max_queue_size: None,
        }
    }

    /// Caps the number of PENDING + READY tasks. 0 means unbounded.
    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = (max > 0).then_some(max);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notified when tasks are submitted, become ready or finish.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Adds a task. Dependencies may name tasks that are not submitted yet.
    ///
    /// # Errors
    ///
    /// `DependencyError` if the id is taken, the task depends on itself, or
    /// its dependencies would close a cycle through already known tasks.
    /// `QueueFull` if the queue bound is reached.
    ///
    /// ```
    /// use labgrid::scheduler::{Scheduler, TaskSpec, TaskStatus};
    ///
    /// let scheduler = Scheduler::default();
    /// let a = scheduler.submit(TaskSpec::new("shell", serde_json::Value::Null).id("a")).unwrap();
    /// let b = scheduler
    ///     .submit(TaskSpec::new("shell", serde_json::Value::Null).id("b").depends_on("a"))
    ///     .unwrap();
    ///
    /// assert_eq!(scheduler.snapshot(&a).unwrap().status, TaskStatus::Ready);
    /// assert_eq!(scheduler.snapshot(&b).unwrap().status, TaskStatus::Pending);
    /// ```
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, SchedulerError> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4()));

        {
            let mut state = self.lock();

            if let Some(max) = self.max_queue_size {
                let waiting = state.queue_depth();
                if waiting >= max {
                    warn!("Rejecting task {}: queue is full", id);
                    return Err(SchedulerError::QueueFull(waiting));
                }
            }
            if state.tasks.contains_key(&id) {
                return Err(DependencyError::DuplicateId(id).into());
            }
            if spec.dependencies.contains(&id) {
                return Err(DependencyError::SelfDependency(id).into());
            }
            for dep in &spec.dependencies {
                if let Some(mut path) = state.path_to(dep, &id) {
                    path.insert(0, id.clone());
                    return Err(DependencyError::Cycle { task: id, path }.into());
                }
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            info!(
                "Submitted task {} ({}, priority {}, {} dependencies)",
                id,
                spec.experiment_type,
                spec.priority,
                spec.dependencies.len()
            );
            for dep in &spec.dependencies {
                state
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(id.clone());
            }
            state.tasks.insert(id.clone(), Task::new(id.clone(), spec, sequence));
            state.dirty.push(id.clone());
            state.refresh(Instant::now());
        }

        self.changed.notify_waiters();
        Ok(id)
    }

    /// Leases a server for the highest-priority READY task and marks it
    /// RUNNING. Returns `None` if nothing is ready or the pool has no room
    /// for the head task.
    pub fn try_dispatch(&self, pool: &ResourcePool) -> Option<Dispatch> {
        let mut state = self.lock();
        state.refresh(Instant::now());

        let head = state.ready.first()?.clone();
        let (Reverse(priority), _, id) = &head;
        if !state.tasks.contains_key(id) {
            state.ready.remove(&head);
            return None;
        }
        let allocation = pool.allocate(id, *priority)?;
        state.ready.remove(&head);

        let Some(task) = state.tasks.get_mut(id) else {
            pool.release(&allocation.server.name, id);
            return None;
        };
        let abort = AbortHandle::new();
        task.started_at = Some(Utc::now());
        task.server = Some(allocation.server.name.clone());
        task.abort = Some(abort.clone());
        task.set_status(TaskStatus::Running);

        let attempt = task.retry_count + 1;
        info!(
            "Dispatching {} to {} (attempt {})",
            task.id, allocation.server.name, attempt
        );

        Some(Dispatch {
            task_id: task.id.clone(),
            experiment_type: task.spec.experiment_type.clone(),
            config: task.spec.config.clone(),
            priority: task.spec.priority,
            tags: task.spec.tags.clone(),
            timeout: task.spec.timeout,
            attempt,
            allocation,
            abort,
        })
    }

    /// Records how an attempt of a RUNNING task ended and returns the
    /// task's new status.
    ///
    /// Failed and timed-out attempts are retried while the retry budget
    /// lasts. If cancellation was requested during the attempt, a failure
    /// ends the task as CANCELLED instead of retrying it; a completed
    /// attempt still counts as COMPLETED.
    pub fn finish(&self, id: &str, outcome: AttemptOutcome) -> Result<TaskStatus, SchedulerError> {
        let status = {
            let mut state = self.lock();
            let retry = &self.retry;
            let task = state.task_mut(id)?;

            if task.status != TaskStatus::Running {
                debug!("Ignoring outcome for {} in state {}", id, task.status);
                return Ok(task.status);
            }
            task.abort = None;

            let mut retry_at = None;
            let status = match outcome {
                AttemptOutcome::Completed => {
                    task.last_error = None;
                    TaskStatus::Completed
                }
                AttemptOutcome::Cancelled => TaskStatus::Cancelled,
                _ if task.cancel_requested => TaskStatus::Cancelled,
                AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut => {
                    let timed_out = outcome == AttemptOutcome::TimedOut;
                    task.last_error = Some(match outcome {
                        AttemptOutcome::Failed(message) => message,
                        _ => format!("timed out after {:?}", task.spec.timeout),
                    });

                    if retry.should_retry(task.retry_count, task.spec.max_retries) {
                        task.retry_count += 1;
                        let delay = retry.delay(task.retry_count);
                        let at = Instant::now() + delay;
                        task.not_before = Some(at);
                        retry_at = Some(at);
                        warn!(
                            "Task {} attempt {} failed, retrying in {:?}: {}",
                            id,
                            task.retry_count,
                            delay,
                            task.last_error.as_deref().unwrap_or_default()
                        );
                        TaskStatus::Pending
                    } else if timed_out {
                        TaskStatus::TimedOut
                    } else {
                        TaskStatus::Failed
                    }
                }
            };

            task.set_status(status);
            if status.is_terminal() {
                info!("Task {} finished: {}", id, status);
            }
            if let Some(at) = retry_at {
                state.retries += 1;
                state.backoff.insert((at, id.to_string()));
            }
            if status.is_terminal() {
                state.wake_dependents(id);
            }
            state.refresh(Instant::now());
            status
        };

        self.changed.notify_waiters();
        Ok(status)
    }

    /// Cancels a task.
    ///
    /// Not-yet-running tasks become CANCELLED at once. Running tasks are
    /// signalled through their abort handle and become CANCELLED when the
    /// worker reports back.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, SchedulerError> {
        let outcome = {
            let mut state = self.lock();
            let task = state.task_mut(id)?;

            match task.status {
                status if status.is_terminal() => CancelOutcome::AlreadyFinished(status),
                TaskStatus::Running => {
                    task.cancel_requested = true;
                    if let Some(abort) = &task.abort {
                        abort.abort(AbortReason::Cancelled);
                    }
                    info!("Cancellation requested for running task {}", id);
                    CancelOutcome::Requested
                }
                _ => {
                    let key = SchedulerState::ready_key(task);
                    let retry_at = task.not_before.take();
                    task.set_status(TaskStatus::Cancelled);
                    info!("Cancelled task {}", id);
                    state.ready.remove(&key);
                    if let Some(at) = retry_at {
                        state.backoff.remove(&(at, id.to_string()));
                    }
                    state.wake_dependents(id);
                    state.refresh(Instant::now());
                    CancelOutcome::Cancelled
                }
            }
        };

        self.changed.notify_waiters();
        Ok(outcome)
    }

    /// Signals a RUNNING task's run to stop. Returns `false` if the task is
    /// not running or was already aborted.
    pub fn abort(&self, id: &str, reason: AbortReason) -> bool {
        let state = self.lock();
        state
            .tasks
            .get(id)
            .filter(|t| t.status == TaskStatus::Running)
            .and_then(|t| t.abort.as_ref())
            .is_some_and(|abort| abort.abort(reason))
    }

    /// Signals every running task. Returns how many were signalled.
    pub fn abort_all(&self, reason: AbortReason) -> usize {
        let state = self.lock();
        state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| t.abort.as_ref())
            .filter(|abort| abort.abort(reason))
            .count()
    }

    /// Waits until the task reaches a terminal status.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `TimeoutExceeded` if `timeout` elapses
    /// first. `None` waits indefinitely.
    pub async fn wait_for(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<TaskSnapshot, SchedulerError> {
        let mut rx = self
            .lock()
            .tasks
            .get(id)
            .map(|t| t.status_tx.subscribe())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        let finished = rx.wait_for(|status| status.is_terminal());
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, finished)
                    .await
                    .map_err(|_| SchedulerError::TimeoutExceeded(id.to_string()))?;
            }
            None => {
                let _ = finished.await;
            }
        }

        self.snapshot(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.lock().tasks.get(id).map(Task::snapshot)
    }

    /// Snapshots in submission order, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<TaskSnapshot> {
        let state = self.lock();
        let mut tasks: Vec<TaskSnapshot> = state
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .map(Task::snapshot)
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn counts(&self) -> TaskCounts {
        let state = self.lock();
        let mut counts = TaskCounts {
            total: state.tasks.len(),
            retries: state.retries,
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::TimedOut => counts.timed_out += 1,
            }
        }
        counts
    }

    /// Tasks waiting to run (PENDING + READY).
    pub fn queue_depth(&self) -> usize {
        self.lock().queue_depth()
    }

    /// `true` when a queue bound is set and reached.
    pub fn is_queue_full(&self) -> bool {
        self.max_queue_size
            .is_some_and(|max| self.queue_depth() >= max)
    }

    /// Records the progress (0.0 to 1.0, clamped) a RUNNING task reports.
    /// Returns `false` if the task is not running.
    pub fn update_progress(&self, id: &str, progress: f64) -> bool {
        if progress.is_nan() {
            return false;
        }
        let mut state = self.lock();
        match state.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.progress = progress.clamp(0.0, 1.0);
                true
            }
            _ => false,
        }
    }

    /// `true` once every known task is terminal.
    pub fn is_idle(&self) -> bool {
        self.lock().tasks.values().all(|t| t.status.is_terminal())
    }

    /// Earliest instant at which a backed-off task becomes eligible.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.lock().backoff.first().map(|(at, _)| *at)
    }

    /// Forgets terminal tasks that ended before `cutoff`. Tasks that a
    /// non-terminal task still depends on are kept.
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let needed: HashSet<TaskId> = state
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .flat_map(|t| t.spec.dependencies.iter().cloned())
            .collect();

        let purged: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|task| {
                task.status.is_terminal()
                    && task.ended_at.is_some_and(|end| end < cutoff)
                    && !needed.contains(&task.id)
            })
            .map(|task| task.id.clone())
            .collect();

        for id in &purged {
            let Some(task) = state.tasks.remove(id) else {
                continue;
            };
            for dep in &task.spec.dependencies {
                if let Some(waiting) = state.dependents.get_mut(dep) {
                    waiting.retain(|d| d != id);
                    if waiting.is_empty() {
                        state.dependents.remove(dep);
                    }
                }
            }
            state.dependents.remove(id);
        }
        let removed = purged.len();
        if removed > 0 {
            debug!("Purged {} finished tasks", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocationConfig, ServerConfig};

    fn spec(id: &str) -> TaskSpec {
        TaskSpec::new("shell", serde_json::Value::Null).id(id)
    }

    fn pool(capacity: usize) -> ResourcePool {
        ResourcePool::new(
            vec![ServerConfig::new("s1", "localhost").with_capacity(capacity)],
            AllocationConfig::LeastLoaded,
        )
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(RetryPolicy::immediate())
    }

    fn status(s: &Scheduler, id: &str) -> TaskStatus {
        s.snapshot(id).unwrap().status
    }

    /// Dispatches everything, finishing each task as it is handed out.
    fn drain(s: &Scheduler, pool: &ResourcePool) -> Vec<TaskId> {
        let mut order = Vec::new();
        while let Some(d) = s.try_dispatch(pool) {
            pool.release(&d.allocation.server.name, &d.task_id);
            s.finish(&d.task_id, AttemptOutcome::Completed).unwrap();
            order.push(d.task_id);
        }
        order
    }

    #[test]
    fn test_priority_then_fifo() {
        let s = scheduler();
        s.submit(spec("low").priority(1)).unwrap();
        s.submit(spec("high-1").priority(10)).unwrap();
        s.submit(spec("mid").priority(5)).unwrap();
        s.submit(spec("high-2").priority(10)).unwrap();

        assert_eq!(drain(&s, &pool(1)), vec!["high-1", "high-2", "mid", "low"]);
    }

    #[test]
    fn test_late_high_priority_overtakes_waiting_tasks() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("a").priority(1)).unwrap();
        s.submit(spec("b").priority(1)).unwrap();

        let first = s.try_dispatch(&pool).unwrap();
        assert_eq!(first.task_id, "a");
        // Pool is full; nothing else goes out.
        assert!(s.try_dispatch(&pool).is_none());
        assert_eq!(status(&s, "b"), TaskStatus::Ready);

        s.submit(spec("urgent").priority(9)).unwrap();
        pool.release("s1", "a");
        s.finish("a", AttemptOutcome::Completed).unwrap();

        assert_eq!(drain(&s, &pool), vec!["urgent", "b"]);
    }

    #[test]
    fn test_dependencies_gate_readiness() {
        let s = scheduler();
        let pool = pool(4);
        // "c" refers to "b" before "b" exists.
        s.submit(spec("c").depends_on("b")).unwrap();
        s.submit(spec("a")).unwrap();
        s.submit(spec("b").depends_on("a").priority(100)).unwrap();

        assert_eq!(status(&s, "c"), TaskStatus::Pending);
        assert_eq!(status(&s, "b"), TaskStatus::Pending);
        assert_eq!(drain(&s, &pool), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dependency_errors() {
        let s = scheduler();
        s.submit(spec("a").depends_on("b")).unwrap();

        assert!(matches!(
            s.submit(spec("x").depends_on("x")),
            Err(SchedulerError::Dependency(DependencyError::SelfDependency(_)))
        ));
        assert!(matches!(
            s.submit(spec("a")),
            Err(SchedulerError::Dependency(DependencyError::DuplicateId(_)))
        ));
        match s.submit(spec("b").depends_on("a")) {
            Err(SchedulerError::Dependency(DependencyError::Cycle { path, .. })) => {
                assert_eq!(path, vec!["b", "a", "b"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        // Rejected submissions leave no trace.
        assert!(s.snapshot("x").is_none());
        assert_eq!(s.counts().total, 1);
    }

    #[test]
    fn test_failure_propagates_transitively() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("root")).unwrap();
        s.submit(spec("mid").depends_on("root")).unwrap();
        s.submit(spec("leaf").depends_on("mid")).unwrap();
        s.submit(spec("other")).unwrap();

        let d = s.try_dispatch(&pool).unwrap();
        pool.release("s1", &d.task_id);
        s.finish("root", AttemptOutcome::Failed("exit 1".into())).unwrap();

        assert_eq!(status(&s, "root"), TaskStatus::Failed);
        assert_eq!(status(&s, "mid"), TaskStatus::Failed);
        assert_eq!(status(&s, "leaf"), TaskStatus::Failed);
        assert!(s.snapshot("leaf").unwrap().started_at.is_none());
        assert_eq!(drain(&s, &pool), vec!["other"]);
    }

    #[test]
    fn test_retry_bound_and_timed_out_terminal() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("flaky").max_retries(2)).unwrap();

        let mut attempts = 0;
        while let Some(d) = s.try_dispatch(&pool) {
            attempts += 1;
            assert_eq!(d.attempt, attempts);
            pool.release("s1", &d.task_id);
            s.finish(&d.task_id, AttemptOutcome::TimedOut).unwrap();
        }

        assert_eq!(attempts, 3);
        let snap = s.snapshot("flaky").unwrap();
        assert_eq!(snap.status, TaskStatus::TimedOut);
        assert_eq!(snap.retry_count, 2);
        assert_eq!(s.counts().retries, 2);
    }

    #[test]
    fn test_retry_then_success() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("t").max_retries(3)).unwrap();

        let d = s.try_dispatch(&pool).unwrap();
        pool.release("s1", &d.task_id);
        assert_eq!(
            s.finish("t", AttemptOutcome::Failed("boom".into())).unwrap(),
            TaskStatus::Pending
        );
        assert_eq!(s.snapshot("t").unwrap().last_error.as_deref(), Some("boom"));

        let d = s.try_dispatch(&pool).unwrap();
        pool.release("s1", &d.task_id);
        assert_eq!(
            s.finish("t", AttemptOutcome::Completed).unwrap(),
            TaskStatus::Completed
        );
        assert!(s.snapshot("t").unwrap().last_error.is_none());
    }

    #[test]
    fn test_backoff_delays_readiness() {
        let s = Scheduler::new(RetryPolicy::new(crate::config::BackoffConfig::Fixed {
            delay_ms: 60_000,
        }));
        let pool = pool(1);
        s.submit(spec("t").max_retries(1)).unwrap();

        let d = s.try_dispatch(&pool).unwrap();
        pool.release("s1", &d.task_id);
        s.finish("t", AttemptOutcome::Failed("x".into())).unwrap();

        assert!(s.try_dispatch(&pool).is_none());
        assert_eq!(status(&s, "t"), TaskStatus::Pending);
        assert!(s.next_retry_at().is_some());
    }

    #[test]
    fn test_cancel_pending_and_running() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("run")).unwrap();
        s.submit(spec("wait")).unwrap();
        s.submit(spec("child").depends_on("wait")).unwrap();

        let d = s.try_dispatch(&pool).unwrap();
        assert_eq!(d.task_id, "run");

        assert_eq!(s.cancel("wait").unwrap(), CancelOutcome::Cancelled);
        assert_eq!(status(&s, "child"), TaskStatus::Failed);

        assert_eq!(s.cancel("run").unwrap(), CancelOutcome::Requested);
        assert_eq!(d.abort.reason(), Some(AbortReason::Cancelled));
        assert_eq!(status(&s, "run"), TaskStatus::Running);

        // The run fails while tearing down; it still ends CANCELLED.
        pool.release("s1", "run");
        s.finish("run", AttemptOutcome::Failed("killed".into())).unwrap();
        assert_eq!(status(&s, "run"), TaskStatus::Cancelled);

        assert_eq!(
            s.cancel("run").unwrap(),
            CancelOutcome::AlreadyFinished(TaskStatus::Cancelled)
        );
        assert!(matches!(s.cancel("nope"), Err(SchedulerError::NotFound(_))));
    }

    #[test]
    fn test_completion_wins_over_late_cancel() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("t").max_retries(5)).unwrap();
        s.try_dispatch(&pool).unwrap();

        s.cancel("t").unwrap();
        s.finish("t", AttemptOutcome::Completed).unwrap();
        assert_eq!(status(&s, "t"), TaskStatus::Completed);
    }

    #[test]
    fn test_running_task_never_without_server() {
        let s = scheduler();
        let pool = ResourcePool::new(Vec::new(), AllocationConfig::RoundRobin);
        s.submit(spec("t")).unwrap();

        assert!(s.try_dispatch(&pool).is_none());
        assert_eq!(status(&s, "t"), TaskStatus::Ready);
    }

    #[test]
    fn test_stale_queue_entry_takes_no_lease() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("t")).unwrap();
        s.lock()
            .ready
            .insert((Reverse(i32::MAX), 0, "gone".to_string()));

        assert!(s.try_dispatch(&pool).is_none());
        assert_eq!(pool.servers()[0].current_tasks, 0);

        let d = s.try_dispatch(&pool).unwrap();
        assert_eq!(d.task_id, "t");
        assert_eq!(pool.servers()[0].tasks, vec!["t".to_string()]);
    }

    #[test]
    fn test_purge_keeps_needed_dependencies() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("done")).unwrap();
        s.submit(spec("blocker")).unwrap();
        s.submit(spec("waiting").depends_on("done").depends_on("blocker").priority(-1)).unwrap();
        s.submit(spec("solo").priority(-5)).unwrap();

        let d = s.try_dispatch(&pool).unwrap();
        assert_eq!(d.task_id, "done");
        pool.release("s1", "done");
        s.finish("done", AttemptOutcome::Completed).unwrap();
        s.cancel("solo").unwrap();

        let removed = s.purge_finished(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(s.snapshot("solo").is_none());
        assert!(s.snapshot("done").is_some());
    }

    #[tokio::test]
    async fn test_wait_for() {
        let s = std::sync::Arc::new(scheduler());
        let pool = pool(1);
        s.submit(spec("t")).unwrap();

        let err = s.wait_for("t", Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TimeoutExceeded(_)));

        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_for("t", Some(Duration::from_secs(5))).await })
        };
        s.try_dispatch(&pool).unwrap();
        s.finish("t", AttemptOutcome::Completed).unwrap();

        let snap = waiter.await.unwrap().unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);
        assert!(matches!(
            s.wait_for("missing", None).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[test]
    fn test_queue_bound() {
        let s = scheduler().with_max_queue_size(2);
        let pool = pool(1);
        s.submit(spec("a")).unwrap();
        s.submit(spec("b")).unwrap();
        assert!(s.is_queue_full());
        assert!(matches!(s.submit(spec("c")), Err(SchedulerError::QueueFull(2))));
        assert!(s.snapshot("c").is_none());

        // Running tasks do not count against the bound.
        s.try_dispatch(&pool).unwrap();
        assert!(!s.is_queue_full());
        s.submit(spec("c")).unwrap();

        assert!(!scheduler().with_max_queue_size(0).is_queue_full());
    }

    #[test]
    fn test_progress_reporting() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("t").max_retries(1)).unwrap();
        assert!(!s.update_progress("t", 0.5));

        let d = s.try_dispatch(&pool).unwrap();
        assert!(s.update_progress("t", 0.4));
        assert_eq!(s.snapshot("t").unwrap().progress, 0.4);
        assert!(s.update_progress("t", 7.0));
        assert_eq!(s.snapshot("t").unwrap().progress, 1.0);
        assert!(!s.update_progress("t", f64::NAN));
        assert!(!s.update_progress("missing", 0.1));

        pool.release("s1", &d.task_id);
        s.finish("t", AttemptOutcome::Failed("x".into())).unwrap();
        assert_eq!(s.snapshot("t").unwrap().progress, 0.0);

        let d = s.try_dispatch(&pool).unwrap();
        pool.release("s1", &d.task_id);
        s.finish("t", AttemptOutcome::Completed).unwrap();
        assert_eq!(s.snapshot("t").unwrap().progress, 1.0);
    }

    #[test]
    fn test_wide_fan_out_releases_each_dependent_once() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("root")).unwrap();
        for i in 0..200 {
            s.submit(spec(&format!("leaf-{i:03}")).depends_on("root")).unwrap();
        }
        assert_eq!(s.counts().pending, 200);

        let order = drain(&s, &pool);
        assert_eq!(order.len(), 201);
        assert_eq!(order[0], "root");
        assert_eq!(order[1], "leaf-000");
        assert_eq!(order[200], "leaf-199");
        assert!(s.is_idle());
    }

    #[test]
    fn test_cancelled_backoff_is_forgotten() {
        let s = Scheduler::new(RetryPolicy::new(crate::config::BackoffConfig::Fixed {
            delay_ms: 60_000,
        }));
        let pool = pool(1);
        s.submit(spec("t").max_retries(1)).unwrap();
        let d = s.try_dispatch(&pool).unwrap();
        pool.release("s1", &d.task_id);
        s.finish("t", AttemptOutcome::Failed("x".into())).unwrap();
        assert!(s.next_retry_at().is_some());

        s.cancel("t").unwrap();
        assert!(s.next_retry_at().is_none());
        assert_eq!(status(&s, "t"), TaskStatus::Cancelled);
    }

    #[test]
    fn test_counts_and_queue_depth() {
        let s = scheduler();
        let pool = pool(1);
        s.submit(spec("a")).unwrap();
        s.submit(spec("b")).unwrap();
        s.submit(spec("c").depends_on("a")).unwrap();
        s.try_dispatch(&pool).unwrap();

        let counts = s.counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total, 3);
        assert_eq!(s.queue_depth(), 2);
        assert_eq!(s.list(Some(TaskStatus::Ready))[0].id, "b");
        assert_eq!(s.list(None).len(), 3);
        assert!(!s.is_idle());
    }
}
