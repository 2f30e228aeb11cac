//! Worker loop and background monitor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RETENTION_INTERVAL, Shared};
use crate::lifecycle::{AbortHandle, AbortReason, ExperimentContext, LifecycleReport, RunOutcome};
use crate::results::{ExperimentResult, ResultStatus};
use crate::scheduler::{AttemptOutcome, Dispatch};

/// Pulls tasks from the scheduler until shutdown.
pub(super) async fn run(shared: Arc<Shared>, index: usize) {
    debug!("Worker {} started", index);
    let poll = shared.config.labgrid.poll_interval();

    while !shared.shutdown.is_cancelled() {
        // Register interest before looking, so a change between the look
        // and the wait is not missed.
        let scheduler_changed = shared.scheduler.changed().notified();
        let pool_changed = shared.pool.changed().notified();
        tokio::pin!(scheduler_changed, pool_changed);
        scheduler_changed.as_mut().enable();
        pool_changed.as_mut().enable();

        if let Some(dispatch) = shared.scheduler.try_dispatch(&shared.pool) {
            execute(&shared, dispatch).await;
            continue;
        }

        let wait = shared
            .scheduler
            .next_retry_at()
            .map_or(poll, |at| at.saturating_duration_since(Instant::now()).min(poll));

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = &mut scheduler_changed => {}
            _ = &mut pool_changed => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Worker {} stopped", index);
}

/// Periodic health probes and result retention.
pub(super) async fn monitor(shared: Arc<Shared>) {
    let health = shared.config.labgrid.health_check_interval();
    let mut ticker = tokio::time::interval(health.unwrap_or(RETENTION_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; servers start out AVAILABLE.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if health.is_some() {
            shared.health_check().await;
        }
        let removed = shared.apply_retention();
        if removed.result_versions > 0 || removed.tasks > 0 {
            debug!(
                "Retention removed {} result versions and {} tasks",
                removed.result_versions, removed.tasks
            );
        }
    }
}

/// Aborts the run when its deadline passes or the framework shuts down.
async fn watchdog(abort: AbortHandle, deadline: Duration, shutdown: CancellationToken) {
    tokio::select! {
        _ = abort.aborted() => {}
        _ = tokio::time::sleep(deadline) => {
            abort.abort(AbortReason::TimedOut);
        }
        _ = shutdown.cancelled() => {
            abort.abort(AbortReason::Cancelled);
        }
    }
}

/// Runs one attempt and reports it to the pool, the store and the scheduler.
async fn execute(shared: &Arc<Shared>, dispatch: Dispatch) {
    let Dispatch {
        task_id,
        experiment_type,
        config,
        tags,
        timeout,
        attempt,
        allocation,
        abort,
        ..
    } = dispatch;
    let server = allocation.server;
    let started_at = Utc::now();

    let deadline = tokio::spawn(watchdog(abort.clone(), timeout, shared.shutdown.clone()));

    let report = match shared.registry.create(&experiment_type, &config) {
        Ok(experiment) => {
            match ExperimentContext::new(
                task_id.clone(),
                experiment_type.clone(),
                config,
                server.clone(),
                shared.executor.clone(),
                abort.clone(),
                attempt,
            ) {
                Ok(ctx) => {
                    let progress = {
                        let shared = shared.clone();
                        let task_id = task_id.clone();
                        move |value: f64| {
                            shared.scheduler.update_progress(&task_id, value);
                        }
                    };
                    let ctx = ctx.with_progress(progress);
                    Ok(shared.controller.run(experiment, &ctx).await)
                }
                Err(e) => Err(format!("creating scratch directory: {}", e)),
            }
        }
        Err(e) => Err(e.to_string()),
    };
    deadline.abort();

    if let Ok(report) = &report
        && let Some((server_name, message)) = report.connection_failure()
    {
        for lost in shared.pool.mark_unreachable(server_name, message) {
            if lost != task_id && shared.scheduler.abort(&lost, AbortReason::ServerLost) {
                warn!("Task {} lost its lease on {}, aborting", lost, server_name);
            }
        }
    }
    shared.pool.release(&server.name, &task_id);

    let (status, outcome, error_message) = match &report {
        Ok(report) => classify(report),
        Err(message) => (
            ResultStatus::Failed,
            AttemptOutcome::Failed(message.clone()),
            Some(message.clone()),
        ),
    };

    let mut result = ExperimentResult::new(task_id.clone(), experiment_type, status, started_at);
    result.server = Some(server.name.clone());
    result.attempt = attempt;
    result.tags = tags;
    result.error_message = error_message;
    if let Ok(report) = report {
        result.stages = report.stages();
        result.metrics = report.metrics;
        result.artifacts = report.artifacts;
    }
    shared.results.save(result);

    match status {
        ResultStatus::Completed => info!("[{}] Completed on {}", task_id, server.name),
        _ => info!("[{}] Attempt {} ended {}", task_id, attempt, status),
    }

    if let Err(e) = shared.scheduler.finish(&task_id, outcome) {
        error!("Failed to record outcome of {}: {}", task_id, e);
    }
}

fn classify(report: &LifecycleReport) -> (ResultStatus, AttemptOutcome, Option<String>) {
    let message = report.error.as_ref().map(|e| e.to_string());
    match report.outcome {
        RunOutcome::Completed => (ResultStatus::Completed, AttemptOutcome::Completed, None),
        RunOutcome::Aborted(AbortReason::TimedOut) => {
            (ResultStatus::TimedOut, AttemptOutcome::TimedOut, message)
        }
        RunOutcome::Aborted(AbortReason::Cancelled) => {
            (ResultStatus::Cancelled, AttemptOutcome::Cancelled, message)
        }
        RunOutcome::Aborted(AbortReason::ServerLost) | RunOutcome::Failed => {
            let text = message.clone().unwrap_or_else(|| "failed".to_string());
            (ResultStatus::Failed, AttemptOutcome::Failed(text), message)
        }
    }
}
