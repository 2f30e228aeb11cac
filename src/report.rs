//! Console output for `labgrid run`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::results::ExperimentResult;
use crate::scheduler::{TaskSnapshot, TaskStatus};

/// Summary of a finished manifest run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub tasks: Vec<TaskSnapshot>,
    pub duration: Duration,
}

impl RunSummary {
    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn completed(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn timed_out(&self) -> usize {
        self.count(TaskStatus::TimedOut)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskStatus::Cancelled)
    }

    /// Tasks that needed more than one attempt and still completed.
    pub fn retried(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed && t.retry_count > 0)
            .count()
    }

    pub fn success(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    /// Process exit code: 0 if everything completed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Progress bar over a fixed number of experiments.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    pub fn on_submitted(&self, count: usize) {
        println!("Submitted {} experiments", count);

        let pb = indicatif::ProgressBar::new(count as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    pub fn on_finished(&self, task: &TaskSnapshot) {
        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pb) = progress.as_ref() else {
            return;
        };
        pb.inc(1);

        let status = match task.status {
            TaskStatus::Completed => console::style("DONE").green(),
            TaskStatus::Failed => console::style("FAIL").red(),
            TaskStatus::TimedOut => console::style("TIME").red(),
            TaskStatus::Cancelled => console::style("CNCL").yellow(),
            _ => console::style("????").dim(),
        };

        if self.verbose || task.status != TaskStatus::Completed {
            let server = task.server.as_deref().unwrap_or("-");
            pb.println(format!("{} {} ({})", status, task.id, server));
        }
    }

    pub fn finish(&self) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }
    }
}

/// Prints a summary of the run with colored counts.
///
/// `latest` looks up the newest stored result of a task, used to show the
/// metrics of completed experiments and the error of failed ones.
pub fn print_summary(
    summary: &RunSummary,
    latest: impl Fn(&str) -> Option<ExperimentResult>,
) {
    println!();
    println!("Experiment Results:");
    println!("  Total:     {}", summary.tasks.len());
    println!("  Completed: {}", console::style(summary.completed()).green());
    println!("  Failed:    {}", console::style(summary.failed()).red());

    if summary.timed_out() > 0 {
        println!("  Timed out: {}", console::style(summary.timed_out()).red());
    }
    if summary.cancelled() > 0 {
        println!("  Cancelled: {}", console::style(summary.cancelled()).yellow());
    }
    if summary.retried() > 0 {
        println!("  Retried:   {}", console::style(summary.retried()).yellow());
    }

    println!("  Duration:  {:?}", summary.duration);

    for task in summary.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
        let Some(result) = latest(&task.id) else {
            continue;
        };
        if result.metrics.is_empty() {
            continue;
        }
        let metrics: Vec<String> = result
            .metrics
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        println!("    {} {}", task.id, console::style(metrics.join(" ")).dim());
    }

    println!();
    if summary.success() {
        println!("{}", console::style("All experiments completed!").green().bold());
        return;
    }

    println!("{}", console::style("Some experiments did not complete.").red().bold());
    println!();
    println!("Unsuccessful experiments:");
    for task in summary.tasks.iter().filter(|t| t.status != TaskStatus::Completed) {
        println!("  - {} [{}]", task.id, task.status);
        let message = latest(&task.id)
            .and_then(|r| r.error_message)
            .or_else(|| task.last_error.clone());
        if let Some(msg) = message {
            println!("    {}", console::style(msg).dim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, TaskSpec};

    fn summary(statuses: &[TaskStatus]) -> RunSummary {
        let scheduler = Scheduler::default();
        let mut tasks = Vec::new();
        for (i, status) in statuses.iter().enumerate() {
            let id = scheduler
                .submit(TaskSpec::new("shell", serde_json::Value::Null).id(format!("t{i}")))
                .unwrap();
            let mut snapshot = scheduler.snapshot(&id).unwrap();
            snapshot.status = *status;
            tasks.push(snapshot);
        }
        RunSummary {
            tasks,
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_exit_code() {
        let ok = summary(&[TaskStatus::Completed, TaskStatus::Completed]);
        assert!(ok.success());
        assert_eq!(ok.exit_code(), 0);

        let bad = summary(&[TaskStatus::Completed, TaskStatus::TimedOut, TaskStatus::Failed]);
        assert_eq!(bad.exit_code(), 1);
        assert_eq!(bad.completed(), 1);
        assert_eq!(bad.timed_out(), 1);
        assert_eq!(bad.failed(), 1);
    }
}
