//! End-to-end scheduling scenarios against an in-memory executor.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use labgrid::config::{ServerConfig, load_config_str};
use labgrid::framework::{ExperimentRequest, Framework};
use labgrid::lifecycle::{Experiment, ExperimentContext, ExperimentError, Metrics};
use labgrid::registry::{ExperimentMetadata, ExperimentRegistry};
use labgrid::remote::{Command, ExecResult, RemoteError, RemoteExecutor, RemoteResult};
use labgrid::results::{ExperimentResult, MetricValue, ResultStatus, ResultStore};
use labgrid::scheduler::{CancelOutcome, TaskStatus};

const WAIT: Option<Duration> = Some(Duration::from_secs(20));

/// Commands named `hang` block until dropped; servers listed in `down`
/// fail their probes.
#[derive(Default)]
struct FakeExecutor {
    down: Mutex<Vec<String>>,
}

impl FakeExecutor {
    fn take_down(&self, server: &str) {
        self.down.lock().unwrap().push(server.to_string());
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(&self, _server: &ServerConfig, cmd: &Command) -> RemoteResult<ExecResult> {
        if cmd.program == "hang" {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        })
    }

    async fn upload(&self, _: &ServerConfig, _: &Path, _: &str) -> RemoteResult<()> {
        Ok(())
    }

    async fn download(&self, _: &ServerConfig, _: &str, _: &Path) -> RemoteResult<()> {
        Ok(())
    }

    async fn probe(&self, server: &ServerConfig) -> RemoteResult<()> {
        if self.down.lock().unwrap().contains(&server.name) {
            return Err(RemoteError::connection(server, "no route to host"));
        }
        Ok(())
    }
}

/// Shared knobs for the test experiment.
#[derive(Default)]
struct Recorder {
    /// Task ids in the order their execute stage started.
    started: Mutex<Vec<String>>,
    executions: AtomicUsize,
    /// Fail every execute stage.
    fail: AtomicBool,
    /// If set, execute waits for a permit.
    gate: Option<Arc<Semaphore>>,
}

struct RecordingExperiment {
    recorder: Arc<Recorder>,
    /// Server on which execute hangs, `*` for all.
    hang_on: Option<String>,
}

#[async_trait]
impl Experiment for RecordingExperiment {
    async fn execute(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        self.recorder.started.lock().unwrap().push(ctx.task_id.clone());
        self.recorder.executions.fetch_add(1, Ordering::SeqCst);
        ctx.report_progress(0.5);

        if let Some(gate) = &self.recorder.gate {
            let _permit = gate.acquire().await.map_err(anyhow::Error::from)?;
        }
        let hang = match self.hang_on.as_deref() {
            Some("*") => true,
            Some(server) => server == ctx.server.name,
            None => false,
        };
        if hang {
            ctx.run(&Command::new("hang")).await?;
        }
        if self.recorder.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("simulated failure").into());
        }
        ctx.run_checked(&Command::new("true")).await?;
        Ok(())
    }

    async fn analyze_data(&mut self, ctx: &ExperimentContext) -> Result<Metrics, ExperimentError> {
        Ok(Metrics::from([(
            "attempt".to_string(),
            MetricValue::Number(ctx.attempt as f64),
        )]))
    }
}

fn framework(servers: &str, recorder: Arc<Recorder>, executor: Arc<FakeExecutor>) -> Framework {
    let config = load_config_str(&format!(
        r#"
        [labgrid]
        workers = 3
        poll_interval_ms = 10
        health_check_interval_secs = 0

        [labgrid.backoff]
        type = "fixed"
        delay_ms = 0

        {servers}
        "#
    ))
    .unwrap();

    let mut registry = ExperimentRegistry::with_builtin();
    let for_recorder = recorder.clone();
    registry.register(
        "record",
        move |config| {
            Ok(Box::new(RecordingExperiment {
                recorder: for_recorder.clone(),
                hang_on: config["hang_on"].as_str().map(str::to_string),
            }) as Box<dyn Experiment>)
        },
        ExperimentMetadata::new("records its attempts"),
    );
    registry.register(
        "hang",
        move |_| {
            Ok(Box::new(RecordingExperiment {
                recorder: recorder.clone(),
                hang_on: Some("*".to_string()),
            }) as Box<dyn Experiment>)
        },
        ExperimentMetadata::new("never finishes"),
    );

    Framework::new(config, registry, executor)
}

const ONE_SLOT: &str = r#"
    [[servers]]
    name = "a"
    host = "10.0.0.1"
    max_concurrent_tasks = 1
"#;

const TWO_SERVERS: &str = r#"
    [[servers]]
    name = "a"
    host = "10.0.0.1"

    [[servers]]
    name = "b"
    host = "10.0.0.2"
"#;

fn record_request(id: &str) -> ExperimentRequest {
    ExperimentRequest::new("record", serde_json::json!({})).id(id)
}

async fn wait_until_running(framework: &Framework, id: &str) {
    for _ in 0..2000 {
        if framework.get_experiment_status(id).unwrap().status == TaskStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{id} never started");
}

#[tokio::test]
async fn higher_priority_starts_first() {
    let recorder = Arc::new(Recorder::default());
    let framework = framework(ONE_SLOT, recorder.clone(), Arc::default());

    framework
        .submit_experiment(record_request("t2").priority(1))
        .unwrap();
    framework
        .submit_experiment(record_request("t1").priority(10))
        .unwrap();
    framework.start().unwrap();

    for id in ["t1", "t2"] {
        let task = framework.wait_for_experiment(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert_eq!(*recorder.started.lock().unwrap(), vec!["t1", "t2"]);

    let t1 = framework.get_experiment_status("t1").unwrap();
    let t2 = framework.get_experiment_status("t2").unwrap();
    assert!(t1.started_at.unwrap() <= t2.started_at.unwrap());

    framework.shutdown().await;
}

#[tokio::test]
async fn dependent_waits_for_completion() {
    let gate = Arc::new(Semaphore::new(0));
    let recorder = Arc::new(Recorder {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let framework = framework(TWO_SERVERS, recorder.clone(), Arc::default());
    framework.start().unwrap();

    framework
        .submit_experiment(record_request("t2").depends_on("t1").priority(100))
        .unwrap();
    assert_eq!(
        framework.get_experiment_status("t2").unwrap().status,
        TaskStatus::Pending
    );

    framework.submit_experiment(record_request("t1")).unwrap();
    wait_until_running(&framework, "t1").await;
    // A free server is available, but t2 must keep waiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        framework.get_experiment_status("t2").unwrap().status,
        TaskStatus::Pending
    );

    gate.add_permits(10);
    let t2 = framework.wait_for_experiment("t2", WAIT).await.unwrap();
    let t1 = framework.get_experiment_status("t1").unwrap();

    assert_eq!(t1.status, TaskStatus::Completed);
    assert_eq!(t2.status, TaskStatus::Completed);
    assert!(t2.started_at.unwrap() >= t1.ended_at.unwrap());

    framework.shutdown().await;
}

#[tokio::test]
async fn running_experiment_reports_progress() {
    let gate = Arc::new(Semaphore::new(0));
    let recorder = Arc::new(Recorder {
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let framework = framework(ONE_SLOT, recorder.clone(), Arc::default());
    framework.start().unwrap();
    framework.submit_experiment(record_request("t1")).unwrap();
    wait_until_running(&framework, "t1").await;

    let mut progress = 0.0;
    for _ in 0..2000 {
        progress = framework.get_experiment_status("t1").unwrap().progress;
        if progress > 0.0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(progress, 0.5);
    assert!(!framework.update_experiment_progress("ghost", 0.9));

    gate.add_permits(1);
    let done = framework.wait_for_experiment("t1", WAIT).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 1.0);
    assert!(!framework.update_experiment_progress("t1", 0.2));

    framework.shutdown().await;
}

#[tokio::test]
async fn failing_experiment_is_retried_then_fails() {
    let recorder = Arc::new(Recorder::default());
    recorder.fail.store(true, Ordering::SeqCst);
    let framework = framework(TWO_SERVERS, recorder.clone(), Arc::default());
    framework.start().unwrap();

    framework
        .submit_experiment(record_request("flaky").max_retries(2))
        .unwrap();
    let task = framework.wait_for_experiment("flaky", WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(recorder.executions.load(Ordering::SeqCst), 3);
    assert!(task.last_error.unwrap().contains("simulated failure"));

    let history = framework.results().history("flaky").unwrap();
    assert_eq!(history.len(), 3);
    for (i, result) in history.iter().enumerate() {
        assert_eq!(result.attempt, i as u32 + 1);
        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.server.is_some());
    }
    assert_eq!(framework.get_cluster_summary().running_tasks, 0);

    framework.shutdown().await;
}

#[tokio::test]
async fn lost_server_sends_task_back_to_retry() {
    let recorder = Arc::new(Recorder::default());
    let executor = Arc::new(FakeExecutor::default());
    let framework = framework(TWO_SERVERS, recorder.clone(), executor.clone());
    framework.start().unwrap();

    // Ties break by name, so the first attempt lands on "a" and hangs there.
    framework
        .submit_experiment(
            ExperimentRequest::new("record", serde_json::json!({"hang_on": "a"}))
                .id("job")
                .max_retries(1),
        )
        .unwrap();
    wait_until_running(&framework, "job").await;
    assert_eq!(
        framework.get_experiment_status("job").unwrap().server.as_deref(),
        Some("a")
    );

    executor.take_down("a");
    let report = framework.health_check().await;
    assert_eq!(report.unreachable, vec!["a".to_string()]);
    assert_eq!(report.lost.len(), 1);
    assert_eq!(report.lost[0].task, "job");

    let task = framework.wait_for_experiment("job", WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.server.as_deref(), Some("b"));

    let history = framework.results().history("job").unwrap();
    assert_eq!(history[0].status, ResultStatus::Failed);
    assert_eq!(history[0].server.as_deref(), Some("a"));
    assert!(history[0].error_message.as_deref().unwrap().contains("unreachable"));
    assert_eq!(history[1].status, ResultStatus::Completed);

    let summary = framework.get_cluster_summary();
    assert_eq!(summary.unreachable, 1);
    assert_eq!(summary.running_tasks, 0);

    framework.shutdown().await;
}

#[tokio::test]
async fn attempt_past_its_timeout_is_timed_out() {
    let framework = framework(ONE_SLOT, Arc::default(), Arc::default());
    framework.start().unwrap();

    framework
        .submit_experiment(
            ExperimentRequest::new("hang", serde_json::Value::Null)
                .id("slow")
                .timeout(Duration::from_millis(100)),
        )
        .unwrap();
    framework.submit_experiment(record_request("next")).unwrap();

    let slow = framework.wait_for_experiment("slow", WAIT).await.unwrap();
    assert_eq!(slow.status, TaskStatus::TimedOut);
    assert_eq!(
        framework.get_experiment_result("slow").unwrap().status,
        ResultStatus::TimedOut
    );

    // The slot was given back.
    let next = framework.wait_for_experiment("next", WAIT).await.unwrap();
    assert_eq!(next.status, TaskStatus::Completed);

    framework.shutdown().await;
}

#[tokio::test]
async fn cancel_running_experiment() {
    let framework = framework(ONE_SLOT, Arc::default(), Arc::default());
    framework.start().unwrap();

    framework
        .submit_experiment(ExperimentRequest::new("hang", serde_json::Value::Null).id("long"))
        .unwrap();
    framework
        .submit_experiment(record_request("after").depends_on("long"))
        .unwrap();
    wait_until_running(&framework, "long").await;

    assert_eq!(
        framework.cancel_experiment("long").unwrap(),
        CancelOutcome::Requested
    );
    let long = framework.wait_for_experiment("long", WAIT).await.unwrap();
    assert_eq!(long.status, TaskStatus::Cancelled);

    let cancelled = framework.get_experiment_result("long").unwrap();
    assert_eq!(cancelled.status, ResultStatus::Cancelled);
    assert_eq!(cancelled.stages.last(), Some(&labgrid::lifecycle::Stage::Failed));

    let after = framework.wait_for_experiment("after", WAIT).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert!(framework.get_experiment_result("after").is_err());

    framework.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_running_experiments() {
    let framework = framework(ONE_SLOT, Arc::default(), Arc::default());
    framework.start().unwrap();

    framework
        .submit_experiment(ExperimentRequest::new("hang", serde_json::Value::Null).id("long"))
        .unwrap();
    wait_until_running(&framework, "long").await;

    tokio::time::timeout(Duration::from_secs(10), framework.shutdown())
        .await
        .unwrap();
    assert_eq!(
        framework.get_experiment_status("long").unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(!framework.get_framework_status().running);
}

#[test]
fn saving_twice_keeps_both_versions() {
    let store = ResultStore::new();
    let mut first = ExperimentResult::new("exp", "record", ResultStatus::Failed, Utc::now());
    first.error_message = Some("first".into());
    let second = ExperimentResult::new("exp", "record", ResultStatus::Completed, Utc::now());

    assert_eq!(store.save(first), 1);
    assert_eq!(store.save(second), 2);

    let latest = store.get("exp").unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.status, ResultStatus::Completed);

    let history = store.history("exp").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].error_message.as_deref(), Some("first"));
    assert_eq!(store.get_version("exp", 1).unwrap().status, ResultStatus::Failed);
}
