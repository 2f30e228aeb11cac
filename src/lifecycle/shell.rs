//! Built-in `shell` experiment type.
//!
//! Drives an experiment entirely from configured shell commands, which
//! covers most "run a script on a box and grab its outputs" workloads
//! without writing any Rust.
//!
//! # Parameters
//!
//! | Key | Stage | Description |
//! |-----|-------|-------------|
//! | `workdir` | all | Remote working directory, created during INIT |
//! | `setup` | INIT | Commands run before the experiment |
//! | `command` | EXECUTING | The experiment itself (required) |
//! | `env` | all | Environment variables for every command |
//! | `collect` | COLLECTING | Remote files to download |
//! | `metrics_file` | COLLECTING | Remote JSON object of metrics |
//! | `output_dir` | SAVING | Local directory receiving artifacts |
//! | `cleanup` | CLEANUP | Commands run at the end, success or not |
//!
//! ```toml
//! [[experiments]]
//! name = "train-small"
//! type = "shell"
//!
//! [experiments.params]
//! workdir = "/data/runs/train-small"
//! setup = ["git -C /data/src pull"]
//! command = "python /data/src/train.py --out ."
//! collect = ["train.log", "model.pt"]
//! metrics_file = "metrics.json"
//! output_dir = "results"
//! cleanup = ["rm -f model.pt"]
//! ```
//!
//! # Metrics
//!
//! Any stdout line of the form `METRIC name=value` becomes a metric, as do
//! the entries of `metrics_file`. Values that parse as numbers are stored
//! as numbers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Experiment, ExperimentContext, ExperimentError, Metrics, local_target};
use crate::remote::Command;
use crate::results::MetricValue;

/// Type name the experiment is registered under.
pub const SHELL_EXPERIMENT: &str = "shell";

const METRIC_PREFIX: &str = "METRIC ";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellParams {
    pub workdir: Option<String>,

    #[serde(default)]
    pub setup: Vec<String>,

    pub command: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub collect: Vec<String>,

    pub metrics_file: Option<String>,

    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub cleanup: Vec<String>,

    /// Per-command limit on top of the task timeout.
    pub command_timeout_secs: Option<u64>,
}

/// Experiment driven by [`ShellParams`].
pub struct ShellExperiment {
    params: ShellParams,
    stdout: String,
    collected: Vec<PathBuf>,
    file_metrics: Metrics,
    metrics: Metrics,
}

impl ShellExperiment {
    pub fn new(params: ShellParams) -> Self {
        Self {
            params,
            stdout: String::new(),
            collected: Vec::new(),
            file_metrics: Metrics::new(),
            metrics: Metrics::new(),
        }
    }

    /// Builds the experiment from a task configuration payload.
    ///
    /// ```
    /// use labgrid::lifecycle::shell::ShellExperiment;
    ///
    /// let config = serde_json::json!({ "command": "./bench.sh", "setup": ["make"] });
    /// assert!(ShellExperiment::from_config(&config).is_ok());
    /// assert!(ShellExperiment::from_config(&serde_json::json!({})).is_err());
    /// ```
    pub fn from_config(config: &serde_json::Value) -> anyhow::Result<Self> {
        let params: ShellParams = serde_json::from_value(config.clone())
            .context("Invalid parameters for shell experiment")?;
        Ok(Self::new(params))
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::shell(script);
        if let Some(dir) = &self.params.workdir {
            cmd = cmd.working_dir(dir.clone());
        }
        for (key, value) in &self.params.env {
            cmd = cmd.env(key.clone(), value.clone());
        }
        if let Some(secs) = self.params.command_timeout_secs {
            cmd = cmd.timeout(Duration::from_secs(secs));
        }
        cmd
    }

    fn remote_path(&self, path: &str) -> String {
        match &self.params.workdir {
            Some(dir) if !path.starts_with('/') => {
                format!("{}/{}", dir.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        }
    }

    /// Directory collected files land in. Falls back to the scratch
    /// directory, which disappears after the run.
    fn local_dir(&self, ctx: &ExperimentContext) -> PathBuf {
        match &self.params.output_dir {
            Some(dir) => dir.join(&ctx.task_id),
            None => ctx.scratch_dir().join("collected"),
        }
    }
}

/// Extracts `METRIC name=value` lines.
pub fn parse_metric_lines(output: &str) -> Metrics {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(METRIC_PREFIX))
        .filter_map(|rest| rest.split_once('='))
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.trim().to_string(), MetricValue::parse(value)))
        .collect()
}

/// Reads a JSON object of metrics. Non-scalar values are kept as their JSON
/// text.
fn parse_metrics_json(content: &str) -> anyhow::Result<Metrics> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(content).context("metrics file is not a JSON object")?;

    Ok(object
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .map(MetricValue::number)
                    .unwrap_or_else(|| MetricValue::Text(n.to_string())),
                serde_json::Value::String(s) => MetricValue::parse(&s),
                other => MetricValue::Text(other.to_string()),
            };
            (name, value)
        })
        .collect())
}

#[async_trait]
impl Experiment for ShellExperiment {
    async fn initialize(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        if let Some(dir) = &self.params.workdir {
            ctx.run_checked(&Command::new("mkdir").arg("-p").arg(dir.clone()))
                .await?;
        }
        for script in &self.params.setup {
            debug!("[{}] setup: {}", ctx.task_id, script);
            ctx.run_checked(&self.command(script)).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        info!(
            "[{}] Running on {} (attempt {}): {}",
            ctx.task_id, ctx.server.name, ctx.attempt, self.params.command
        );
        let result = ctx.run_checked(&self.command(&self.params.command)).await?;
        self.stdout = result.stdout;
        Ok(())
    }

    async fn collect_data(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        let dir = self.local_dir(ctx);
        for path in &self.params.collect {
            let target = local_target(&dir, path);
            ctx.download(&self.remote_path(path), &target).await?;
            self.collected.push(target);
        }

        if let Some(file) = &self.params.metrics_file {
            let target = ctx.scratch_dir().join("metrics.json");
            ctx.download(&self.remote_path(file), &target).await?;
            let content = tokio::fs::read_to_string(&target)
                .await
                .context("reading downloaded metrics file")?;
            self.file_metrics = parse_metrics_json(&content)?;
        }
        Ok(())
    }

    async fn analyze_data(&mut self, _ctx: &ExperimentContext) -> Result<Metrics, ExperimentError> {
        let mut metrics = parse_metric_lines(&self.stdout);
        metrics.extend(std::mem::take(&mut self.file_metrics));
        self.metrics = metrics.clone();
        Ok(metrics)
    }

    async fn save_data(&mut self, ctx: &ExperimentContext) -> Result<Vec<String>, ExperimentError> {
        if self.params.output_dir.is_none() {
            // Nothing is kept locally; point at the files on the server.
            return Ok(self
                .params
                .collect
                .iter()
                .map(|p| format!("{}:{}", ctx.server.name, self.remote_path(p)))
                .collect());
        }

        let dir = self.local_dir(ctx);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let stdout_path = dir.join("stdout.log");
        tokio::fs::write(&stdout_path, &self.stdout)
            .await
            .context("writing stdout.log")?;

        let metrics_path = dir.join("metrics.json");
        let metrics_json =
            serde_json::to_vec_pretty(&self.metrics).context("serializing metrics")?;
        tokio::fs::write(&metrics_path, metrics_json)
            .await
            .context("writing metrics.json")?;

        let mut artifacts: Vec<String> = self
            .collected
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        artifacts.push(stdout_path.display().to_string());
        artifacts.push(metrics_path.display().to_string());
        Ok(artifacts)
    }

    async fn cleanup(&mut self, ctx: &ExperimentContext) -> Result<(), ExperimentError> {
        for script in &self.params.cleanup {
            debug!("[{}] cleanup: {}", ctx.task_id, script);
            ctx.run_checked(&self.command(script)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{LocalExecutorConfig, ServerConfig};
    use crate::lifecycle::{
        AbortHandle, AbortReason, LifecycleController, LifecycleError, RunOutcome, Stage,
    };
    use crate::remote::local::LocalExecutor;

    #[test]
    fn test_parse_metric_lines() {
        let metrics = parse_metric_lines(
            "epoch 1\nMETRIC loss=0.25\n  METRIC optimizer = adam\nMETRIC broken\nMETRIC =3\n",
        );
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["loss"], MetricValue::Number(0.25));
        assert_eq!(metrics["optimizer"], MetricValue::Text("adam".into()));

        let metrics = parse_metric_lines("METRIC loss=nan\nMETRIC grad=-inf\n");
        assert_eq!(metrics["loss"], MetricValue::Text("nan".into()));
        assert_eq!(metrics["grad"], MetricValue::Text("-inf".into()));
    }

    #[test]
    fn test_parse_metrics_json() {
        let metrics =
            parse_metrics_json(r#"{"acc": 0.9, "steps": 100, "run": "a", "shape": [1, 2]}"#)
                .unwrap();
        assert_eq!(metrics["acc"], MetricValue::Number(0.9));
        assert_eq!(metrics["steps"], MetricValue::Number(100.0));
        assert_eq!(metrics["run"], MetricValue::Text("a".into()));
        assert_eq!(metrics["shape"], MetricValue::Text("[1,2]".into()));
        assert!(parse_metrics_json("[1, 2]").is_err());
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = ShellExperiment::from_config(&serde_json::json!({
            "command": "true",
            "comand": "typo",
        }));
        assert!(err.is_err());
    }

    #[test]
    fn test_remote_path() {
        let exp = ShellExperiment::from_config(&serde_json::json!({
            "command": "true",
            "workdir": "/runs/a/",
        }))
        .unwrap();
        assert_eq!(exp.remote_path("out.txt"), "/runs/a/out.txt");
        assert_eq!(exp.remote_path("/etc/hosts"), "/etc/hosts");
    }

    async fn run_local(config: serde_json::Value) -> (crate::lifecycle::LifecycleReport, tempfile::TempDir) {
        run_local_with(config, AbortHandle::new()).await
    }

    async fn run_local_with(
        config: serde_json::Value,
        abort: AbortHandle,
    ) -> (crate::lifecycle::LifecycleReport, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let executor = Arc::new(LocalExecutor::new(LocalExecutorConfig {
            root_dir: root.path().to_path_buf(),
            ..Default::default()
        }));
        let ctx = ExperimentContext::new(
            "shell-1",
            SHELL_EXPERIMENT,
            config.clone(),
            ServerConfig::new("node", "localhost"),
            executor,
            abort,
            1,
        )
        .unwrap();
        let experiment = ShellExperiment::from_config(&config).unwrap();
        let report = LifecycleController::new()
            .run(Box::new(experiment), &ctx)
            .await;
        (report, root)
    }

    #[tokio::test]
    async fn test_full_run_on_local_executor() {
        let out = tempfile::tempdir().unwrap();
        let (report, root) = run_local(serde_json::json!({
            "workdir": "run",
            "setup": ["echo '{\"acc\": 0.75}' > metrics.json"],
            "command": "echo hello > out.txt; echo 'METRIC loss=0.5'",
            "collect": ["out.txt"],
            "metrics_file": "metrics.json",
            "output_dir": out.path(),
            "cleanup": ["rm out.txt"],
        }))
        .await;

        assert_eq!(report.outcome, RunOutcome::Completed, "{:?}", report.error);
        assert_eq!(report.metrics["loss"], MetricValue::Number(0.5));
        assert_eq!(report.metrics["acc"], MetricValue::Number(0.75));
        assert_eq!(report.artifacts.len(), 3);

        let saved = out.path().join("shell-1");
        assert_eq!(
            std::fs::read_to_string(saved.join("out.txt")).unwrap().trim(),
            "hello"
        );
        assert!(saved.join("metrics.json").is_file());
        assert!(!root.path().join("node/run/out.txt").exists());
    }

    #[tokio::test]
    async fn test_failing_command_fails_executing_stage() {
        let (report, root) = run_local(serde_json::json!({
            "command": "echo nope >&2; exit 4",
            "cleanup": ["touch cleaned"],
        }))
        .await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        match &report.error {
            Some(LifecycleError::Stage { stage, message }) => {
                assert_eq!(*stage, Stage::Executing);
                assert!(message.contains("exited with code 4"));
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(root.path().join("node/cleaned").exists());
    }

    #[tokio::test]
    async fn test_cleanup_commands_run_after_timeout() {
        let abort = AbortHandle::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.abort(AbortReason::TimedOut);
        });

        let (report, root) = run_local_with(
            serde_json::json!({
                "command": "sleep 5",
                "cleanup": ["touch cleaned"],
            }),
            abort,
        )
        .await;

        assert_eq!(report.outcome, RunOutcome::Aborted(AbortReason::TimedOut));
        assert_eq!(report.cleanup_error, None);
        assert!(root.path().join("node/cleaned").exists());
    }
}
