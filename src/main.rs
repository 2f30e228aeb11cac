//! labgrid CLI - run experiment manifests across a server pool.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use labgrid::config::{self, Config, ExecutorConfig};
use labgrid::framework::{ExperimentRequest, Framework};
use labgrid::pool::{ResourcePool, ResourceSample, ServerHealth};
use labgrid::registry::ExperimentRegistry;
use labgrid::remote;
use labgrid::report::{ConsoleReporter, RunSummary, print_summary};
use labgrid::results::ExportFormat;
use labgrid::scheduler::{Scheduler, TaskSpec};

#[derive(Parser)]
#[command(name = "labgrid")]
#[command(about = "Experiment orchestration across a pool of remote machines", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "labgrid.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every experiment of the manifest and wait for them
    Run {
        /// Override the number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Write the results export here (overrides [results] export_path)
        #[arg(long)]
        export: Option<PathBuf>,

        /// Export format (json, csv)
        #[arg(long)]
        format: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Probe every configured server once
    Health,

    /// Initialize a new configuration file
    Init {
        /// Executor type (ssh, local)
        #[arg(short, long, default_value = "local")]
        executor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            workers,
            export,
            format,
        } => run_experiments(&cli.config, workers, export, format, cli.verbose).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Health => health_check(&cli.config).await,
        Commands::Init { executor } => init_config(&cli.config, &executor),
    }
}

fn parse_format(format: &str) -> Result<ExportFormat> {
    match format.to_ascii_lowercase().as_str() {
        "json" => Ok(ExportFormat::Json),
        "csv" => Ok(ExportFormat::Csv),
        other => bail!("Unknown export format: {}. Use: json, csv", other),
    }
}

async fn run_experiments(
    config_path: &Path,
    workers_override: Option<usize>,
    export: Option<PathBuf>,
    format: Option<String>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(workers) = workers_override {
        config.labgrid.workers = workers.max(1);
    }
    let format = format.as_deref().map(parse_format).transpose()?;

    info!("Loaded configuration from {}", config_path.display());

    if config.experiments.is_empty() {
        warn!("No experiments to run");
        return Ok(());
    }
    if config.servers.is_empty() {
        bail!("No servers configured; add at least one [[servers]] entry");
    }

    let start = Instant::now();
    let experiments = config.experiments.clone();
    let framework = Framework::from_config(config);

    let mut ids = Vec::with_capacity(experiments.len());
    for experiment in &experiments {
        let id = framework
            .submit_experiment(ExperimentRequest::from(experiment))
            .with_context(|| format!("Failed to submit experiment '{}'", experiment.name))?;
        ids.push(id);
    }

    let reporter = ConsoleReporter::new(verbose);
    reporter.on_submitted(ids.len());
    framework.start()?;

    let mut waits: FuturesUnordered<_> = ids
        .iter()
        .map(|id| framework.wait_for_experiment(id, None))
        .collect();
    while let Some(finished) = waits.next().await {
        reporter.on_finished(&finished?);
    }
    drop(waits);
    reporter.finish();

    framework.shutdown().await;

    let summary = RunSummary {
        tasks: framework.list_tasks(None),
        duration: start.elapsed(),
    };
    print_summary(&summary, |id| framework.get_experiment_result(id).ok());

    match export {
        Some(path) => {
            let format = format.unwrap_or(framework.config().results.export_format.into());
            framework.results().export_to(&path, format)?;
            println!("Results written to {}", path.display());
        }
        None => {
            if framework.export_configured()?
                && let Some(path) = &framework.config().results.export_path
            {
                println!("Results written to {}", path.display());
            }
        }
    }

    if !summary.success() {
        std::process::exit(summary.exit_code());
    }
    Ok(())
}

/// Everything `validate_config` checks plus experiment types and the
/// dependency graph of the manifest.
fn check_manifest(config: &Config) -> Result<()> {
    let registry = ExperimentRegistry::with_builtin();
    let scheduler = Scheduler::default();

    for experiment in &config.experiments {
        registry
            .create(&experiment.experiment_type, &experiment.params_json())
            .with_context(|| format!("experiment '{}'", experiment.name))?;

        let mut spec = TaskSpec::new(experiment.experiment_type.clone(), serde_json::Value::Null)
            .id(experiment.name.clone());
        spec.dependencies = experiment.depends_on.clone();
        scheduler
            .submit(spec)
            .with_context(|| format!("experiment '{}'", experiment.name))?;
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let checked = config::load_config(config_path).and_then(|config| {
        check_manifest(&config)?;
        Ok(config)
    });

    match checked {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Workers: {}", config.labgrid.workers);
            println!("  Default timeout: {}s", config.labgrid.default_timeout_secs);
            println!("  Default retries: {}", config.labgrid.default_max_retries);
            println!(
                "  Allocation: {}",
                labgrid::pool::strategy_name(&config.allocation)
            );

            let executor_name = match &config.executor {
                ExecutorConfig::Ssh(_) => "ssh",
                ExecutorConfig::Local(_) => "local",
            };
            println!("  Executor: {}", executor_name);
            println!(
                "  Servers: {} ({} slots)",
                config.servers.len(),
                config
                    .servers
                    .iter()
                    .map(|s| s.max_concurrent_tasks)
                    .sum::<usize>()
            );
            println!("  Experiments: {}", config.experiments.len());

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn health_check(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let executor = remote::from_config(&config.executor);
    let pool = ResourcePool::new(config.servers.clone(), config.allocation.clone());
    let report = pool.health_check(executor.as_ref()).await;

    for server in pool.servers() {
        let health = match server.health {
            ServerHealth::Unreachable => console::style("UNREACHABLE").red(),
            ServerHealth::Busy => console::style("BUSY").yellow(),
            ServerHealth::Available => console::style("OK").green(),
        };
        println!("{:<12} {} ({})", health, server.name, server.host);
        if let Some(error) = &server.last_error {
            println!("             {}", console::style(error).dim());
        }
        if let Some(sample) = &server.resources {
            println!("             {}", console::style(describe_sample(sample)).dim());
        }
    }

    if !report.unreachable.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn describe_sample(sample: &ResourceSample) -> String {
    let mut parts = Vec::new();
    if let Some(load) = sample.load_average {
        parts.push(format!("load {:.2}", load));
    }
    if let Some(cpus) = sample.cpus {
        parts.push(format!("{} cpus", cpus));
    }
    if let Some(memory) = sample.memory_usage {
        parts.push(format!("mem {:.0}%", memory * 100.0));
    }
    if let Some(disk) = sample.disk_usage {
        parts.push(format!("disk {:.0}%", disk * 100.0));
    }
    parts.join(", ")
}

fn init_config(path: &Path, executor: &str) -> Result<()> {
    let executor_config = match executor {
        "local" => {
            r#"[executor]
type = "local"
root_dir = "/tmp/labgrid"
shell = "/bin/sh""#
        }
        "ssh" => {
            r#"[executor]
type = "ssh"
connect_timeout_secs = 30"#
        }
        _ => {
            eprintln!("Unknown executor: {}. Use: local, ssh", executor);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# labgrid configuration file

[labgrid]
workers = 4
default_timeout_secs = 3600
default_max_retries = 1
result_retention_days = 30

[labgrid.backoff]
type = "exponential"
base_ms = 1000
max_ms = 60000

[allocation]
strategy = "least_loaded"

{}

[[servers]]
name = "node-1"
host = "localhost"
max_concurrent_tasks = 2

[results]
export_path = "results/labgrid.json"
export_format = "json"

[[experiments]]
name = "hello"
type = "shell"
priority = 10
params = {{ command = "echo METRIC answer=42" }}

[[experiments]]
name = "followup"
type = "shell"
depends_on = ["hello"]
params = {{ command = "uname -a" }}
"#,
        executor_config
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  labgrid run");

    Ok(())
}
