//! labgrid: experiment orchestration across a pool of remote machines.
//!
//! Experiments are submitted as tasks with a priority and dependencies on
//! other tasks. Workers lease a slot on a server, drive the experiment
//! through a fixed lifecycle and store a versioned result for every
//! attempt.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Scheduler** ([`scheduler`]): task states, priority and dependency
//!   ordering, retries with backoff, cancellation
//! - **Resource pool** ([`pool`]): server capacity, leases, placement
//!   strategies, health
//! - **Lifecycle** ([`lifecycle`]): the INIT .. SAVING stages, CLEANUP and
//!   aborts
//! - **Results** ([`results`]): versioned store with search, comparison,
//!   retention and export
//! - **Remote** ([`remote`]): command execution over SSH or locally
//! - **Framework** ([`framework`]): ties the above together behind the
//!   caller-facing API
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
//!     let train = framework.submit_experiment(
//!         ExperimentRequest::new("shell", serde_json::json!({ "command": "python train.py" }))
//!             .id("train")
//!             .priority(10),
//!     )?;
//!     let eval = framework.submit_experiment(
//!         ExperimentRequest::new("shell", serde_json::json!({ "command": "python eval.py" }))
//!             .depends_on(train),
//!     )?;
//!
//!     framework.wait_for_experiment(&eval, None).await?;
//!     println!("{:?}", framework.get_experiment_result(&eval)?.metrics);
//!     framework.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod framework;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod remote;
pub mod report;
pub mod results;
pub mod scheduler;

/// Identifier of a task. Also the experiment identifier its results are
/// stored under.
pub type TaskId = String;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use framework::{ExperimentRequest, Framework, FrameworkError};
pub use lifecycle::{Experiment, ExperimentContext, ExperimentError};
pub use registry::ExperimentRegistry;
pub use remote::RemoteExecutor;
pub use results::{ExperimentResult, ResultStore};
pub use scheduler::{TaskSnapshot, TaskStatus};
