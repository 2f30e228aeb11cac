//! Remote execution interface for running experiment commands on servers.
//!
//! This module defines the abstraction the rest of labgrid uses to talk to
//! the machines of the server pool. Everything above this layer (the
//! lifecycle controller, the health monitor) only ever sees
//! [`RemoteExecutor`], so the transport is pluggable.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RemoteExecutor                          │
//! │  (one instance shared by every worker)                      │
//! │                                                             │
//! │  execute(server, Command) ───► ExecResult                   │
//! │  upload(server, local, remote)                              │
//! │  download(server, remote, local)                            │
//! │  probe(server)                                              │
//! └────────────────────────────────┬────────────────────────────┘
//!                                  │
//!                  ┌───────────────┴───────────────┐
//!                  ▼                               ▼
//!            SshExecutor                     LocalExecutor
//!         (ssh / scp binaries)         (child processes, one dir
//!                                          per server name)
//! ```
//!
//! # Built-in Executors
//!
//! | Executor | Module | Description |
//! |----------|--------|-------------|
//! | SSH | [`ssh`] | Run commands on remote hosts via the system `ssh` |
//! | Local | [`local`] | Run commands as local child processes |
//!
//! # Error Handling
//!
//! A command that runs and exits non-zero is NOT an error: it comes back as
//! an [`ExecResult`] with a non-zero `exit_code`. [`RemoteError::Connection`]
//! is reserved for failures to reach the server at all, which the framework
//! uses to mark the server unreachable.

pub mod local;
pub mod ssh;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ExecutorConfig, ServerConfig};

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur while talking to a server.
///
/// - **Server-level**: `Connection` - the server could not be reached
/// - **Command-level**: `ExecFailed`, `Timeout` - this command failed
/// - **Transfer**: `UploadFailed`, `DownloadFailed`
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The server could not be reached (refused, unresolvable, auth failure).
    #[error("Connection to {server} failed: {message}")]
    Connection { server: String, message: String },

    /// The command could not be started or communication failed.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The command ran longer than its own timeout.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to upload file: {0}")]
    UploadFailed(String),

    #[error("Failed to download file: {0}")]
    DownloadFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn connection(server: &ServerConfig, message: impl Into<String>) -> Self {
        RemoteError::Connection {
            server: server.name.clone(),
            message: message.into(),
        }
    }

    /// Returns `true` if the error means the server itself is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection { .. })
    }
}

/// A command to execute on a server.
///
/// # Example
///
/// ```
/// use labgrid::remote::Command;
/// use std::time::Duration;
///
/// let cmd = Command::new("python")
///     .arg("train.py")
///     .args(["--epochs", "10"])
///     .working_dir("/data/run-1")
///     .env("CUDA_VISIBLE_DEVICES", "0")
///     .timeout(Duration::from_secs(600));
///
/// assert_eq!(cmd.program, "python");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,

    /// Directory the command runs in. If `None`, the executor's default.
    pub working_dir: Option<String>,

    pub env: Vec<(String, String)>,

    /// The executor kills the command and returns [`RemoteError::Timeout`]
    /// when it runs longer than this.
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// A command that runs `script` through `sh -c`.
    ///
    /// Used for user-supplied command lines that may contain pipes,
    /// redirections or `&&`.
    ///
    /// ```
    /// use labgrid::remote::Command;
    /// let cmd = Command::shell("make && ./bench > out.txt");
    /// assert_eq!(cmd.to_shell_string(), "sh -c 'make && ./bench > out.txt'");
    /// ```
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// ```
    /// use labgrid::remote::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }

    /// The full script sent to a remote shell: exports, `cd`, then the
    /// command itself.
    pub fn to_remote_script(&self) -> String {
        let mut script = String::new();
        for (key, value) in &self.env {
            script.push_str(&format!("export {}={}; ", key, shell_escape(value)));
        }
        if let Some(dir) = &self.working_dir {
            script.push_str(&format!("cd {} && ", shell_escape(dir)));
        }
        script.push_str(&self.to_shell_string());
        script
    }
}

/// Result of executing a command on a server.
///
/// ```
/// use labgrid::remote::ExecResult;
/// use std::time::Duration;
///
/// let result = ExecResult {
///     exit_code: 0,
///     stdout: "METRIC loss=0.12".to_string(),
///     stderr: String::new(),
///     duration: Duration::from_secs(5),
/// };
/// assert!(result.success());
/// ```
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport used to run commands and move files on pool servers.
///
/// # Thread Safety
///
/// A single executor is shared by every worker through an `Arc`, so
/// implementations must be `Send + Sync` and must not hold per-call state.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `cmd` on `server` and waits for it to exit.
    ///
    /// # Errors
    ///
    /// - `RemoteError::Connection` - the server could not be reached
    /// - `RemoteError::Timeout` - `cmd.timeout` elapsed
    /// - `RemoteError::ExecFailed` - the command could not be started
    async fn execute(&self, server: &ServerConfig, cmd: &Command) -> RemoteResult<ExecResult>;

    /// Copies a local file or directory to `remote` on the server.
    async fn upload(&self, server: &ServerConfig, local: &Path, remote: &str) -> RemoteResult<()>;

    /// Copies `remote` from the server to a local path.
    async fn download(&self, server: &ServerConfig, remote: &str, local: &Path)
    -> RemoteResult<()>;

    /// Checks that the server answers at all.
    ///
    /// The default runs `true` and treats any non-zero exit as a
    /// connection failure.
    async fn probe(&self, server: &ServerConfig) -> RemoteResult<()> {
        let result = self
            .execute(server, &Command::new("true").timeout(Duration::from_secs(30)))
            .await?;
        if result.success() {
            Ok(())
        } else {
            Err(RemoteError::connection(
                server,
                format!("probe exited with code {}", result.exit_code),
            ))
        }
    }
}

/// Builds the executor selected by the configuration.
pub fn from_config(config: &ExecutorConfig) -> Arc<dyn RemoteExecutor> {
    match config {
        ExecutorConfig::Ssh(ssh) => Arc::new(ssh::SshExecutor::new(ssh.clone())),
        ExecutorConfig::Local(local) => Arc::new(local::LocalExecutor::new(local.clone())),
    }
}

/// Escape a string for use in a shell command.
pub(crate) fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Runs a prepared process to completion, honouring the command timeout.
///
/// The process is spawned with `kill_on_drop`, so dropping the returned
/// future (an aborted experiment) tears the child down.
pub(crate) async fn run_process(
    mut process: tokio::process::Command,
    timeout: Option<Duration>,
) -> RemoteResult<ExecResult> {
    let start = std::time::Instant::now();
    process.kill_on_drop(true);

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, process.output())
            .await
            .map_err(|_| RemoteError::Timeout(limit))?,
        None => process.output().await,
    }
    .map_err(|e| RemoteError::ExecFailed(e.to_string()))?;

    Ok(ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration: start.elapsed(),
    })
}
