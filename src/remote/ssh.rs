//! SSH executor implementation.
//!
//! Runs experiment commands on remote machines via the system `ssh` and
//! `scp` binaries. Connections are transient: every command spawns a new
//! `ssh` process, so there is no connection pool to keep healthy.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem per host) |
//! | File transfer | Via `scp -r` |
//! | Abort | Local `ssh` process is killed, remote shell gets SIGHUP |
//!
//! # Prerequisites
//!
//! - Key-based authentication (`BatchMode=yes`, password prompts fail)
//! - `ssh` and `scp` available locally
//!
//! # Failure Classification
//!
//! `ssh` exits with status 255 when it cannot connect or authenticate; any
//! other status belongs to the remote command. A 255 exit is therefore
//! reported as [`RemoteError::Connection`], everything else comes back as a
//! normal [`ExecResult`].

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::{Command, ExecResult, RemoteError, RemoteExecutor, RemoteResult, run_process};
use crate::config::{ServerConfig, SshExecutorConfig};

/// Exit status `ssh` uses for its own (connection/auth) failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Executor that reaches servers through the system `ssh`.
pub struct SshExecutor {
    config: SshExecutorConfig,
}

impl SshExecutor {
    /// ```
    /// use labgrid::remote::ssh::SshExecutor;
    /// use labgrid::config::SshExecutorConfig;
    ///
    /// let executor = SshExecutor::new(SshExecutorConfig::default());
    /// ```
    pub fn new(config: SshExecutorConfig) -> Self {
        Self { config }
    }

    /// `-o` options shared by ssh and scp.
    fn common_options(&self, server: &ServerConfig) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];

        if server.disable_host_key_check {
            opts.push("-o".to_string());
            opts.push("StrictHostKeyChecking=no".to_string());
            opts.push("-o".to_string());
            opts.push("UserKnownHostsFile=/dev/null".to_string());
        }

        if let Some(key_path) = &server.key_path {
            let key = shellexpand::tilde(&key_path.to_string_lossy()).into_owned();
            opts.push("-i".to_string());
            opts.push(key);
        }

        opts
    }

    pub(crate) fn ssh_args(&self, server: &ServerConfig, script: &str) -> Vec<String> {
        let mut args = self.common_options(server);
        args.push("-p".to_string());
        args.push(server.port.to_string());
        args.push(server.destination());
        args.push(script.to_string());
        args
    }

    /// scp takes the port as `-P` instead of `-p`.
    pub(crate) fn scp_args(&self, server: &ServerConfig, from: &str, to: &str) -> Vec<String> {
        let mut args = vec!["-r".to_string()];
        args.extend(self.common_options(server));
        args.push("-P".to_string());
        args.push(server.port.to_string());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    fn remote_path(server: &ServerConfig, path: &str) -> String {
        format!("{}:{}", server.destination(), path)
    }

    async fn scp(&self, server: &ServerConfig, from: &str, to: &str) -> RemoteResult<ExecResult> {
        let mut process = tokio::process::Command::new("scp");
        process.args(self.scp_args(server, from, to));
        run_process(process, None).await
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, server: &ServerConfig, cmd: &Command) -> RemoteResult<ExecResult> {
        let script = cmd.to_remote_script();
        debug!("[{}] ssh: {}", server.name, script);

        let mut process = tokio::process::Command::new("ssh");
        process.args(self.ssh_args(server, &script));

        let result = run_process(process, cmd.timeout).await?;
        if result.exit_code == SSH_CONNECTION_FAILURE {
            return Err(RemoteError::connection(server, result.stderr.trim()));
        }
        Ok(result)
    }

    async fn upload(&self, server: &ServerConfig, local: &Path, remote: &str) -> RemoteResult<()> {
        let result = self
            .scp(
                server,
                &local.to_string_lossy(),
                &Self::remote_path(server, remote),
            )
            .await
            .map_err(|e| RemoteError::UploadFailed(e.to_string()))?;

        match result.exit_code {
            0 => Ok(()),
            SSH_CONNECTION_FAILURE => Err(RemoteError::connection(server, result.stderr.trim())),
            _ => Err(RemoteError::UploadFailed(result.stderr.trim().to_string())),
        }
    }

    async fn download(
        &self,
        server: &ServerConfig,
        remote: &str,
        local: &Path,
    ) -> RemoteResult<()> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::DownloadFailed(e.to_string()))?;
        }

        let result = self
            .scp(
                server,
                &Self::remote_path(server, remote),
                &local.to_string_lossy(),
            )
            .await
            .map_err(|e| RemoteError::DownloadFailed(e.to_string()))?;

        match result.exit_code {
            0 => Ok(()),
            SSH_CONNECTION_FAILURE => Err(RemoteError::connection(server, result.stderr.trim())),
            _ => Err(RemoteError::DownloadFailed(result.stderr.trim().to_string())),
        }
    }
}
