//! Local process executor implementation.
//!
//! Runs every "server" as a directory on the local machine, which makes it
//! possible to try a configuration end to end without any remote hosts.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | One working directory per server name |
//! | File transfer | Local copy operations |
//! | Abort | Child process is killed on drop |
//!
//! # Example Configuration
//!
//! ```toml
//! [executor]
//! type = "local"
//! root_dir = "/tmp/labgrid"
//! shell = "/bin/bash"
//! ```
//!
//! With this configuration, a command sent to server `node-a` runs in
//! `/tmp/labgrid/node-a`, and relative upload/download paths resolve
//! against that directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Command, ExecResult, RemoteError, RemoteExecutor, RemoteResult, run_process};
use crate::config::{LocalExecutorConfig, ServerConfig};

/// Executor that runs commands as local child processes.
pub struct LocalExecutor {
    config: LocalExecutorConfig,
}

impl LocalExecutor {
    /// ```
    /// use labgrid::remote::local::LocalExecutor;
    /// use labgrid::config::LocalExecutorConfig;
    ///
    /// let executor = LocalExecutor::new(LocalExecutorConfig {
    ///     root_dir: "/tmp/labgrid-demo".into(),
    ///     ..Default::default()
    /// });
    /// ```
    pub fn new(config: LocalExecutorConfig) -> Self {
        Self { config }
    }

    /// Directory standing in for the server's filesystem.
    pub fn server_dir(&self, server: &ServerConfig) -> PathBuf {
        self.config.root_dir.join(&server.name)
    }

    fn resolve(&self, server: &ServerConfig, path: &str) -> PathBuf {
        self.server_dir(server).join(path)
    }

    async fn ensure_server_dir(&self, server: &ServerConfig) -> RemoteResult<PathBuf> {
        let dir = self.server_dir(server);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RemoteError::connection(server, e.to_string()))?;
        Ok(dir)
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, server: &ServerConfig, cmd: &Command) -> RemoteResult<ExecResult> {
        let base = self.ensure_server_dir(server).await?;
        let shell_cmd = cmd.to_shell_string();
        debug!("[{}] local: {}", server.name, shell_cmd);

        let mut process = tokio::process::Command::new(&self.config.shell);
        process.arg("-c").arg(&shell_cmd);
        process.current_dir(match &cmd.working_dir {
            Some(dir) => base.join(dir),
            None => base,
        });
        process.env("LABGRID_SERVER", &server.name);
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        run_process(process, cmd.timeout).await
    }

    async fn upload(&self, server: &ServerConfig, local: &Path, remote: &str) -> RemoteResult<()> {
        self.ensure_server_dir(server).await?;
        let dest = self.resolve(server, remote);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::UploadFailed(e.to_string()))?;
        }

        copy_path(local, &dest)
            .await
            .map_err(|e| RemoteError::UploadFailed(format!("{}: {}", local.display(), e)))
    }

    async fn download(
        &self,
        server: &ServerConfig,
        remote: &str,
        local: &Path,
    ) -> RemoteResult<()> {
        let src = self.resolve(server, remote);

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::DownloadFailed(e.to_string()))?;
        }

        copy_path(&src, local)
            .await
            .map_err(|e| RemoteError::DownloadFailed(format!("{}: {}", src.display(), e)))
    }

    async fn probe(&self, server: &ServerConfig) -> RemoteResult<()> {
        self.ensure_server_dir(server).await.map(|_| ())
    }
}

async fn copy_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(src).await?.is_dir() {
        copy_dir_all(src, dst).await
    } else {
        tokio::fs::copy(src, dst).await.map(|_| ())
    }
}

/// Recursively copy a directory.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}
