//! The remote command channel.
//!
//! `RemoteExecutor` opens sessions against a host; a `RemoteSession` runs
//! commands and transfers files, and must be closed on every exit path. The
//! shipped implementation shells out to `ssh`/`scp`. Host-key verification
//! is deliberately permissive: instances are freshly provisioned and their
//! identity is established through provider tags, not SSH trust.

pub mod guard;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteSession: Send {
    /// Run a command to completion, capturing stdout/stderr.
    async fn run(&mut self, command: &str) -> Result<CommandOutput>;

    /// Copy a local file onto the remote host.
    async fn put_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Release the session. Safe to call after a failed command.
    async fn close(&mut self);
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn open_session(&self, host: &str, user: &str) -> Result<Box<dyn RemoteSession>>;
}

// ── SSH implementation ──────────────────────────────────────────────

/// Executor that spawns the system `ssh`/`scp` binaries.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// Private key for authentication, if not using the agent.
    key_path: Option<String>,
    port: u16,
    connect_timeout: Duration,
    /// Kill switch for commands that hang the channel.
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(key_path: Option<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            key_path,
            port,
            connect_timeout,
            command_timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Base SSH arguments (without the remote command). Host keys are not
    /// verified; see the module docs.
    fn ssh_base_args(&self, host: &str, user: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.clone());
        }
        args.extend([
            "-p".into(),
            self.port.to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".into(),
            "LogLevel=ERROR".into(),
            format!("{user}@{host}"),
        ]);
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn open_session(&self, host: &str, user: &str) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(SshSession {
            executor: self.clone(),
            host: host.to_string(),
            user: user.to_string(),
        }))
    }
}

/// One ssh target. Each `run` spawns a fresh process; `close` is a no-op
/// kept for symmetry with session-holding executors.
struct SshSession {
    executor: SshExecutor,
    host: String,
    user: String,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let mut args = self.executor.ssh_base_args(&self.host, &self.user);
        args.push(command.to_string());

        tracing::debug!(host = %self.host, command = %command, "running remote command");

        let child = tokio::process::Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let child_pid = child.id();
        let output = match tokio::time::timeout(
            self.executor.command_timeout,
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::Remote(format!("ssh process error: {e}"))),
            Err(_) => {
                // Kill by PID, not pkill, so unrelated ssh sessions survive.
                if let Some(pid) = child_pid {
                    let _ = tokio::process::Command::new("kill")
                        .args(["-9", &pid.to_string()])
                        .output()
                        .await;
                }
                return Err(Error::Remote(format!(
                    "remote command timed out after {:?}",
                    self.executor.command_timeout
                )));
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let target = format!("{}@{}:{}", self.user, self.host, remote);
        let mut args = Vec::new();
        if let Some(key) = &self.executor.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.extend([
            "-P".to_string(),
            self.executor.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            local.to_string_lossy().into_owned(),
            target,
        ]);

        let output = tokio::process::Command::new("scp")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Remote(format!(
                "scp to {} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn close(&mut self) {}
}
