use crate::error::SshError;
use crate::process::{run_process, Output};
use async_trait::async_trait;
use recovery_core::tlw::{command_line, Runner};
use recovery_core::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Connection settings shared by every host in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOptions {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: None,
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// ssh exits with 255 for its own errors; these mean the session dropped
/// after the command started.
const DROPPED_CONNECTION: &[&str] = &[
    "closed by remote host",
    "Connection reset",
    "Broken pipe",
    "connection lost",
];

// ---------------------------------------------------------------------------
// SshRunner
// ---------------------------------------------------------------------------

pub struct SshRunner {
    ssh: PathBuf,
    host: String,
    options: SshOptions,
}

impl SshRunner {
    pub fn new(ssh: PathBuf, host: impl Into<String>, options: SshOptions) -> Self {
        Self {
            ssh,
            host: host.into(),
            options,
        }
    }

    fn ssh_args(&self, remote: String) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
        ];
        if let Some(port) = self.options.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.options.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push("-l".to_string());
        args.push(self.options.user.clone());
        args.push(self.host.clone());
        args.push("--".to_string());
        args.push(remote);
        args
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<String> {
        let remote = command_line(cmd, args);
        tracing::debug!(host = %self.host, command = %remote, "ssh");
        let out = run_process(&self.ssh, &self.ssh_args(remote.clone()), timeout, cancel)
            .await
            .map_err(|e| match e {
                SshError::Timeout { .. } => {
                    RecoveryError::Timeout(format!("{}: '{remote}' after {timeout:?}", self.host))
                }
                other => other.into(),
            })?;
        classify(&remote, out)
    }
}

/// Map a finished ssh process onto the runner contract.
fn classify(command: &str, out: Output) -> Result<String> {
    match out.status {
        Some(0) => Ok(out.stdout.trim().to_string()),
        Some(255) if DROPPED_CONNECTION.iter().any(|m| out.stderr.contains(m)) => {
            Err(RecoveryError::NoExitStatus {
                command: command.to_string(),
            })
        }
        None => Err(RecoveryError::NoExitStatus {
            command: command.to_string(),
        }),
        Some(code) => Err(RecoveryError::RemoteExec {
            command: command.to_string(),
            exit_code: code,
            stdout: out.stdout.trim().to_string(),
            stderr: out.stderr.trim().to_string(),
        }),
    }
}
