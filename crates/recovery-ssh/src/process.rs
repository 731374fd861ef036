use crate::error::{Result, SshError};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Captured result of a finished local process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Run `program` to completion, racing its exit against `timeout` and
/// `cancel`. The child is killed when either wins.
pub async fn run_process(
    program: &Path,
    args: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Output> {
    if cancel.is_cancelled() {
        return Err(SshError::Cancelled);
    }
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    tokio::select! {
        _ = cancel.cancelled() => Err(SshError::Cancelled),
        res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
            Ok(out) => {
                let out = out?;
                Ok(Output {
                    status: out.status.code(),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                })
            }
            Err(_) => Err(SshError::Timeout {
                command: describe(program, args),
                timeout,
            }),
        },
    }
}

fn describe(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let cancel = CancellationToken::new();
        let out = run_process(
            Path::new("sh"),
            &sh("echo hello; echo oops >&2; exit 3"),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        let cancel = CancellationToken::new();
        let err = run_process(
            Path::new("sh"),
            &sh("sleep 5"),
            Duration::from_millis(100),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SshError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = run_process(Path::new("sh"), &sh("sleep 5"), Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Cancelled));
    }

    #[tokio::test]
    async fn signal_death_has_no_status() {
        let cancel = CancellationToken::new();
        let out = run_process(Path::new("sh"), &sh("kill -9 $$"), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(out.status, None);
    }
}
