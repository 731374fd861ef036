use crate::process::run_process;
use async_trait::async_trait;
use recovery_core::tlw::Pinger;
use recovery_core::{RecoveryError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Seconds `ping` waits for each reply.
const REPLY_WAIT_SECS: u64 = 2;

/// Pings a host with the system `ping` binary, one echo request per attempt.
pub struct SystemPinger {
    ping: PathBuf,
    host: String,
}

impl SystemPinger {
    pub fn new(ping: PathBuf, host: impl Into<String>) -> Self {
        Self {
            ping,
            host: host.into(),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            REPLY_WAIT_SECS.to_string(),
            self.host.clone(),
        ]
    }
}

#[async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, cancel: &CancellationToken, count: u32) -> Result<()> {
        let timeout = Duration::from_secs(REPLY_WAIT_SECS + 3);
        for attempt in 1..=count.max(1) {
            let out = run_process(&self.ping, &self.args(), timeout, cancel).await?;
            if out.success() {
                tracing::debug!(host = %self.host, attempt, "ping answered");
                return Ok(());
            }
        }
        Err(RecoveryError::failed(format!(
            "{} did not answer {count} ping(s)",
            self.host
        )))
    }
}
