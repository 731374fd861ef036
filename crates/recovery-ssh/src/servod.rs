use async_trait::async_trait;
use recovery_core::tlw::{Runner, Servod, ServodValue};
use recovery_core::{RecoveryError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DUT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to servod through `dut-control` on the servo host.
pub struct DutControlServod {
    runner: Arc<dyn Runner>,
    port: u16,
}

impl DutControlServod {
    pub fn new(runner: Arc<dyn Runner>, port: u16) -> Self {
        Self { runner, port }
    }

    async fn dut_control(&self, cancel: &CancellationToken, extra: &[&str]) -> Result<String> {
        let port = self.port.to_string();
        let mut args = vec!["-p", port.as_str()];
        args.extend_from_slice(extra);
        self.runner
            .run(cancel, DUT_CONTROL_TIMEOUT, "dut-control", &args)
            .await
            .map_err(|e| control_error(e, extra.last().copied().unwrap_or_default()))
    }
}

/// `dut-control` reports unknown controls on stderr with a non-zero exit.
fn control_error(err: RecoveryError, control: &str) -> RecoveryError {
    match err {
        RecoveryError::RemoteExec { ref stderr, .. } if stderr.contains("No control named") => {
            let name = control.split(':').next().unwrap_or(control);
            RecoveryError::ServodControlMissing(name.to_string())
        }
        RecoveryError::RemoteExec { stderr, .. } => {
            RecoveryError::Servod(format!("{control}: {stderr}"))
        }
        other => other,
    }
}

/// Pull the value out of `control:value` output.
fn parse_value(control: &str, output: &str) -> Result<ServodValue> {
    let prefix = format!("{control}:");
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(&prefix))
        .map(ServodValue::parse)
        .ok_or_else(|| RecoveryError::Servod(format!("{control}: unexpected output {output:?}")))
}

#[async_trait]
impl Servod for DutControlServod {
    async fn get(&self, cancel: &CancellationToken, control: &str) -> Result<ServodValue> {
        let out = self.dut_control(cancel, &[control]).await?;
        parse_value(control, &out)
    }

    async fn set(
        &self,
        cancel: &CancellationToken,
        control: &str,
        value: ServodValue,
    ) -> Result<()> {
        let pair = format!("{control}:{value}");
        self.dut_control(cancel, &[pair.as_str()]).await.map(|_| ())
    }

    async fn has(&self, cancel: &CancellationToken, control: &str) -> Result<()> {
        self.dut_control(cancel, &["-i", control]).await.map(|_| ())
    }

    fn port(&self) -> u16 {
        self.port
    }
}
