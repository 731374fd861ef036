//! Exec functions: the named units of work actions point at.
//!
//! Execs are looked up by name in an [`ExecRegistry`] when a configuration is
//! validated. Each call gets an [`ExecInfo`] carrying the run-wide
//! [`RunArgs`], the action's parsed arguments and its timeout.

pub mod args;
mod cros_execs;
mod firmware_execs;
mod sample;
mod servo_execs;

pub use args::ActionArgs;

use crate::dut::Dut;
use crate::error::{RecoveryError, Result};
use crate::log::StepHandler;
use crate::metrics::{self, ActionStatus, Metrics, Observation};
use crate::tlw::{Access, Pinger, Runner, Servod};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// RunArgs
// ---------------------------------------------------------------------------

/// Everything a plan run shares across its actions.
#[derive(Clone)]
pub struct RunArgs {
    pub dut: Dut,
    pub access: Arc<dyn Access>,
    pub metrics: Option<Arc<dyn Metrics>>,
    pub steps: Option<Arc<dyn StepHandler>>,
    /// Parent of every action span opened during the run.
    pub span: tracing::Span,
    pub cancel: CancellationToken,
    /// When false, failing actions never try their recoveries.
    pub enable_recovery: bool,
    pub swarming_task_id: String,
    /// Resource the current plan targets (DUT, servo host or peripheral).
    pub resource_name: String,
}

impl RunArgs {
    pub fn new(dut: Dut, access: Arc<dyn Access>) -> Self {
        let resource_name = dut.name.clone();
        Self {
            dut,
            access,
            metrics: None,
            steps: None,
            span: tracing::Span::none(),
            cancel: CancellationToken::new(),
            enable_recovery: true,
            swarming_task_id: String::new(),
            resource_name,
        }
    }

    /// Same run, aimed at another resource.
    pub fn for_resource(&self, resource: &str) -> Self {
        Self {
            resource_name: resource.to_string(),
            ..self.clone()
        }
    }

    /// Open a metrics record of `kind` for this device. `None` when metrics
    /// are off or the store refused the record; failures are only logged.
    pub async fn start_metric(&self, kind: &str) -> Option<metrics::Action> {
        let store = self.metrics.as_ref()?;
        let mut record = metrics::Action::new(kind);
        record.asset_tag = self.dut.asset_tag.clone();
        record.swarming_task_id = self.swarming_task_id.clone();
        record.start_time = Some(Utc::now());
        match store.create(&mut record).await {
            Ok(()) => Some(record),
            Err(e) => {
                tracing::warn!(kind, error = %e, "create metrics record");
                None
            }
        }
    }

    /// Close a record opened by [`start_metric`](Self::start_metric).
    pub async fn finish_metric(
        &self,
        record: Option<metrics::Action>,
        outcome: std::result::Result<(), &RecoveryError>,
        observations: &[Observation],
    ) {
        let Some(mut record) = record else { return };
        record.finish(outcome);
        self.store_metric(record, observations).await;
    }

    /// Close a record as skipped.
    pub async fn skip_metric(&self, record: Option<metrics::Action>, reason: &RecoveryError) {
        let Some(mut record) = record else { return };
        record.stop_time = Some(Utc::now());
        record.status = ActionStatus::Skip;
        record.fail_reason = reason.to_string();
        self.store_metric(record, &[]).await;
    }

    async fn store_metric(&self, record: metrics::Action, observations: &[Observation]) {
        let Some(store) = self.metrics.as_ref() else { return };
        if let Err(e) = store.update(&record).await {
            tracing::warn!(kind = %record.kind, error = %e, "update metrics record");
            return;
        }
        if observations.is_empty() {
            return;
        }
        if let Err(e) = store.add_observations(&record.name, observations).await {
            tracing::warn!(kind = %record.kind, error = %e, "add metrics observations");
        }
    }
}

// ---------------------------------------------------------------------------
// ExecInfo
// ---------------------------------------------------------------------------

pub struct ExecInfo {
    pub run_args: Arc<RunArgs>,
    /// Child of the run token; also cancelled when the exec times out.
    pub cancel: CancellationToken,
    pub action_name: String,
    pub args: ActionArgs,
    pub timeout: Duration,
}

impl ExecInfo {
    pub fn dut(&self) -> &Dut {
        &self.run_args.dut
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runner for the resource the plan targets.
    pub fn default_runner(&self) -> Arc<dyn Runner> {
        self.run_args.access.runner(&self.run_args.resource_name)
    }

    pub fn dut_runner(&self) -> Arc<dyn Runner> {
        self.run_args.access.runner(&self.run_args.dut.name)
    }

    pub fn servo_host_runner(&self) -> Result<Arc<dyn Runner>> {
        match self.dut().servo_host_name() {
            Some(host) => Ok(self.run_args.access.runner(host)),
            None => Err(RecoveryError::usage(format!(
                "{}: device has no servo host",
                self.action_name
            ))),
        }
    }

    pub fn servod(&self) -> Result<Arc<dyn Servod>> {
        self.run_args.access.servod(&self.run_args.dut.name)
    }

    pub fn pinger(&self) -> Arc<dyn Pinger> {
        self.run_args.access.pinger(&self.run_args.resource_name)
    }

    /// Required string argument.
    pub fn required_arg(&self, key: &str) -> Result<String> {
        let value = self.args.as_string(key, "");
        if value.is_empty() {
            return Err(RecoveryError::usage(format!(
                "{}: missing argument {key:?}",
                self.action_name
            )));
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Exec: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn run(&self, info: &ExecInfo) -> Result<()>;
}

pub fn all_execs() -> Vec<Arc<dyn Exec>> {
    vec![
        Arc::new(sample::SamplePass),
        Arc::new(sample::SampleFail),
        Arc::new(cros_execs::CrosPing),
        Arc::new(cros_execs::CrosSsh),
        Arc::new(cros_execs::CrosReboot),
        Arc::new(cros_execs::CrosBootedFromInternalStorage),
        Arc::new(cros_execs::CrosReleaseBoardMatches),
        Arc::new(cros_execs::CrosRunShellCommand),
        Arc::new(cros_execs::CrosRunFirmwareUpdate),
        Arc::new(cros_execs::CrosInstallInRecoveryMode),
        Arc::new(cros_execs::CrosUpdateCrossystem),
        Arc::new(cros_execs::CrosAuditStorageSmart),
        Arc::new(servo_execs::DutHasServo),
        Arc::new(servo_execs::ServodHasControl),
        Arc::new(servo_execs::ServoSetPowerState),
        Arc::new(servo_execs::ServoSetUsbkeyVisibility),
        Arc::new(servo_execs::IsServoTypeCcd),
        Arc::new(servo_execs::IsServoV4),
        Arc::new(servo_execs::IsServoDualSetup),
        Arc::new(servo_execs::ServoDetectUsbkey),
        Arc::new(servo_execs::ServoColdResetDut),
        Arc::new(servo_execs::ServoSetEcUartCmd),
        Arc::new(servo_execs::ServoTopologyUpdate),
        Arc::new(servo_execs::IsRootServoPresent),
        Arc::new(servo_execs::ServoFirmwareNeedsUpdate),
        Arc::new(servo_execs::ServoUpdateServoFirmware),
        Arc::new(firmware_execs::ServoUpdateFwFromFwImage),
        Arc::new(firmware_execs::ServoSetGbbFlags),
        Arc::new(firmware_execs::ServoApNotDevSigned),
    ]
}

// ---------------------------------------------------------------------------
// ExecRegistry
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct ExecRegistry {
    execs: BTreeMap<String, Arc<dyn Exec>>,
}

impl ExecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in exec.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for exec in all_execs() {
            registry.register(exec);
        }
        registry
    }

    /// Add `exec`, replacing any exec registered under the same name.
    pub fn register(&mut self, exec: Arc<dyn Exec>) {
        self.execs.insert(exec.name().to_string(), exec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Exec>> {
        self.execs
            .get(name)
            .cloned()
            .ok_or_else(|| RecoveryError::ExecNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.execs.contains_key(name)
    }

    /// Registered execs in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Exec>> {
        self.execs.values()
    }
}

#[cfg(test)]
pub(crate) fn test_info(run_args: Arc<RunArgs>, raw_args: &[&str]) -> ExecInfo {
    let raw: Vec<String> = raw_args.iter().map(|s| s.to_string()).collect();
    ExecInfo {
        cancel: run_args.cancel.child_token(),
        run_args,
        action_name: "test_action".to_string(),
        args: ActionArgs::parse(&raw),
        timeout: Duration::from_secs(60),
    }
}
