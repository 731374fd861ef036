//! Top-level entry point: run every configured plan for every resource of a
//! unit.

use crate::config::ConfigFile;
use crate::defaults::default_configuration;
use crate::dut::Dut;
use crate::engine::run_plan;
use crate::error::{RecoveryError, Result};
use crate::exec::{ExecRegistry, RunArgs};
use crate::log::StepHandler;
use crate::metrics::Metrics;
use crate::plan::{Configuration, PLAN_CLOSE, PLAN_PERIPHERAL, PLAN_SERVO};
use crate::tlw::Access;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct RunRequest {
    /// Unit to recover; resolved to resources through the inventory.
    pub unit_name: String,
    pub access: Arc<dyn Access>,
    /// Plans to run; the built-in plans when `None`.
    pub config: Option<ConfigFile>,
    pub metrics: Option<Arc<dyn Metrics>>,
    pub steps: Option<Arc<dyn StepHandler>>,
    pub enable_recovery: bool,
    pub swarming_task_id: String,
    /// Used in the per-resource metrics kind `run_task:<task_name>`.
    pub task_name: String,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(unit_name: impl Into<String>, access: Arc<dyn Access>) -> Self {
        Self {
            unit_name: unit_name.into(),
            access,
            config: None,
            metrics: None,
            steps: None,
            enable_recovery: true,
            swarming_task_id: String::new(),
            task_name: "recovery".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    fn run_args(&self, dut: Dut) -> RunArgs {
        let mut args = RunArgs::new(dut, self.access.clone());
        args.metrics = self.metrics.clone();
        args.steps = self.steps.clone();
        args.cancel = self.cancel.clone();
        args.enable_recovery = self.enable_recovery;
        args.swarming_task_id = self.swarming_task_id.clone();
        args
    }
}

/// Run the configured plans for every resource of the unit.
///
/// A failing resource does not stop the next one; failures are joined into
/// one error at the end. Cancellation stops the run at once.
pub async fn run(req: &RunRequest, registry: &ExecRegistry) -> Result<()> {
    if req.unit_name.is_empty() {
        return Err(RecoveryError::usage("run: unit name is empty"));
    }
    let library = req.run_args(Dut::new(req.unit_name.clone()));
    let record = library.start_metric("run_library").await;
    let result = run_unit(req, registry).await;
    library
        .finish_metric(record, result.as_ref().map(|_| ()), &[])
        .await;
    result
}

async fn run_unit(req: &RunRequest, registry: &ExecRegistry) -> Result<()> {
    let config = match &req.config {
        Some(cfg) => cfg.validate(registry)?,
        None => default_configuration().validate(registry)?,
    };
    let resources = req.access.list_resources(&req.unit_name).await?;
    tracing::info!(unit = %req.unit_name, ?resources, "starting recovery");

    let mut failures = Vec::new();
    for resource in &resources {
        let span = tracing::info_span!("resource", name = %resource);
        match run_resource(req, &config, registry, resource, span.clone())
            .instrument(span)
            .await
        {
            Ok(()) => tracing::info!(resource = %resource, "resource recovered"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "resource failed");
                failures.push(format!("{resource}: {e}"));
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(RecoveryError::failed(failures.join("; ")))
    }
}

async fn run_resource(
    req: &RunRequest,
    config: &Configuration,
    registry: &ExecRegistry,
    resource: &str,
    span: tracing::Span,
) -> Result<()> {
    let dut = req.access.get_dut(resource).await?;
    let mut base = req.run_args(dut);
    base.span = span;
    let record = base
        .start_metric(&format!("run_task:{}", req.task_name))
        .await;

    let mut result = Ok(());
    for name in config.plan_names.iter().filter(|n| *n != PLAN_CLOSE) {
        let plan = config
            .plan(name)
            .ok_or_else(|| RecoveryError::Config(format!("plan {name:?} is not defined")))?;
        let Some(target) = plan_target(&base.dut, name) else {
            tracing::info!(plan = %name, "no resource for plan, skipping");
            continue;
        };
        if let Err(e) = run_plan(plan, Arc::new(base.for_resource(&target)), registry).await {
            result = Err(e);
            break;
        }
    }

    match config.plan(PLAN_CLOSE) {
        Some(_) if req.cancel.is_cancelled() => {
            tracing::info!("run cancelled, skipping close plan");
        }
        Some(close) => {
            let target = base.dut.name.clone();
            if let Err(e) = run_plan(close, Arc::new(base.for_resource(&target)), registry).await {
                tracing::warn!(error = %e, "close plan failed, ignored");
            }
        }
        None => {}
    }

    base.finish_metric(record, result.as_ref().map(|_| ()), &[])
        .await;
    result
}

/// Resource a plan runs against, `None` when the device has none.
fn plan_target(dut: &Dut, plan: &str) -> Option<String> {
    match plan {
        PLAN_SERVO => dut.servo_host_name().map(str::to_string),
        PLAN_PERIPHERAL => dut.peripheral.as_ref().map(|p| p.name.clone()),
        // cros, close and custom plans run against the device itself.
        _ => Some(dut.name.clone()),
    }
}
