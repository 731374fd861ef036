use crate::output::{emit_json, records_table};
use anyhow::Context;
use clap::Args;
use recovery_core::config::ConfigFile;
use recovery_core::exec::ExecRegistry;
use recovery_core::log::TracingSteps;
use recovery_core::metrics::memory::MemoryMetrics;
use recovery_core::recovery::{self, RunRequest};
use recovery_ssh::{FileInventory, LabAccess, SshOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args)]
pub struct RunOptions {
    /// Unit to recover: a device name or a unit listed in the inventory
    #[arg(long)]
    unit: String,

    /// Inventory YAML describing devices and units
    #[arg(long, env = "RECOVERY_INVENTORY")]
    inventory: PathBuf,

    /// Plan file (default: built-in plans)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verify only; never run recovery actions
    #[arg(long)]
    no_recovery: bool,

    /// Task id stamped on every metrics record
    #[arg(long, env = "SWARMING_TASK_ID", default_value = "")]
    task_id: String,

    /// Task name used in the per-device metrics record
    #[arg(long, default_value = "recovery")]
    task_name: String,

    /// ssh login user
    #[arg(long, default_value = "root")]
    ssh_user: String,

    /// ssh port (default: ssh client's own)
    #[arg(long)]
    ssh_port: Option<u16>,

    /// ssh identity file
    #[arg(long)]
    identity_file: Option<PathBuf>,
}

pub fn run(opts: RunOptions, json: bool) -> anyhow::Result<()> {
    let inventory = FileInventory::load(&opts.inventory).context("failed to load inventory")?;
    let config = opts
        .config
        .as_deref()
        .map(ConfigFile::load)
        .transpose()?;

    let ssh = SshOptions {
        user: opts.ssh_user,
        port: opts.ssh_port,
        identity_file: opts.identity_file,
        ..SshOptions::default()
    };
    let access = LabAccess::new(inventory, ssh)?;
    let metrics = Arc::new(MemoryMetrics::new());

    let mut req = RunRequest::new(opts.unit, Arc::new(access));
    req.config = config;
    req.metrics = Some(metrics.clone());
    req.steps = Some(Arc::new(TracingSteps));
    req.enable_recovery = !opts.no_recovery;
    req.swarming_task_id = opts.task_id;
    req.task_name = opts.task_name;

    let registry = ExecRegistry::with_defaults();
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling run");
                cancel.cancel();
            }
        });
        recovery::run(&req, &registry).await
    });

    let records = metrics.actions();
    if json {
        emit_json(&records)?;
    } else {
        print!("{}", records_table(&records));
    }

    result.context("recovery failed")
}
