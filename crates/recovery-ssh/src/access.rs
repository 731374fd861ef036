use crate::error::{Result as SshResult, SshError};
use crate::inventory::FileInventory;
use crate::ping::SystemPinger;
use crate::servod::DutControlServod;
use crate::ssh::{SshOptions, SshRunner};
use async_trait::async_trait;
use recovery_core::dut::Dut;
use recovery_core::tlw::{Access, Pinger, Runner, Servod};
use recovery_core::{RecoveryError, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// [`Access`] over the system `ssh` and `ping` binaries and a file inventory.
pub struct LabAccess {
    ssh: PathBuf,
    ping: PathBuf,
    options: SshOptions,
    inventory: FileInventory,
}

impl LabAccess {
    /// Resolve `ssh` and `ping` on PATH.
    pub fn new(inventory: FileInventory, options: SshOptions) -> SshResult<Self> {
        Ok(Self::with_binaries(
            find_binary("ssh")?,
            find_binary("ping")?,
            inventory,
            options,
        ))
    }

    pub fn with_binaries(
        ssh: PathBuf,
        ping: PathBuf,
        inventory: FileInventory,
        options: SshOptions,
    ) -> Self {
        Self {
            ssh,
            ping,
            options,
            inventory,
        }
    }

    fn ssh_runner(&self, host: &str) -> SshRunner {
        SshRunner::new(self.ssh.clone(), host, self.options.clone())
    }
}

fn find_binary(name: &str) -> SshResult<PathBuf> {
    which::which(name).map_err(|_| SshError::BinaryNotFound(name.to_string()))
}

#[async_trait]
impl Access for LabAccess {
    fn runner(&self, resource: &str) -> Arc<dyn Runner> {
        Arc::new(self.ssh_runner(resource))
    }

    fn pinger(&self, resource: &str) -> Arc<dyn Pinger> {
        Arc::new(SystemPinger::new(self.ping.clone(), resource))
    }

    fn servod(&self, resource: &str) -> Result<Arc<dyn Servod>> {
        let dut = self.inventory.dut(resource)?;
        let host = dut
            .servo_host
            .as_ref()
            .ok_or_else(|| RecoveryError::usage(format!("{resource} has no servo host")))?;
        let runner: Arc<dyn Runner> = Arc::new(self.ssh_runner(&host.name));
        Ok(Arc::new(DutControlServod::new(runner, host.servod_port)))
    }

    async fn list_resources(&self, unit: &str) -> Result<Vec<String>> {
        Ok(self.inventory.list_resources(unit)?)
    }

    async fn get_dut(&self, resource: &str) -> Result<Dut> {
        Ok(self.inventory.dut(resource)?.clone())
    }
}
