use super::{Exec, ExecInfo};
use crate::error::{RecoveryError, Result};
use async_trait::async_trait;

pub struct SamplePass;

#[async_trait]
impl Exec for SamplePass {
    fn name(&self) -> &str {
        "sample_pass"
    }

    fn description(&self) -> &str {
        "Always passes"
    }

    async fn run(&self, _info: &ExecInfo) -> Result<()> {
        Ok(())
    }
}

pub struct SampleFail;

#[async_trait]
impl Exec for SampleFail {
    fn name(&self) -> &str {
        "sample_fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        Err(RecoveryError::failed(format!("{}: sample fail", info.action_name)))
    }
}
