use super::{Exec, ExecInfo};
use crate::cros::{self, BootInRecoveryRequest, StorageState};
use crate::error::{RecoveryError, Result};
use crate::metrics::Observation;
use async_trait::async_trait;
use std::time::Duration;

pub struct CrosPing;

#[async_trait]
impl Exec for CrosPing {
    fn name(&self) -> &str {
        "cros_ping"
    }

    fn description(&self) -> &str {
        "Wait until the host answers ICMP echo"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let count = info.args.as_int("count", 2).max(1) as u32;
        let wait = info.args.as_duration_secs("wait_timeout", 15);
        cros::wait_until_pingable(
            info.pinger().as_ref(),
            info.cancel(),
            count,
            wait,
            Duration::from_secs(1),
        )
        .await
    }
}

pub struct CrosSsh;

#[async_trait]
impl Exec for CrosSsh {
    fn name(&self) -> &str {
        "cros_ssh"
    }

    fn description(&self) -> &str {
        "Host accepts ssh and runs a trivial command"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let runner = info.default_runner();
        if info.args.has("wait_timeout") {
            let wait = info.args.as_duration_secs("wait_timeout", 30);
            return cros::wait_until_ssh_able(
                runner.as_ref(),
                info.cancel(),
                wait,
                Duration::from_secs(5),
            )
            .await;
        }
        cros::is_ssh_able(runner.as_ref(), info.cancel()).await
    }
}

pub struct CrosReboot;

#[async_trait]
impl Exec for CrosReboot {
    fn name(&self) -> &str {
        "cros_reboot"
    }

    fn description(&self) -> &str {
        "Reboot the host"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        cros::reboot(info.default_runner().as_ref(), info.cancel()).await
    }
}

pub struct CrosBootedFromInternalStorage;

#[async_trait]
impl Exec for CrosBootedFromInternalStorage {
    fn name(&self) -> &str {
        "cros_is_booted_from_internal_storage"
    }

    fn description(&self) -> &str {
        "Host runs from its fixed storage device"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let external =
            cros::is_booted_from_external_storage(info.default_runner().as_ref(), info.cancel())
                .await?;
        if external {
            return Err(RecoveryError::failed("host booted from external storage"));
        }
        Ok(())
    }
}

pub struct CrosReleaseBoardMatches;

#[async_trait]
impl Exec for CrosReleaseBoardMatches {
    fn name(&self) -> &str {
        "cros_release_board_matches"
    }

    fn description(&self) -> &str {
        "Board in /etc/lsb-release matches inventory"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let expected = &info.dut().board;
        if expected.is_empty() {
            return Err(RecoveryError::usage("release board: inventory has no board"));
        }
        let actual = cros::release_board(info.default_runner().as_ref(), info.cancel()).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(RecoveryError::failed(format!(
                "release board: host reports {actual:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }
}

pub struct CrosRunShellCommand;

#[async_trait]
impl Exec for CrosRunShellCommand {
    fn name(&self) -> &str {
        "cros_run_shell_command"
    }

    fn description(&self) -> &str {
        "Run the `command` argument on the host"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let command = info.required_arg("command")?;
        let out = info
            .default_runner()
            .run(info.cancel(), info.timeout, &command, &[])
            .await?;
        tracing::debug!(command = %command, output = %out, "shell command finished");
        Ok(())
    }
}

pub struct CrosRunFirmwareUpdate;

#[async_trait]
impl Exec for CrosRunFirmwareUpdate {
    fn name(&self) -> &str {
        "cros_run_firmware_update"
    }

    fn description(&self) -> &str {
        "Run chromeos-firmwareupdate on the host"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let mode = format!("--mode={}", info.args.as_string("mode", "autoupdate"));
        let mut args = vec![mode.as_str()];
        if info.args.as_bool("force", false) {
            args.push("--force");
        }
        let runner = info.default_runner();
        runner
            .run(info.cancel(), info.timeout, "chromeos-firmwareupdate", &args)
            .await
            .map_err(|e| e.context("run firmware update"))?;
        if info.args.as_bool("reboot", false) {
            cros::reboot(runner.as_ref(), info.cancel()).await?;
        }
        Ok(())
    }
}

pub struct CrosInstallInRecoveryMode;

#[async_trait]
impl Exec for CrosInstallInRecoveryMode {
    fn name(&self) -> &str {
        "cros_install_in_recovery_mode"
    }

    fn description(&self) -> &str {
        "Boot from the servo USB key and install the OS to internal storage"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let runner = info.dut_runner();
        let servod = info.servod()?;
        let install_timeout = info.args.as_duration_secs("install_timeout", 600);
        let callback = {
            let runner = runner.clone();
            let cancel = info.cancel().clone();
            Box::pin(async move {
                runner
                    .run(&cancel, install_timeout, "chromeos-install", &["--yes"])
                    .await
                    .map(|_| ())
                    .map_err(|e| e.context("install from usb"))
            })
        };
        let req = BootInRecoveryRequest {
            boot_timeout: info.args.as_duration_secs("boot_timeout", 480),
            boot_interval: info.args.as_duration_secs("boot_interval", 10),
            callback: Some(callback),
            halt_timeout: info.args.as_duration_secs("halt_timeout", 120),
            ignore_reboot_failure: info.args.as_bool("ignore_reboot_failure", true),
        };
        cros::boot_in_recovery_mode(info.dut(), runner.as_ref(), servod.as_ref(), info.cancel(), req)
            .await
    }
}

pub struct CrosUpdateCrossystem;

#[async_trait]
impl Exec for CrosUpdateCrossystem {
    fn name(&self) -> &str {
        "cros_update_crossystem"
    }

    fn description(&self) -> &str {
        "Set the crossystem variable `command` to `value`"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let key = info.required_arg("command")?;
        let value = info.required_arg("value")?;
        let check = info.args.as_bool("check_after_update", false);
        cros::update_crossystem(info.dut_runner().as_ref(), info.cancel(), &key, &value, check)
            .await
            .map_err(|e| e.context("update crossystem"))
    }
}

pub struct CrosAuditStorageSmart;

#[async_trait]
impl Exec for CrosAuditStorageSmart {
    fn name(&self) -> &str {
        "cros_audit_storage_smart"
    }

    fn description(&self) -> &str {
        "Internal storage SMART report is not critical"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let fail_on_warning = info.args.as_bool("fail_on_warning", false);
        let record = info.run_args.start_metric("storage_smart").await;
        let result = cros::read_storage_smart(info.dut_runner().as_ref(), info.cancel()).await;
        let (outcome, observations) = match &result {
            Ok(smart) => {
                tracing::info!(storage_type = %smart.storage_type, state = %smart.state, "storage audit");
                let failed = match smart.state {
                    StorageState::Critical => true,
                    StorageState::Warning => fail_on_warning,
                    StorageState::Normal | StorageState::Undefined => false,
                };
                let outcome = if failed {
                    Err(RecoveryError::failed(format!(
                        "{} storage is {}",
                        smart.storage_type, smart.state
                    )))
                } else {
                    Ok(())
                };
                let observations = vec![
                    Observation::string("storage_type", smart.storage_type.as_str()),
                    Observation::string("storage_state", smart.state.as_str()),
                ];
                (outcome, observations)
            }
            Err(e) => (Err(e.duplicate()), Vec::new()),
        };
        info.run_args
            .finish_metric(record, outcome.as_ref().map(|_| ()), &observations)
            .await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::Dut;
    use crate::exec::{test_info, RunArgs};
    use crate::testing::{FakeAccess, FakePinger, FakeRunner, Reply};
    use std::sync::Arc;

    fn board_dut() -> Dut {
        let mut dut = Dut::new("dut1");
        dut.board = "octopus".into();
        dut
    }

    #[tokio::test]
    async fn release_board_matches_ignores_case() {
        let access = FakeAccess::new(board_dut());
        access
            .default_runner
            .on("cat /etc/lsb-release", Reply::ok("CHROMEOS_RELEASE_BOARD=Octopus"));
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        CrosReleaseBoardMatches
            .run(&test_info(args, &[]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_board_mismatch_fails() {
        let access = FakeAccess::new(board_dut());
        access
            .default_runner
            .on("cat /etc/lsb-release", Reply::ok("CHROMEOS_RELEASE_BOARD=eve"));
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        let err = CrosReleaseBoardMatches
            .run(&test_info(args, &[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("eve"));
    }

    #[tokio::test]
    async fn crossystem_update_reads_back_when_asked() {
        let access = FakeAccess::new(board_dut());
        let runner: Arc<FakeRunner> = access.default_runner.clone();
        runner
            .on("crossystem dev_default_boot=", Reply::ok(""))
            .on("crossystem dev_default_boot", Reply::ok("disk"));
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        CrosUpdateCrossystem
            .run(&test_info(
                args,
                &["command:dev_default_boot", "value:disk", "check_after_update:true"],
            ))
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            ["crossystem dev_default_boot=disk", "crossystem dev_default_boot"]
        );
    }

    #[tokio::test]
    async fn shell_command_requires_argument() {
        let access = FakeAccess::new(board_dut());
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        let err = CrosRunShellCommand
            .run(&test_info(args, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Usage(_)));
    }

    #[tokio::test]
    async fn firmware_update_passes_mode_and_force() {
        let access = FakeAccess::new(board_dut());
        let runner: Arc<FakeRunner> = access.default_runner.clone();
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        CrosRunFirmwareUpdate
            .run(&test_info(args, &["mode:factory", "force:true"]))
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec!["chromeos-firmwareupdate --mode=factory --force"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ping_waits_for_reply() {
        let mut access = FakeAccess::new(board_dut());
        let pinger = FakePinger::new(vec![false, false, true]);
        access.pinger = pinger.clone();
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        CrosPing
            .run(&test_info(args, &["wait_timeout:10"]))
            .await
            .unwrap();
        assert_eq!(pinger.pings(), 3);
    }

    #[tokio::test]
    async fn booted_from_usb_fails_internal_storage_check() {
        let access = FakeAccess::new(board_dut());
        access
            .default_runner
            .on("rootdev", Reply::ok("/dev/sda"))
            .on(". /usr/sbin/write_gpt.sh", Reply::ok("/dev/mmcblk0"));
        let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
        assert!(CrosBootedFromInternalStorage
            .run(&test_info(args, &[]))
            .await
            .is_err());
    }

    fn ssd_report(extra: &str) -> String {
        format!("SATA Version is: SATA 3.1, 6.0 Gb/s (current: 6.0 Gb/s)\n{extra}")
    }

    #[tokio::test]
    async fn storage_audit_fails_on_critical_and_records_state() {
        let access = FakeAccess::new(board_dut());
        access.default_runner.on(
            ". /usr/share/misc/storage-info-common.sh",
            Reply::ok(&ssd_report("184 End-to-End_Error   PO--CK   001   001   097    NOW  135")),
        );
        let metrics = Arc::new(crate::metrics::MemoryMetrics::new());
        let mut args = RunArgs::new(board_dut(), Arc::new(access));
        args.metrics = Some(metrics.clone());
        let err = CrosAuditStorageSmart
            .run(&test_info(Arc::new(args), &[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SSD storage is CRITICAL"), "{err}");

        let records = metrics.actions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "storage_smart");
        assert!(records[0]
            .observations
            .iter()
            .any(|o| o.metric_kind == "storage_state" && o.value == "CRITICAL"));
    }

    #[tokio::test]
    async fn storage_warning_fails_only_when_asked() {
        let warning = ssd_report("  7 Reallocated_Sector_Ct   PO--CK   101   001   097");
        for (raw_args, should_fail) in [(&[][..], false), (&["fail_on_warning:true"][..], true)] {
            let access = FakeAccess::new(board_dut());
            access
                .default_runner
                .on(". /usr/share/misc/storage-info-common.sh", Reply::ok(&warning));
            let args = Arc::new(RunArgs::new(board_dut(), Arc::new(access)));
            let res = CrosAuditStorageSmart.run(&test_info(args, raw_args)).await;
            assert_eq!(res.is_err(), should_fail, "{raw_args:?}");
        }
    }
}
