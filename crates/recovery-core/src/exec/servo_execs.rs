use super::{Exec, ExecInfo};
use crate::cros;
use crate::error::{RecoveryError, Result};
use crate::dut::FirmwareChannel;
use crate::metrics::Observation;
use crate::servo::{
    get_servo_type, get_string, needs_update, retrieve_topology, set_ec_uart_cmd,
    set_power_state, topology, update_devices_fw, updater, update_usb_visibility, FwUpdateRequest,
    PowerState, ServoType, Topology, UsbVisibility,
};
use crate::tlw::Runner;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const USBKEY_DEV_CONTROL: &str = "image_usbkey_dev";

pub struct DutHasServo;

#[async_trait]
impl Exec for DutHasServo {
    fn name(&self) -> &str {
        "dut_has_servo"
    }

    fn description(&self) -> &str {
        "Inventory lists a servo host for the device"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        info.servo_host_runner().map(|_| ())
    }
}

pub struct ServodHasControl;

#[async_trait]
impl Exec for ServodHasControl {
    fn name(&self) -> &str {
        "servod_has_control"
    }

    fn description(&self) -> &str {
        "Servod knows the `control` argument"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let control = info.required_arg("control")?;
        info.servod()?.has(info.cancel(), &control).await
    }
}

pub struct ServoSetPowerState;

#[async_trait]
impl Exec for ServoSetPowerState {
    fn name(&self) -> &str {
        "servo_set_power_state"
    }

    fn description(&self) -> &str {
        "Set the device power state (on, off, reset, rec)"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let state: PowerState = info.required_arg("state")?.parse()?;
        set_power_state(info.servod()?.as_ref(), info.cancel(), state).await
    }
}

pub struct ServoSetUsbkeyVisibility;

#[async_trait]
impl Exec for ServoSetUsbkeyVisibility {
    fn name(&self) -> &str {
        "servo_set_usbkey_visibility"
    }

    fn description(&self) -> &str {
        "Point the servo USB key at the device, the servo host or nothing"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let visibility: UsbVisibility = info.required_arg("visibility")?.parse()?;
        update_usb_visibility(info.servod()?.as_ref(), info.cancel(), visibility).await
    }
}

async fn servo_type(info: &ExecInfo) -> Result<ServoType> {
    get_servo_type(info.servod()?.as_ref(), info.cancel()).await
}

pub struct IsServoTypeCcd;

#[async_trait]
impl Exec for IsServoTypeCcd {
    fn name(&self) -> &str {
        "is_servo_type_ccd"
    }

    fn description(&self) -> &str {
        "Servo connects through closed case debugging"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let st = servo_type(info).await?;
        if !st.is_ccd() {
            return Err(RecoveryError::failed(format!("servo type {st} is not ccd")));
        }
        Ok(())
    }
}

pub struct IsServoV4;

#[async_trait]
impl Exec for IsServoV4 {
    fn name(&self) -> &str {
        "is_servo_v4"
    }

    fn description(&self) -> &str {
        "Main servo device is a servo_v4"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let st = servo_type(info).await?;
        if !st.is_v4() {
            return Err(RecoveryError::failed(format!("servo type {st} is not servo_v4")));
        }
        Ok(())
    }
}

pub struct IsServoDualSetup;

#[async_trait]
impl Exec for IsServoDualSetup {
    fn name(&self) -> &str {
        "is_servo_dual_setup"
    }

    fn description(&self) -> &str {
        "Servo drives the device through two debug channels"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let st = servo_type(info).await?;
        if !st.is_dual_setup() {
            return Err(RecoveryError::failed(format!("servo type {st} is not a dual setup")));
        }
        Ok(())
    }
}

pub struct ServoDetectUsbkey;

#[async_trait]
impl Exec for ServoDetectUsbkey {
    fn name(&self) -> &str {
        "servo_detect_usbkey"
    }

    fn description(&self) -> &str {
        "USB key is plugged into the servo and readable from the servo host"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let servod = info.servod()?;
        update_usb_visibility(servod.as_ref(), info.cancel(), UsbVisibility::Host).await?;
        let dev = get_string(servod.as_ref(), info.cancel(), USBKEY_DEV_CONTROL).await?;
        if dev.is_empty() {
            return Err(RecoveryError::failed("detect usbkey: no usb key path reported"));
        }
        info.servo_host_runner()?
            .run(info.cancel(), info.timeout, "fdisk", &["-l", &dev])
            .await
            .map_err(|e| e.context(format!("detect usbkey {dev}")))?;
        tracing::info!(dev = %dev, "usb key detected");
        Ok(())
    }
}

pub struct ServoColdResetDut;

#[async_trait]
impl Exec for ServoColdResetDut {
    fn name(&self) -> &str {
        "servo_cold_reset_dut"
    }

    fn description(&self) -> &str {
        "Cold reset the device through servo, optionally waiting for ssh"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        set_power_state(info.servod()?.as_ref(), info.cancel(), PowerState::Reset).await?;
        if info.args.has("wait_timeout") {
            let wait = info.args.as_duration_secs("wait_timeout", 150);
            cros::wait_until_ssh_able(
                info.dut_runner().as_ref(),
                info.cancel(),
                wait,
                Duration::from_secs(10),
            )
            .await?;
        }
        Ok(())
    }
}

pub struct ServoSetEcUartCmd;

#[async_trait]
impl Exec for ServoSetEcUartCmd {
    fn name(&self) -> &str {
        "servo_set_ec_uart_cmd"
    }

    fn description(&self) -> &str {
        "Send the `value` argument to the EC console"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let value = info.required_arg("value")?;
        let wait = info.args.as_duration_secs("wait_timeout", 1);
        set_ec_uart_cmd(info.servod()?.as_ref(), info.cancel(), &value, wait)
            .await
            .map_err(|e| e.context("servo set ec uart cmd"))
    }
}

// ---------------------------------------------------------------------------
// Topology and firmware
// ---------------------------------------------------------------------------

/// Servo host runner, servo serial and firmware channel from inventory.
fn servo_identity(info: &ExecInfo) -> Result<(Arc<dyn Runner>, String, FirmwareChannel)> {
    let runner = info.servo_host_runner()?;
    let servo = info
        .dut()
        .servo_host
        .as_ref()
        .map(|h| h.servo.clone())
        .unwrap_or_default();
    if servo.serial_number.is_empty() {
        return Err(RecoveryError::usage(format!(
            "{}: servo serial number is not known",
            info.action_name
        )));
    }
    Ok((runner, servo.serial_number, servo.firmware_channel))
}

async fn read_topology(info: &ExecInfo) -> Result<(Arc<dyn Runner>, Topology, FirmwareChannel)> {
    let (runner, serial, channel) = servo_identity(info)?;
    let topology = retrieve_topology(runner.as_ref(), info.cancel(), &serial)
        .await
        .map_err(|e| e.context("servo topology"))?;
    Ok((runner, topology, channel))
}

pub struct ServoTopologyUpdate;

#[async_trait]
impl Exec for ServoTopologyUpdate {
    fn name(&self) -> &str {
        "servo_topology_update"
    }

    fn description(&self) -> &str {
        "Servo USB topology has a root and at least `min_child` children"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let min_child = info.args.as_int("min_child", 0).max(0) as usize;
        let (_, topology, _) = read_topology(info).await?;
        let Some(root) = &topology.root else {
            return Err(RecoveryError::failed("servo topology: root servo not found"));
        };
        tracing::info!(
            root = %root.servo_type,
            children = topology.children.len(),
            "servo topology"
        );
        if topology.children.len() < min_child {
            return Err(RecoveryError::failed(format!(
                "servo topology: {} children, expected at least {min_child}",
                topology.children.len()
            )));
        }
        Ok(())
    }
}

pub struct IsRootServoPresent;

#[async_trait]
impl Exec for IsRootServoPresent {
    fn name(&self) -> &str {
        "is_root_servo_present"
    }

    fn description(&self) -> &str {
        "Root servo is visible on the servo host USB bus"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let (runner, serial, _) = servo_identity(info)?;
        let path = topology::root_servo_path(runner.as_ref(), info.cancel(), &serial).await?;
        let root = topology::read_device(runner.as_ref(), info.cancel(), &path).await?;
        if !root.is_good() {
            return Err(RecoveryError::failed(format!(
                "root servo at {path} is missing data"
            )));
        }
        Ok(())
    }
}

pub struct ServoFirmwareNeedsUpdate;

#[async_trait]
impl Exec for ServoFirmwareNeedsUpdate {
    fn name(&self) -> &str {
        "servo_firmware_needs_update"
    }

    fn description(&self) -> &str {
        "Some servo device runs outdated firmware"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let (runner, topology, channel) = read_topology(info).await?;
        for device in topology.devices("") {
            if needs_update(runner.as_ref(), info.cancel(), device, channel).await {
                tracing::info!(servo_type = %device.servo_type, "servo firmware outdated");
                return Ok(());
            }
        }
        Err(RecoveryError::failed("servo firmware is up to date"))
    }
}

pub struct ServoUpdateServoFirmware;

#[async_trait]
impl Exec for ServoUpdateServoFirmware {
    fn name(&self) -> &str {
        "servo_update_servo_firmware"
    }

    fn description(&self) -> &str {
        "Update firmware of the servo devices with servo_updater"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let force = info.args.as_bool("force_update", false);
        let req = FwUpdateRequest {
            channel: FirmwareChannel::default(),
            attempts: if force {
                1
            } else {
                info.args.as_int("try_attempt_count", 1).max(1) as u32
            },
            force_after_fail: !force && info.args.as_bool("try_force_update_after_fail", false),
            force,
            ignore_version: info.args.as_bool("ignore_version", false),
        };
        let board = info.args.as_string("servo_board", "");
        let (runner, topology, channel) = read_topology(info).await?;
        let req = FwUpdateRequest { channel, ..req };
        let mut devices: Vec<_> = topology.devices(&board).into_iter().cloned().collect();
        if devices.is_empty() {
            return Err(RecoveryError::failed(format!(
                "update servo firmware: no devices found for board {board:?}"
            )));
        }
        let mut records = Vec::with_capacity(devices.len());
        for device in &devices {
            records.push(if updater::is_updatable(&device.servo_type) {
                let kind = format!("servo_firmware_update:{}", device.servo_type);
                info.run_args.start_metric(&kind).await
            } else {
                None
            });
        }
        let failed = update_devices_fw(runner.as_ref(), info.cancel(), &req, &mut devices).await?;
        for (device, record) in devices.iter().zip(records) {
            let outcome = if failed.contains(&device.servo_type) {
                Err(RecoveryError::failed(format!("{} not updated", device.servo_type)))
            } else {
                Ok(())
            };
            let observations = [Observation::string("fw_version", device.fw_version.as_str())];
            info.run_args
                .finish_metric(record, outcome.as_ref().map(|_| ()), &observations)
                .await;
        }
        if !failed.is_empty() {
            return Err(RecoveryError::failed(format!(
                "update servo firmware: failed for {}",
                failed.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::{Dut, ServoHost};
    use crate::exec::{test_info, RunArgs};
    use crate::testing::{FakeAccess, FakeRunner, FakeServod, Reply};
    use crate::tlw::ServodValue;
    use std::sync::Arc;

    fn servo_dut() -> Dut {
        let mut dut = Dut::new("dut1");
        dut.servo_host = Some(ServoHost {
            name: "dut1-servo".into(),
            servod_port: 9999,
            servo: Default::default(),
        });
        dut
    }

    fn run_args(access: FakeAccess) -> Arc<RunArgs> {
        Arc::new(RunArgs::new(servo_dut(), Arc::new(access)))
    }

    #[tokio::test]
    async fn servo_type_checks_read_servod() {
        let mut access = FakeAccess::new(servo_dut());
        access.servod = Some(FakeServod::new().with("servo_type", "servo_v4_with_ccd_cr50"));
        let args = run_args(access);
        IsServoV4.run(&test_info(args.clone(), &[])).await.unwrap();
        IsServoTypeCcd.run(&test_info(args.clone(), &[])).await.unwrap();
        assert!(IsServoDualSetup.run(&test_info(args, &[])).await.is_err());
    }

    #[tokio::test]
    async fn power_state_argument_is_validated() {
        let mut access = FakeAccess::new(servo_dut());
        let servod = FakeServod::new();
        access.servod = Some(servod.clone());
        let args = run_args(access);
        let err = ServoSetPowerState
            .run(&test_info(args.clone(), &["state:sideways"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Usage(_)));
        ServoSetPowerState
            .run(&test_info(args, &["state:rec"]))
            .await
            .unwrap();
        assert_eq!(servod.value("power_state"), Some(ServodValue::from("rec")));
    }

    #[tokio::test]
    async fn detect_usbkey_checks_path_on_servo_host() {
        let mut access = FakeAccess::new(servo_dut());
        let host_runner = FakeRunner::new();
        host_runner.on("fdisk -l /dev/sdb", Reply::ok(""));
        access
            .runners
            .insert("dut1-servo".to_string(), host_runner.clone());
        access.servod = Some(FakeServod::new().with(USBKEY_DEV_CONTROL, "/dev/sdb"));
        ServoDetectUsbkey
            .run(&test_info(run_args(access), &[]))
            .await
            .unwrap();
        assert!(host_runner.called("fdisk -l /dev/sdb"));
    }

    #[tokio::test(start_paused = true)]
    async fn ec_uart_cmd_requires_value() {
        let mut access = FakeAccess::new(servo_dut());
        let servod = FakeServod::new();
        access.servod = Some(servod.clone());
        let args = run_args(access);
        let err = ServoSetEcUartCmd
            .run(&test_info(args.clone(), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Usage(_)));
        ServoSetEcUartCmd
            .run(&test_info(args, &["value:pd dualrole snk"]))
            .await
            .unwrap();
        assert_eq!(
            servod.value("ec_uart_cmd"),
            Some(ServodValue::from("pd dualrole snk"))
        );
    }

    #[tokio::test]
    async fn has_servo_fails_without_servo_host() {
        let access = FakeAccess::new(Dut::new("bare"));
        let args = Arc::new(RunArgs::new(Dut::new("bare"), Arc::new(access)));
        assert!(DutHasServo.run(&test_info(args, &[])).await.is_err());
    }

    fn serial_dut() -> Dut {
        let mut dut = servo_dut();
        if let Some(host) = dut.servo_host.as_mut() {
            host.servo.serial_number = "SV4".into();
        }
        dut
    }

    fn hub_access(micro_version: &str) -> (FakeAccess, Arc<FakeRunner>) {
        let mut access = FakeAccess::new(serial_dut());
        let host_runner = FakeRunner::new();
        crate::servo::topology::tests::script_v4_hub(&host_runner, micro_version);
        host_runner
            .on(
                "servo_updater -p -b \"servo_v4\" -c stable",
                Reply::ok("firmware: servo_v4_v2.4.58"),
            )
            .on(
                "servo_updater -p -b \"servo_micro\" -c stable",
                Reply::ok("firmware: v2"),
            );
        access
            .runners
            .insert("dut1-servo".to_string(), host_runner.clone());
        (access, host_runner)
    }

    #[tokio::test]
    async fn topology_update_checks_children_count() {
        let (access, _) = hub_access("v2");
        let args = Arc::new(RunArgs::new(serial_dut(), Arc::new(access)));
        ServoTopologyUpdate
            .run(&test_info(args.clone(), &["min_child:1"]))
            .await
            .unwrap();
        let err = ServoTopologyUpdate
            .run(&test_info(args.clone(), &["min_child:2"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 children"), "{err}");
        IsRootServoPresent.run(&test_info(args, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn topology_execs_need_servo_serial() {
        let args = run_args(FakeAccess::new(servo_dut()));
        let err = ServoTopologyUpdate
            .run(&test_info(args.clone(), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Usage(_)));
        assert!(matches!(
            IsRootServoPresent.run(&test_info(args, &[])).await,
            Err(RecoveryError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn firmware_needs_update_compares_with_latest() {
        let (access, _) = hub_access("v1");
        let args = Arc::new(RunArgs::new(serial_dut(), Arc::new(access)));
        ServoFirmwareNeedsUpdate.run(&test_info(args, &[])).await.unwrap();

        let (access, _) = hub_access("v2");
        let args = Arc::new(RunArgs::new(serial_dut(), Arc::new(access)));
        assert!(ServoFirmwareNeedsUpdate.run(&test_info(args, &[])).await.is_err());
    }

    #[tokio::test]
    async fn firmware_update_touches_only_outdated_devices() {
        let mut access = FakeAccess::new(serial_dut());
        let host_runner = FakeRunner::new();
        host_runner.on_seq(
            "cat /sys/bus/usb/devices/1-4/1-4.2/configuration",
            vec![Reply::ok("v1"), Reply::ok("v2")],
        );
        crate::servo::topology::tests::script_v4_hub(&host_runner, "v1");
        host_runner
            .on(
                "servo_updater -p -b \"servo_v4\" -c stable",
                Reply::ok("firmware: servo_v4_v2.4.58"),
            )
            .on(
                "servo_updater -p -b \"servo_micro\" -c stable",
                Reply::ok("firmware: v2"),
            );
        access
            .runners
            .insert("dut1-servo".to_string(), host_runner.clone());
        let metrics = Arc::new(crate::metrics::MemoryMetrics::new());
        let mut args = RunArgs::new(serial_dut(), Arc::new(access));
        args.metrics = Some(metrics.clone());

        ServoUpdateServoFirmware
            .run(&test_info(Arc::new(args), &["try_attempt_count:2"]))
            .await
            .unwrap();
        assert!(host_runner.called("servo_updater -b servo_micro -s MICRO -c stable --reboot"));
        assert!(!host_runner.called("servo_updater -b servo_v4"));

        let mut kinds: Vec<String> = metrics.actions().into_iter().map(|a| a.kind).collect();
        kinds.sort();
        assert_eq!(
            kinds,
            ["servo_firmware_update:servo_micro", "servo_firmware_update:servo_v4"]
        );
    }

    #[tokio::test]
    async fn firmware_update_with_unknown_board_fails() {
        let (access, _) = hub_access("v2");
        let args = Arc::new(RunArgs::new(serial_dut(), Arc::new(access)));
        let err = ServoUpdateServoFirmware
            .run(&test_info(args, &["servo_board:sweetberry"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no devices found"), "{err}");
    }
}
