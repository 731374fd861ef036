use super::{halt, is_booted_from_external_storage, wait_until_ssh_able};
use crate::dut::Dut;
use crate::error::{RecoveryError, Result};
use crate::servo::{
    recovery_mode_requires_pd_off, set_pd_role, set_power_state, update_usb_visibility, PdRole,
    PowerState, UsbVisibility,
};
use crate::tlw::{Runner, Servod};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct BootInRecoveryRequest<'a> {
    pub boot_timeout: Duration,
    pub boot_interval: Duration,
    /// Work to do while the host runs from the USB key. Polled only after the
    /// host is confirmed booted from external storage.
    pub callback: Option<BoxFuture<'a, Result<()>>>,
    pub halt_timeout: Duration,
    /// Also restore power, USB and PD when booting into recovery mode fails.
    pub ignore_reboot_failure: bool,
}

/// Boot the host from the servo USB key and run the callback there.
///
/// Once the host has been powered down, every exit path that runs cleanup
/// leaves it powered on with the USB key hidden and PD back on source.
pub async fn boot_in_recovery_mode(
    dut: &Dut,
    dut_runner: &dyn Runner,
    servod: &dyn Servod,
    cancel: &CancellationToken,
    req: BootInRecoveryRequest<'_>,
) -> Result<()> {
    let BootInRecoveryRequest {
        boot_timeout,
        boot_interval,
        callback,
        halt_timeout,
        ignore_reboot_failure,
    } = req;
    let need_sink = recovery_mode_requires_pd_off(dut, dut_runner, servod, cancel).await;
    tracing::info!(dut = %dut.name, need_sink, "booting in recovery mode");

    let booted = enter_recovery_mode(
        dut_runner,
        servod,
        cancel,
        boot_timeout,
        boot_interval,
        need_sink,
    )
    .await;
    if let Err(e) = booted {
        if ignore_reboot_failure {
            if let Err(cleanup_err) =
                cleanup(dut_runner, servod, cancel, halt_timeout, need_sink).await
            {
                tracing::warn!(error = %cleanup_err, "cleanup after failed recovery boot");
            }
        }
        return Err(e.context("boot in recovery mode"));
    }

    let callback_result = match callback {
        Some(cb) => tokio::select! {
            res = cb => res,
            _ = cancel.cancelled() => Err(RecoveryError::Cancelled),
        },
        None => Ok(()),
    };
    let cleanup_result = cleanup(dut_runner, servod, cancel, halt_timeout, need_sink).await;
    match (callback_result, cleanup_result) {
        (Err(e), Err(cleanup_err)) => {
            tracing::warn!(error = %cleanup_err, "cleanup after recovery mode callback");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), res) => res.map_err(|e| e.context("boot in recovery mode")),
    }
}

async fn enter_recovery_mode(
    dut_runner: &dyn Runner,
    servod: &dyn Servod,
    cancel: &CancellationToken,
    boot_timeout: Duration,
    boot_interval: Duration,
    need_sink: bool,
) -> Result<()> {
    set_power_state(servod, cancel, PowerState::Off).await?;
    update_usb_visibility(servod, cancel, UsbVisibility::Dut).await?;
    if need_sink {
        set_pd_role(servod, cancel, PdRole::Snk, true).await?;
    }
    set_power_state(servod, cancel, PowerState::Rec).await?;
    wait_until_ssh_able(dut_runner, cancel, boot_timeout, boot_interval).await?;
    if !is_booted_from_external_storage(dut_runner, cancel).await? {
        return Err(RecoveryError::failed("host did not boot from external storage"));
    }
    tracing::info!("host booted from usb key");
    Ok(())
}

async fn cleanup(
    dut_runner: &dyn Runner,
    servod: &dyn Servod,
    cancel: &CancellationToken,
    halt_timeout: Duration,
    need_sink: bool,
) -> Result<()> {
    // Cleanup has to finish even when the run is being cancelled.
    let fresh = CancellationToken::new();
    let cancel = if cancel.is_cancelled() { &fresh } else { cancel };

    let mut first_err: Option<RecoveryError> = None;
    let mut note = |step: &str, res: Result<()>| {
        if let Err(e) = res {
            tracing::warn!(step, error = %e, "recovery mode cleanup");
            first_err.get_or_insert(e);
        }
    };
    note("halt", halt(dut_runner, cancel, halt_timeout).await);
    note("power off", set_power_state(servod, cancel, PowerState::Off).await);
    note(
        "usb off",
        update_usb_visibility(servod, cancel, UsbVisibility::Off).await,
    );
    if need_sink {
        note("pd src", set_pd_role(servod, cancel, PdRole::Src, true).await);
    }
    note("power on", set_power_state(servod, cancel, PowerState::On).await);
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::Battery;
    use crate::testing::{self, FakeRunner, FakeServod, Reply};
    use crate::tlw::ServodValue;
    use std::sync::Arc;

    fn dut_with_battery() -> Dut {
        let mut dut = Dut::new("dut-1");
        dut.battery = Some(Battery::default());
        dut
    }

    fn pd_capable_servod() -> Arc<FakeServod> {
        FakeServod::new()
            .with("root.dut_connection_type", "type-c")
            .with("ppchg5_mv", 5000i64)
            .with("servo_pd_role", "src")
    }

    fn usb_booted_runner() -> Arc<FakeRunner> {
        let runner = FakeRunner::new();
        runner
            .on(
                "power_supply_info",
                Reply::ok("Device: Battery\n  present: yes\n"),
            )
            .on("rootdev", Reply::ok("/dev/sda"))
            .on(". /usr/sbin/write_gpt.sh", Reply::ok("/dev/mmcblk0"))
            .on("halt", Reply::NoExitStatus);
        runner
    }

    fn request<'a>(callback: Option<BoxFuture<'a, Result<()>>>, ignore: bool) -> BootInRecoveryRequest<'a> {
        BootInRecoveryRequest {
            boot_timeout: Duration::from_secs(30),
            boot_interval: Duration::from_secs(10),
            callback,
            halt_timeout: Duration::from_secs(60),
            ignore_reboot_failure: ignore,
        }
    }

    fn set(control: &str, value: &str) -> (String, ServodValue) {
        (control.to_string(), ServodValue::from(value))
    }

    #[tokio::test]
    async fn cleanup_runs_after_callback_failure() {
        let runner = usb_booted_runner();
        let servod = pd_capable_servod();
        let cancel = CancellationToken::new();
        let callback: BoxFuture<'_, Result<()>> =
            Box::pin(async { Err(RecoveryError::failed("install failed")) });
        let err = boot_in_recovery_mode(
            &dut_with_battery(),
            runner.as_ref(),
            servod.as_ref(),
            &cancel,
            request(Some(callback), false),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "install failed");
        assert_eq!(
            servod.sets(),
            vec![
                set("power_state", "off"),
                set("image_usbkey_direction", "dut_sees_usbkey"),
                set("servo_pd_role", "snk"),
                set("power_state", "rec"),
                set("power_state", "off"),
                set("image_usbkey_pwr", "off"),
                set("servo_pd_role", "src"),
                set("power_state", "on"),
            ]
        );
        let calls = runner.calls();
        let halt_at = calls.iter().position(|c| c == "halt").unwrap();
        assert!(calls.iter().position(|c| c.starts_with("rootdev")).unwrap() < halt_at);
    }

    #[tokio::test]
    async fn cleanup_halts_before_servo_steps() {
        let trace = testing::trace();
        let runner = usb_booted_runner();
        runner.trace_to(&trace);
        let servod = pd_capable_servod().trace_to(&trace);
        let cancel = CancellationToken::new();
        let callback: BoxFuture<'_, Result<()>> = Box::pin(async { Ok(()) });
        boot_in_recovery_mode(
            &dut_with_battery(),
            runner.as_ref(),
            servod.as_ref(),
            &cancel,
            request(Some(callback), false),
        )
        .await
        .unwrap();
        let events = trace.lock().unwrap().clone();
        let from = events
            .iter()
            .position(|e| e == "run halt")
            .expect("halt in trace");
        assert_eq!(
            events[from..],
            [
                "run halt",
                "set power_state:off",
                "set image_usbkey_pwr:off",
                "set servo_pd_role:src",
                "set power_state:on",
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_callback_still_cleans_up() {
        let runner = usb_booted_runner();
        let servod = pd_capable_servod();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let callback: BoxFuture<'_, Result<()>> = Box::pin(async move {
            stop.cancel();
            std::future::pending().await
        });
        let err = boot_in_recovery_mode(
            &dut_with_battery(),
            runner.as_ref(),
            servod.as_ref(),
            &cancel,
            request(Some(callback), false),
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(runner.called("halt"));
        assert_eq!(servod.value("power_state"), Some("on".into()));
        assert_eq!(servod.value("image_usbkey_pwr"), Some("off".into()));
        assert_eq!(servod.value("servo_pd_role"), Some("src".into()));
    }

    #[tokio::test]
    async fn success_without_sink_leaves_pd_alone() {
        let runner = usb_booted_runner();
        let servod = pd_capable_servod();
        let cancel = CancellationToken::new();
        boot_in_recovery_mode(
            &Dut::new("no-battery"),
            runner.as_ref(),
            servod.as_ref(),
            &cancel,
            request(None, false),
        )
        .await
        .unwrap();
        assert!(!servod.sets().iter().any(|(c, _)| c == "servo_pd_role"));
        assert_eq!(servod.value("power_state"), Some("on".into()));
        assert_eq!(servod.value("image_usbkey_pwr"), Some("off".into()));
    }

    #[tokio::test]
    async fn internal_boot_fails_and_cleans_up_when_asked() {
        let runner = FakeRunner::new();
        runner
            .on("rootdev", Reply::ok("/dev/mmcblk0"))
            .on(". /usr/sbin/write_gpt.sh", Reply::ok("/dev/mmcblk0"));
        let servod = pd_capable_servod();
        let cancel = CancellationToken::new();
        let res = boot_in_recovery_mode(
            &dut_with_battery(),
            runner.as_ref(),
            servod.as_ref(),
            &cancel,
            request(None, true),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(servod.value("power_state"), Some("on".into()));
        assert_eq!(servod.value("image_usbkey_pwr"), Some("off".into()));
        assert_eq!(servod.value("servo_pd_role"), Some("src".into()));
    }

    #[tokio::test]
    async fn internal_boot_without_ignore_skips_cleanup() {
        let runner = FakeRunner::new();
        runner
            .on("rootdev", Reply::ok("/dev/mmcblk0"))
            .on(". /usr/sbin/write_gpt.sh", Reply::ok("/dev/mmcblk0"));
        let servod = pd_capable_servod();
        let cancel = CancellationToken::new();
        let res = boot_in_recovery_mode(
            &Dut::new("dut"),
            runner.as_ref(),
            servod.as_ref(),
            &cancel,
            request(None, false),
        )
        .await;
        assert!(res.is_err());
        assert!(!runner.called("halt"));
        assert_eq!(servod.value("power_state"), Some("rec".into()));
    }
}
