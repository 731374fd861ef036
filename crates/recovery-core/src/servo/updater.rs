//! Servo firmware updates through `servo_updater` on the servo host.

use super::topology::{read_sysfs, TopologyItem};
use crate::dut::FirmwareChannel;
use crate::error::{RecoveryError, Result};
use crate::retry;
use crate::tlw::Runner;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const UPDATABLE: &[&str] = &["servo_v4", "servo_v4p1", "servo_micro", "c2d2", "sweetberry"];
/// Updater failures that another attempt will not fix.
const UPDATER_ISSUES: &[&str] = &["Configuration not set"];

const LATEST_VERSION_TIMEOUT: Duration = Duration::from_secs(60);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(120);
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

pub fn is_updatable(servo_type: &str) -> bool {
    UPDATABLE.contains(&servo_type)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FwUpdateRequest {
    pub channel: FirmwareChannel,
    /// Attempts per device before giving up or forcing.
    pub attempts: u32,
    pub force_after_fail: bool,
    pub force: bool,
    /// Skip version checks before and after the update.
    pub ignore_version: bool,
}

/// Latest firmware version the updater would install, empty when it cannot
/// tell.
pub async fn latest_version(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    channel: FirmwareChannel,
    servo_type: &str,
) -> String {
    let cmd = format!("servo_updater -p -b \"{servo_type}\" -c {channel} | grep firmware");
    match runner.run(cancel, LATEST_VERSION_TIMEOUT, &cmd, &[]).await {
        Ok(out) => match out.trim().split(':').collect::<Vec<_>>()[..] {
            [_, version] => version.trim().to_string(),
            _ => String::new(),
        },
        Err(e) => {
            tracing::debug!(servo_type, error = %e, "latest servo firmware unknown");
            String::new()
        }
    }
}

/// An updatable device needs an update when its version is unknown or
/// differs from the latest.
pub async fn needs_update(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    device: &TopologyItem,
    channel: FirmwareChannel,
) -> bool {
    if !is_updatable(&device.servo_type) {
        tracing::debug!(servo_type = %device.servo_type, "servo type cannot be updated");
        return false;
    }
    if device.fw_version.is_empty() {
        return true;
    }
    let latest = latest_version(runner, cancel, channel, &device.servo_type).await;
    if device.fw_version != latest {
        tracing::info!(
            servo_type = %device.servo_type,
            current = %device.fw_version,
            latest = %latest,
            "servo firmware version mismatch"
        );
        return true;
    }
    false
}

/// Kill updaters left running for `serial`.
async fn kill_stray_updaters(runner: &dyn Runner, cancel: &CancellationToken, serial: &str) {
    let fresh;
    let cancel = if cancel.is_cancelled() {
        fresh = CancellationToken::new();
        &fresh
    } else {
        cancel
    };
    let cmd = format!(
        "ps aux | grep -ie [s]ervo_updater | grep \"{serial}\" | awk '{{print $2}}' | xargs -r kill -9"
    );
    if let Err(e) = runner.run(cancel, KILL_TIMEOUT, &cmd, &[]).await {
        tracing::debug!(serial, error = %e, "kill servo_updater failed");
    }
}

/// Run `servo_updater` for one device unless its version is already current.
pub async fn update_device(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    device: &TopologyItem,
    req: &FwUpdateRequest,
) -> Result<()> {
    if !req.ignore_version && !needs_update(runner, cancel, device, req.channel).await {
        tracing::debug!(servo_type = %device.servo_type, "servo firmware is current");
        return Ok(());
    }
    let channel = req.channel.to_string();
    let mut args = vec![
        "-b",
        device.servo_type.as_str(),
        "-s",
        device.serial.as_str(),
        "-c",
        channel.as_str(),
        "--reboot",
    ];
    if req.force {
        args.push("--force");
    }
    tracing::info!(servo_type = %device.servo_type, force = req.force, "updating servo firmware");
    let res = runner.run(cancel, UPDATE_TIMEOUT, "servo_updater", &args).await;
    kill_stray_updaters(runner, cancel, &device.serial).await;
    let out = res.map_err(|e| e.context(format!("update {} firmware", device.servo_type)))?;
    tracing::debug!(servo_type = %device.servo_type, output = %out, "servo_updater finished");
    Ok(())
}

/// One update, then a re-read of the version the device reports.
async fn update_attempt(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    device: &mut TopologyItem,
    req: &FwUpdateRequest,
) -> Result<()> {
    if let Err(e) = update_device(runner, cancel, device, req).await {
        if matches!(e, RecoveryError::Cancelled) {
            return Err(e);
        }
        let text = e.to_string();
        if UPDATER_ISSUES.iter().any(|issue| text.contains(issue)) {
            return Err(e.context("servo_updater issue detected"));
        }
        tracing::debug!(servo_type = %device.servo_type, error = %e, "servo firmware update failed");
    }
    let path = device.sysfs_path.clone();
    device.fw_version = retry::with_count(cancel, 3, Duration::from_secs(1), "re-read servo firmware", || {
        read_sysfs(runner, cancel, &path, "configuration")
    })
    .await?;
    if req.ignore_version || !needs_update(runner, cancel, device, req.channel).await {
        tracing::info!(servo_type = %device.servo_type, version = %device.fw_version, "servo firmware updated");
        return Ok(());
    }
    Err(RecoveryError::failed(format!(
        "{} still needs a firmware update",
        device.servo_type
    )))
}

/// Update every complete, updatable device. Returns the types of the
/// devices that could not be brought up to date.
pub async fn update_devices_fw(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    req: &FwUpdateRequest,
    devices: &mut [TopologyItem],
) -> Result<Vec<String>> {
    let mut failed = Vec::new();
    for device in devices.iter_mut() {
        if !device.is_good() || !is_updatable(&device.servo_type) {
            tracing::debug!(servo_type = %device.servo_type, "servo device skipped for update");
            continue;
        }
        let mut last = Ok(());
        for attempt in 1..=req.attempts.max(1) {
            last = update_attempt(runner, cancel, device, req).await;
            match &last {
                Ok(()) => break,
                Err(RecoveryError::Cancelled) => return Err(RecoveryError::Cancelled),
                Err(e) => tracing::debug!(servo_type = %device.servo_type, attempt, error = %e, "attempt failed"),
            }
        }
        if last.is_err() && req.force_after_fail {
            let forced = FwUpdateRequest { force: true, ..*req };
            last = update_attempt(runner, cancel, device, &forced).await;
            if matches!(last, Err(RecoveryError::Cancelled)) {
                return Err(RecoveryError::Cancelled);
            }
        }
        if last.is_err() {
            tracing::info!(servo_type = %device.servo_type, "servo firmware update failed");
            failed.push(device.servo_type.clone());
        }
    }
    Ok(failed)
}
