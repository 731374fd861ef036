//! Operations on the ChromeOS host itself: release info, reboot and halt,
//! reachability, the boot-source check, firmware variables and storage
//! health.

pub mod recovery_mode;
pub mod storage;

pub use recovery_mode::{boot_in_recovery_mode, BootInRecoveryRequest};
pub use storage::{parse_smart_info, read_storage_smart, StorageSmart, StorageState, StorageType};

use crate::error::{RecoveryError, Result};
use crate::retry;
use crate::tlw::{Pinger, Runner};
use regex::Regex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RELEASE_TIMEOUT: Duration = Duration::from_secs(60);
const SSH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const STORAGE_TIMEOUT: Duration = Duration::from_secs(60);

pub const RELEASE_BOARD_KEY: &str = "CHROMEOS_RELEASE_BOARD";
pub const RELEASE_TRACK_KEY: &str = "CHROMEOS_RELEASE_TRACK";
pub const RELEASE_BUILDER_PATH_KEY: &str = "CHROMEOS_RELEASE_BUILDER_PATH";

// ---------------------------------------------------------------------------
// Release info
// ---------------------------------------------------------------------------

/// Value of `key` in `/etc/lsb-release`.
pub async fn release_info(runner: &dyn Runner, cancel: &CancellationToken, key: &str) -> Result<String> {
    let out = runner
        .run(
            cancel,
            RELEASE_TIMEOUT,
            "cat",
            &["/etc/lsb-release", "|", "grep", key],
        )
        .await
        .map_err(|e| e.context(format!("release info {key}")))?;
    parse_release_value(&out, key)
}

fn parse_release_value(out: &str, key: &str) -> Result<String> {
    let re = Regex::new(&format!(r"{}=(\S+)", regex::escape(key)))
        .map_err(|e| RecoveryError::failed(format!("release info {key}: {e}")))?;
    re.captures(out)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| RecoveryError::failed(format!("release info {key}: not found")))
}

pub async fn release_board(runner: &dyn Runner, cancel: &CancellationToken) -> Result<String> {
    release_info(runner, cancel, RELEASE_BOARD_KEY).await
}

pub async fn release_track(runner: &dyn Runner, cancel: &CancellationToken) -> Result<String> {
    release_info(runner, cancel, RELEASE_TRACK_KEY).await
}

pub async fn release_builder_path(runner: &dyn Runner, cancel: &CancellationToken) -> Result<String> {
    release_info(runner, cancel, RELEASE_BUILDER_PATH_KEY).await
}

// ---------------------------------------------------------------------------
// Reboot and halt
// ---------------------------------------------------------------------------

const REBOOT_COMMAND: &str = "(sync; sleep 1; reboot; sleep 1; reboot -f; sleep 1; reboot -nf; sleep 1; telinit 6) </dev/null >/dev/null 2>&1";

/// Reboot the host. A dropped connection counts as success.
pub async fn reboot(runner: &dyn Runner, cancel: &CancellationToken) -> Result<()> {
    tracing::info!("rebooting host");
    absorb_no_exit_status(
        runner
            .run(cancel, Duration::from_secs(60), REBOOT_COMMAND, &[])
            .await,
    )
    .map_err(|e| e.context("reboot"))
}

/// Halt the host. A dropped connection counts as success.
pub async fn halt(runner: &dyn Runner, cancel: &CancellationToken, timeout: Duration) -> Result<()> {
    absorb_no_exit_status(runner.run(cancel, timeout, "halt", &[]).await)
        .map_err(|e| e.context("halt"))
}

/// Only reboot-class commands may treat a lost connection as success.
fn absorb_no_exit_status(res: Result<String>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(e) if e.is_no_exit_status() => {
            tracing::debug!("connection dropped without exit status, as expected");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Reachability
// ---------------------------------------------------------------------------

pub async fn is_ssh_able(runner: &dyn Runner, cancel: &CancellationToken) -> Result<()> {
    runner
        .run(cancel, SSH_CHECK_TIMEOUT, "true", &[])
        .await
        .map(|_| ())
}

pub async fn wait_until_ssh_able(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    retry::with_timeout(cancel, timeout, interval, "wait until ssh-able", || {
        is_ssh_able(runner, cancel)
    })
    .await
}

pub async fn wait_until_pingable(
    pinger: &dyn Pinger,
    cancel: &CancellationToken,
    count: u32,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    retry::with_timeout(cancel, timeout, interval, "wait until pingable", || {
        pinger.ping(cancel, count)
    })
    .await
}

// ---------------------------------------------------------------------------
// Boot storage
// ---------------------------------------------------------------------------

const FIXED_STORAGE_COMMAND: &str = ". /usr/sbin/write_gpt.sh; . /usr/share/misc/chromeos-common.sh; load_base_vars; get_fixed_dst_drive";

/// The host booted from something other than its fixed internal storage.
pub async fn is_booted_from_external_storage(
    runner: &dyn Runner,
    cancel: &CancellationToken,
) -> Result<bool> {
    let boot = runner
        .run(cancel, STORAGE_TIMEOUT, "rootdev", &["-s", "-d"])
        .await
        .map_err(|e| e.context("read boot storage"))?;
    let fixed = runner
        .run(cancel, STORAGE_TIMEOUT, FIXED_STORAGE_COMMAND, &[])
        .await
        .map_err(|e| e.context("read fixed storage"))?;
    let (boot, fixed) = (boot.trim(), fixed.trim());
    if fixed.is_empty() {
        tracing::debug!(boot, "fixed storage not detected");
        return Ok(true);
    }
    tracing::debug!(boot, fixed, "boot storage");
    Ok(boot != fixed)
}

// ---------------------------------------------------------------------------
// Crossystem
// ---------------------------------------------------------------------------

/// Set a firmware variable with `crossystem key=value`, optionally reading
/// it back to confirm the new value took.
pub async fn update_crossystem(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    key: &str,
    value: &str,
    check_after_update: bool,
) -> Result<()> {
    let assignment = format!("{key}={value}");
    runner
        .run(cancel, RELEASE_TIMEOUT, "crossystem", &[&assignment])
        .await
        .map_err(|e| e.context(format!("crossystem {assignment}")))?;
    if !check_after_update {
        return Ok(());
    }
    let current = runner
        .run(cancel, RELEASE_TIMEOUT, "crossystem", &[key])
        .await
        .map_err(|e| e.context(format!("crossystem {key}")))?;
    if current.trim() != value {
        return Err(RecoveryError::failed(format!(
            "crossystem {key}: expected {value:?}, got {:?}",
            current.trim()
        )));
    }
    Ok(())
}
