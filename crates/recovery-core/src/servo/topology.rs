//! USB topology of a servo: the root device servodtool reports and every
//! device hanging off the same hub, read from sysfs on the servo host.

use crate::error::{RecoveryError, Result};
use crate::tlw::Runner;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const USB_DEVICES_PATH: &str = "/sys/bus/usb/devices";
const SERVODTOOL_TIMEOUT: Duration = Duration::from_secs(60);
const SYSFS_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Servo type for each `idVendor:idProduct` pair.
const VID_PID_TYPES: &[(&str, &str)] = &[
    ("18d1:501b", "servo_v4"),
    ("18d1:520d", "servo_v4p1"),
    ("18d1:5014", "ccd_cr50"),
    ("18d1:504a", "ccd_gsc"),
    ("18d1:501a", "servo_micro"),
    ("18d1:5041", "c2d2"),
    ("18d1:5020", "sweetberry"),
];

pub fn servo_type_for_vid_pid(vid_pid: &str) -> Option<&'static str> {
    VID_PID_TYPES
        .iter()
        .find(|(id, _)| *id == vid_pid)
        .map(|(_, servo_type)| *servo_type)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyItem {
    pub serial: String,
    pub servo_type: String,
    pub usb_hub_port: String,
    pub sysfs_path: String,
    /// Contents of the sysfs `configuration` file, which servo firmware
    /// fills with its version string.
    pub fw_version: String,
    pub sysfs_product: String,
}

impl TopologyItem {
    /// Serial, type and hub port are all known.
    pub fn is_good(&self) -> bool {
        !self.serial.is_empty() && !self.servo_type.is_empty() && !self.usb_hub_port.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub root: Option<TopologyItem>,
    pub children: Vec<TopologyItem>,
}

impl Topology {
    /// Root first, then children, keeping only `board` when it is non-empty.
    pub fn devices(&self, board: &str) -> Vec<&TopologyItem> {
        self.root
            .iter()
            .chain(self.children.iter())
            .filter(|d| board.is_empty() || d.servo_type == board)
            .collect()
    }
}

/// Sysfs path of the servo with `serial`.
pub async fn root_servo_path(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    serial: &str,
) -> Result<String> {
    let out = runner
        .run(cancel, SERVODTOOL_TIMEOUT, "servodtool", &["device", "-s", serial, "usb-path"])
        .await
        .map_err(|e| e.context("root servo path: servo not detected"))?;
    let path = out.trim();
    // Anything shorter than "/sys/bus/usb/devices/X" cannot name a device.
    if path.len() <= USB_DEVICES_PATH.len() + 1 {
        return Err(RecoveryError::failed(format!(
            "root servo path: servo {serial} not detected, path {path:?}"
        )));
    }
    Ok(path.to_string())
}

pub async fn read_sysfs(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    device_path: &str,
    file: &str,
) -> Result<String> {
    let full = format!("{}/{file}", device_path.trim_end_matches('/'));
    let out = runner
        .run(cancel, SYSFS_READ_TIMEOUT, "cat", &[&full])
        .await
        .map_err(|e| e.context(format!("read {full}")))?;
    Ok(out.trim().to_string())
}

/// Read what sysfs knows about one device. Unreadable files leave their
/// field empty; only cancellation is an error.
pub async fn read_device(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    device_path: &str,
) -> Result<TopologyItem> {
    let read = |file: &'static str| async move {
        match read_sysfs(runner, cancel, device_path, file).await {
            Ok(v) => Ok(v),
            Err(RecoveryError::Cancelled) => Err(RecoveryError::Cancelled),
            Err(e) => {
                tracing::debug!(device_path, file, error = %e, "sysfs read failed");
                Ok(String::new())
            }
        }
    };
    let serial = read("serial").await?;
    let vid = read("idVendor").await?;
    let pid = read("idProduct").await?;
    let usb_hub_port = read("devpath").await?;
    let fw_version = read("configuration").await?;
    let sysfs_product = read("product").await?;
    let servo_type = servo_type_for_vid_pid(&format!("{vid}:{pid}"))
        .unwrap_or_default()
        .to_string();
    let item = TopologyItem {
        serial,
        servo_type,
        usb_hub_port,
        sysfs_path: device_path.to_string(),
        fw_version,
        sysfs_product,
    };
    tracing::debug!(?item, "servo device");
    Ok(item)
}

/// Hub path for a device path: the last `.N` of the port chain dropped.
pub fn servo_hub(root_path: &str) -> String {
    let (base, tail) = root_path.rsplit_once('/').unwrap_or(("", root_path));
    let hub_tail = tail.rsplit_once('.').map_or(tail, |(hub, _)| hub);
    if base.is_empty() {
        hub_tail.to_string()
    } else {
        format!("{base}/{hub_tail}")
    }
}

/// Every device with a serial under the hub the root servo sits on.
pub async fn list_devices(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    serial: &str,
) -> Result<Vec<TopologyItem>> {
    let root = root_servo_path(runner, cancel, serial).await?;
    let hub = servo_hub(&root);
    let out = runner
        .run(cancel, SERVODTOOL_TIMEOUT, &format!("find {hub}/* -name serial"), &[])
        .await
        .map_err(|e| e.context("list servo devices"))?;
    let mut devices = Vec::new();
    for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let dir = line.rsplit_once('/').map_or(line, |(dir, _)| dir);
        devices.push(read_device(runner, cancel, dir).await?);
    }
    Ok(devices)
}

/// Root is the device whose serial matches; every other complete device is
/// a child.
pub async fn retrieve_topology(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    serial: &str,
) -> Result<Topology> {
    let mut topology = Topology::default();
    for device in list_devices(runner, cancel, serial).await? {
        if !device.is_good() {
            tracing::info!(path = %device.sysfs_path, "servo device missing data, skipped");
            continue;
        }
        if device.serial == serial {
            topology.root = Some(device);
        } else {
            topology.children.push(device);
        }
    }
    Ok(topology)
}
