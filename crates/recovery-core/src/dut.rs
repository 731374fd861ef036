use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// SetupType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupType {
    #[default]
    Cros,
    Labstation,
    Android,
}

impl SetupType {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupType::Cros => "cros",
            SetupType::Labstation => "labstation",
            SetupType::Android => "android",
        }
    }
}

impl fmt::Display for SetupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Device parts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareState {
    #[default]
    Unspecified,
    Normal,
    NeedReplacement,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Battery {
    #[serde(default)]
    pub state: HardwareState,
}

/// Release channel `servo_updater` pulls servo firmware from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareChannel {
    #[default]
    Stable,
    Prev,
    Dev,
    Alpha,
}

impl FirmwareChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            FirmwareChannel::Stable => "stable",
            FirmwareChannel::Prev => "prev",
            FirmwareChannel::Dev => "dev",
            FirmwareChannel::Alpha => "alpha",
        }
    }
}

impl fmt::Display for FirmwareChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Servo {
    #[serde(default)]
    pub serial_number: String,
    /// Servo type string as recorded in inventory, e.g. `servo_v4_with_ccd_cr50`.
    #[serde(default)]
    pub servo_type: String,
    #[serde(default)]
    pub firmware_channel: FirmwareChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoHost {
    pub name: String,
    #[serde(default = "default_servod_port")]
    pub servod_port: u16,
    #[serde(default)]
    pub servo: Servo,
}

fn default_servod_port() -> u16 {
    9999
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmOutlet {
    pub hostname: String,
    pub outlet: String,
}

/// An auxiliary host attached to the device (chameleon, bluetooth peer, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peripheral {
    pub name: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StableVersion {
    #[serde(default)]
    pub os_image: String,
    #[serde(default)]
    pub fw_version: String,
    /// Location of the firmware image tarball, fetched with `curl`.
    #[serde(default)]
    pub fw_image: String,
}

// ---------------------------------------------------------------------------
// Dut
// ---------------------------------------------------------------------------

/// Device descriptor handed to the engine by the inventory reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dut {
    pub name: String,
    #[serde(default)]
    pub asset_tag: String,
    #[serde(default)]
    pub board: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub setup_type: SetupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Battery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servo_host: Option<ServoHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_outlet: Option<RpmOutlet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peripheral: Option<Peripheral>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_version: Option<StableVersion>,
}

impl Dut {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            asset_tag: String::new(),
            board: String::new(),
            model: String::new(),
            setup_type: SetupType::default(),
            battery: None,
            servo_host: None,
            rpm_outlet: None,
            peripheral: None,
            stable_version: None,
        }
    }

    pub fn has_battery(&self) -> bool {
        self.battery.is_some()
    }

    pub fn servo_host_name(&self) -> Option<&str> {
        self.servo_host.as_ref().map(|s| s.name.as_str())
    }
}
