use super::{get_float, get_string};
use crate::dut::Dut;
use crate::error::{RecoveryError, Result};
use crate::tlw::{Runner, Servod, ServodValue};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PD_ROLE_CONTROL: &str = "servo_pd_role";

/// Minimal charger-port voltage at which the servo can supply the DUT.
const MIN_CHARGER_MV: f64 = 4400.0;

// ---------------------------------------------------------------------------
// PowerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Reset,
    Rec,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Reset => "reset",
            PowerState::Rec => "rec",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerState {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            "reset" => Ok(PowerState::Reset),
            "rec" => Ok(PowerState::Rec),
            other => Err(RecoveryError::usage(format!("unknown power state: {other}"))),
        }
    }
}

pub async fn set_power_state(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    state: PowerState,
) -> Result<()> {
    tracing::debug!(state = %state, "set power_state");
    servod
        .set(cancel, "power_state", state.as_str().into())
        .await
        .map_err(|e| e.context(format!("set power state {state}")))
}

// ---------------------------------------------------------------------------
// UsbVisibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbVisibility {
    Off,
    Dut,
    Host,
}

impl std::str::FromStr for UsbVisibility {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(UsbVisibility::Off),
            "dut" => Ok(UsbVisibility::Dut),
            "host" => Ok(UsbVisibility::Host),
            other => Err(RecoveryError::usage(format!("unknown usb visibility: {other}"))),
        }
    }
}

pub async fn update_usb_visibility(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    visibility: UsbVisibility,
) -> Result<()> {
    let (control, value) = match visibility {
        UsbVisibility::Off => ("image_usbkey_pwr", "off"),
        UsbVisibility::Dut => ("image_usbkey_direction", "dut_sees_usbkey"),
        UsbVisibility::Host => ("image_usbkey_direction", "servo_sees_usbkey"),
    };
    servod
        .set(cancel, control, value.into())
        .await
        .map_err(|e| e.context(format!("update usb visibility to {value}")))
}

// ---------------------------------------------------------------------------
// PD role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdRole {
    /// Servo supplies power to the DUT.
    Src,
    /// Servo sinks; the DUT runs on its own battery.
    Snk,
}

impl PdRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PdRole::Src => "src",
            PdRole::Snk => "snk",
        }
    }
}

impl fmt::Display for PdRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub async fn set_pd_role(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    role: PdRole,
    required: bool,
) -> Result<()> {
    if servod.has(cancel, PD_ROLE_CONTROL).await.is_err() {
        if required {
            return Err(RecoveryError::ServodControlMissing(PD_ROLE_CONTROL.into()));
        }
        tracing::debug!("servo has no {PD_ROLE_CONTROL}, skipping");
        return Ok(());
    }
    let current = get_string(servod, cancel, PD_ROLE_CONTROL).await?;
    if current == role.as_str() {
        tracing::debug!(role = %role, "pd role already set");
        return Ok(());
    }
    servod
        .set(cancel, PD_ROLE_CONTROL, ServodValue::from(role.as_str()))
        .await
}

/// Servo can switch DUT power over its type-c connection with enough voltage
/// on the charger port. Read failures count as unsupported.
pub async fn servo_supports_built_in_pd_control(
    servod: &dyn Servod,
    cancel: &CancellationToken,
) -> bool {
    match get_string(servod, cancel, "root.dut_connection_type").await {
        Ok(kind) if kind == "type-c" => {}
        Ok(kind) => {
            tracing::debug!(connection = %kind, "no built-in pd control");
            return false;
        }
        Err(e) => {
            tracing::debug!(error = %e, "cannot read dut connection type");
            return false;
        }
    }
    match get_float(servod, cancel, "ppchg5_mv").await {
        Ok(mv) => mv >= MIN_CHARGER_MV,
        Err(e) => {
            tracing::debug!(error = %e, "cannot read charger voltage");
            false
        }
    }
}

/// Battery section of `power_supply_info` reports the battery as present.
pub(crate) fn battery_present_in_power_info(output: &str) -> bool {
    let mut in_battery = false;
    for line in output.lines() {
        let line = line.trim();
        if let Some(device) = line.strip_prefix("Device:") {
            in_battery = device.trim() == "Battery";
            continue;
        }
        if in_battery {
            if let Some(present) = line.strip_prefix("present:") {
                return present.trim() == "yes";
            }
        }
    }
    false
}

/// Whether PD must be switched to sink while booting the DUT in recovery mode.
///
/// When the DUT cannot report power info the inventory's battery record wins.
pub async fn recovery_mode_requires_pd_off(
    dut: &Dut,
    dut_runner: &dyn Runner,
    servod: &dyn Servod,
    cancel: &CancellationToken,
) -> bool {
    if !dut.has_battery() {
        return false;
    }
    match dut_runner
        .run(cancel, Duration::from_secs(30), "power_supply_info", &[])
        .await
    {
        Ok(out) if !battery_present_in_power_info(&out) => {
            tracing::debug!(dut = %dut.name, "battery not reported by power info");
            return false;
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "cannot read power info, assume battery present"),
    }
    servo_supports_built_in_pd_control(servod, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::Battery;
    use crate::testing::{FakeRunner, FakeServod, Reply};

    const POWER_INFO: &str = "Device: Line Power\n  online: yes\nDevice: Battery\n  vendor: SMP\n  present: yes\n  state: Charging\n";

    #[tokio::test]
    async fn usb_visibility_maps_to_controls() {
        let servod = FakeServod::new();
        let cancel = CancellationToken::new();
        update_usb_visibility(servod.as_ref(), &cancel, UsbVisibility::Off)
            .await
            .unwrap();
        update_usb_visibility(servod.as_ref(), &cancel, UsbVisibility::Dut)
            .await
            .unwrap();
        update_usb_visibility(servod.as_ref(), &cancel, UsbVisibility::Host)
            .await
            .unwrap();
        assert_eq!(
            servod.sets(),
            vec![
                ("image_usbkey_pwr".to_string(), ServodValue::from("off")),
                (
                    "image_usbkey_direction".to_string(),
                    ServodValue::from("dut_sees_usbkey")
                ),
                (
                    "image_usbkey_direction".to_string(),
                    ServodValue::from("servo_sees_usbkey")
                ),
            ]
        );
    }

    #[tokio::test]
    async fn pd_role_missing_control_only_fails_when_required() {
        let servod = FakeServod::new();
        let cancel = CancellationToken::new();
        assert!(set_pd_role(servod.as_ref(), &cancel, PdRole::Snk, false)
            .await
            .is_ok());
        let err = set_pd_role(servod.as_ref(), &cancel, PdRole::Snk, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::ServodControlMissing(_)));
    }

    #[tokio::test]
    async fn pd_role_same_value_is_noop() {
        let servod = FakeServod::new().with(PD_ROLE_CONTROL, "src");
        let cancel = CancellationToken::new();
        set_pd_role(servod.as_ref(), &cancel, PdRole::Src, true)
            .await
            .unwrap();
        assert!(servod.sets().is_empty());
        set_pd_role(servod.as_ref(), &cancel, PdRole::Snk, true)
            .await
            .unwrap();
        assert_eq!(servod.value(PD_ROLE_CONTROL), Some("snk".into()));
    }

    #[tokio::test]
    async fn built_in_pd_needs_type_c_and_voltage() {
        let cancel = CancellationToken::new();
        let ok = FakeServod::new()
            .with("root.dut_connection_type", "type-c")
            .with("ppchg5_mv", 5000i64);
        assert!(servo_supports_built_in_pd_control(ok.as_ref(), &cancel).await);
        let low = FakeServod::new()
            .with("root.dut_connection_type", "type-c")
            .with("ppchg5_mv", 4000i64);
        assert!(!servo_supports_built_in_pd_control(low.as_ref(), &cancel).await);
        let type_a = FakeServod::new()
            .with("root.dut_connection_type", "type-a")
            .with("ppchg5_mv", 5000i64);
        assert!(!servo_supports_built_in_pd_control(type_a.as_ref(), &cancel).await);
    }

    #[test]
    fn power_info_battery_detection() {
        assert!(battery_present_in_power_info(POWER_INFO));
        assert!(!battery_present_in_power_info(
            "Device: Line Power\n  present: yes\n"
        ));
    }

    #[tokio::test]
    async fn pd_off_requires_battery_in_inventory() {
        let cancel = CancellationToken::new();
        let servod = FakeServod::new()
            .with("root.dut_connection_type", "type-c")
            .with("ppchg5_mv", 5000i64);
        let runner = FakeRunner::new();
        runner.on("power_supply_info", Reply::ok(POWER_INFO));
        let mut dut = Dut::new("dut");
        assert!(!recovery_mode_requires_pd_off(&dut, runner.as_ref(), servod.as_ref(), &cancel).await);
        dut.battery = Some(Battery::default());
        assert!(recovery_mode_requires_pd_off(&dut, runner.as_ref(), servod.as_ref(), &cancel).await);
    }

    #[test]
    fn power_state_parses_known_values() {
        assert_eq!("rec".parse::<PowerState>().unwrap(), PowerState::Rec);
        assert!("sleep".parse::<PowerState>().is_err());
    }
}
