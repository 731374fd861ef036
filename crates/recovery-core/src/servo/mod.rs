//! Servod helpers: typed readers over [`Servod::get`], the servo-type
//! classifier, EC console commands and the power, USB and PD controls.
//! USB topology discovery and firmware updates run on the servo host.

pub mod power;
pub mod servo_type;
pub mod topology;
pub mod updater;

pub use power::{
    recovery_mode_requires_pd_off, servo_supports_built_in_pd_control, set_pd_role,
    set_power_state, update_usb_visibility, PdRole, PowerState, UsbVisibility,
};
pub use servo_type::ServoType;
pub use topology::{retrieve_topology, Topology, TopologyItem};
pub use updater::{needs_update, update_devices_fw, FwUpdateRequest};

use crate::error::{RecoveryError, Result};
use crate::tlw::{Servod, ServodValue};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn mismatch(control: &str, want: &str, got: &ServodValue) -> RecoveryError {
    RecoveryError::Servod(format!(
        "control {control}: expected {want} value, got {}",
        got.type_name()
    ))
}

pub async fn get_string(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    control: &str,
) -> Result<String> {
    match servod.get(cancel, control).await? {
        ServodValue::String(s) => Ok(s),
        other => Err(mismatch(control, "string", &other)),
    }
}

pub async fn get_int(servod: &dyn Servod, cancel: &CancellationToken, control: &str) -> Result<i64> {
    match servod.get(cancel, control).await? {
        ServodValue::Int(v) => Ok(v),
        other => Err(mismatch(control, "int", &other)),
    }
}

pub async fn get_float(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    control: &str,
) -> Result<f64> {
    match servod.get(cancel, control).await? {
        ServodValue::Float(v) => Ok(v),
        ServodValue::Int(v) => Ok(v as f64),
        other => Err(mismatch(control, "float", &other)),
    }
}

pub async fn get_bool(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    control: &str,
) -> Result<bool> {
    match servod.get(cancel, control).await? {
        ServodValue::Bool(v) => Ok(v),
        other => Err(mismatch(control, "bool", &other)),
    }
}

/// Read `servo_type` and wrap it in the classifier.
pub async fn get_servo_type(servod: &dyn Servod, cancel: &CancellationToken) -> Result<ServoType> {
    let raw = get_string(servod, cancel, "servo_type").await?;
    Ok(ServoType::new(raw))
}

/// Send a command to the EC console. `ec_uart_flush` is turned off around
/// the command so its output is not discarded, and turned back on after
/// `wait`.
pub async fn set_ec_uart_cmd(
    servod: &dyn Servod,
    cancel: &CancellationToken,
    value: &str,
    wait: Duration,
) -> Result<()> {
    servod.set(cancel, "ec_uart_flush", "off".into()).await?;
    servod.set(cancel, "ec_uart_cmd", value.into()).await?;
    tokio::time::sleep(wait).await;
    servod.set(cancel, "ec_uart_flush", "on".into()).await
}
