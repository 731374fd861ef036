use serde::{Deserialize, Serialize};
use std::fmt;

/// Servo topology as reported by the `servo_type` control, e.g.
/// `servo_v4_with_servo_micro_and_ccd_cr50`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServoType(String);

impl ServoType {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_v3(&self) -> bool {
        self.0.contains("servo_v3")
    }

    /// True for both `servo_v4` and `servo_v4p1`.
    pub fn is_v4(&self) -> bool {
        self.0.contains("servo_v4")
    }

    pub fn is_micro(&self) -> bool {
        self.0.contains("servo_micro")
    }

    pub fn is_c2d2(&self) -> bool {
        self.0.contains("c2d2")
    }

    pub fn is_ccd(&self) -> bool {
        self.0.contains("ccd_")
    }

    /// A v4 wrapper carrying both a debug header adapter and a CCD path.
    pub fn is_dual_setup(&self) -> bool {
        self.is_v4() && (self.is_micro() || self.is_c2d2()) && self.is_ccd()
    }

    pub fn is_multiple_servos(&self) -> bool {
        self.0.contains("_and_")
    }

    /// Control holding the serial number of the child adapter.
    pub fn serial_name_option(&self) -> &'static str {
        if self.is_v4() && self.is_micro() {
            "servo_micro_serialname"
        } else if self.is_v4() && self.is_ccd() {
            "ccd_serialname"
        } else {
            "serialname"
        }
    }
}

impl fmt::Display for ServoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
