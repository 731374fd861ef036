//! Built-in plans used when the caller supplies no configuration.

use crate::config::{ActionDef, ConfigFile, PlanDef};
use crate::plan::{PLAN_CLOSE, PLAN_CROS, PLAN_SERVO};
use std::collections::BTreeMap;

pub fn default_configuration() -> ConfigFile {
    let mut plans = BTreeMap::new();
    plans.insert(PLAN_SERVO.to_string(), servo_plan());
    plans.insert(PLAN_CROS.to_string(), cros_plan());
    plans.insert(PLAN_CLOSE.to_string(), close_plan());
    ConfigFile {
        plan_names: vec![
            PLAN_SERVO.to_string(),
            PLAN_CROS.to_string(),
            PLAN_CLOSE.to_string(),
        ],
        plans,
    }
}

fn servo_plan() -> PlanDef {
    PlanDef::new(
        &["servo_host_ssh", "servod_power_control", "servo_type_v4", "usbkey_detected"],
        vec![
            ActionDef::new("servo_host_ssh")
                .exec("cros_ssh")
                .doc("Servo host accepts ssh."),
            ActionDef::new("servod_power_control")
                .exec("servod_has_control")
                .args(&["control:power_state"])
                .deps(&["servo_host_ssh"]),
            ActionDef::new("servo_type_v4")
                .exec("is_servo_v4")
                .deps(&["servod_power_control"])
                .allow_fail(),
            ActionDef::new("usbkey_detected")
                .exec("servo_detect_usbkey")
                .deps(&["servod_power_control"])
                .allow_fail(),
        ],
    )
    .allow_fail()
}

fn cros_plan() -> PlanDef {
    PlanDef::new(
        &[
            "dut_ping",
            "dut_ssh",
            "internal_storage",
            "release_board",
            "ap_not_dev_signed",
        ],
        vec![
            ActionDef::new("dut_ping")
                .exec("cros_ping")
                .args(&["count:2", "wait_timeout:15"])
                .recoveries(&["cold_reset", "install_in_recovery_mode"]),
            ActionDef::new("dut_ssh")
                .exec("cros_ssh")
                .deps(&["dut_ping"])
                .recoveries(&["cold_reset", "install_in_recovery_mode"]),
            ActionDef::new("internal_storage")
                .exec("cros_is_booted_from_internal_storage")
                .deps(&["dut_ssh"])
                .recoveries(&["reboot", "install_in_recovery_mode"]),
            ActionDef::new("release_board")
                .exec("cros_release_board_matches")
                .deps(&["dut_ssh"])
                .allow_fail(),
            ActionDef::new("ap_not_dev_signed")
                .exec("servo_ap_not_dev_signed")
                .conditions(&["has_servo", "servo_type_v4"])
                .timeout_secs(30 * 60)
                .allow_fail(),
            ActionDef::new("has_servo").exec("dut_has_servo"),
            ActionDef::new("servo_type_v4")
                .exec("is_servo_v4")
                .conditions(&["has_servo"]),
            ActionDef::new("reboot")
                .exec("cros_reboot")
                .no_cache(),
            ActionDef::new("cold_reset")
                .exec("servo_cold_reset_dut")
                .args(&["wait_timeout:150"])
                .timeout_secs(200)
                .conditions(&["has_servo"])
                .no_cache(),
            ActionDef::new("install_in_recovery_mode")
                .exec("cros_install_in_recovery_mode")
                .timeout_secs(60 * 60)
                .conditions(&["has_servo", "usbkey_detected"])
                .no_cache()
                .doc("Boot from the servo USB key and reinstall the OS."),
            ActionDef::new("usbkey_detected")
                .exec("servo_detect_usbkey")
                .conditions(&["has_servo"]),
        ],
    )
}

fn close_plan() -> PlanDef {
    PlanDef::new(
        &["hide_usbkey", "power_on"],
        vec![
            ActionDef::new("has_servo").exec("dut_has_servo"),
            ActionDef::new("hide_usbkey")
                .exec("servo_set_usbkey_visibility")
                .args(&["visibility:off"])
                .conditions(&["has_servo"]),
            ActionDef::new("power_on")
                .exec("servo_set_power_state")
                .args(&["state:on"])
                .conditions(&["has_servo"]),
        ],
    )
    .allow_fail()
}
