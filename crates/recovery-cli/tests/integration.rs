#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

const INVENTORY: &str = "duts:\n  - name: dut-1\n    board: octopus\n";

const PASSING_PLAN: &str = r#"
plan_names: [cros]
plans:
  cros:
    verifiers: [check]
    actions:
      - name: check
        exec_name: sample_pass
"#;

const FAILING_PLAN: &str = r#"
plan_names: [cros]
plans:
  cros:
    verifiers: [check]
    actions:
      - name: check
        exec_name: sample_fail
"#;

fn recover() -> Command {
    Command::cargo_bin("recover").unwrap()
}

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Put no-op `ssh` and `ping` first on PATH so the run never leaves the box.
fn stub_path(dir: &TempDir) -> String {
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).unwrap();
    for name in ["ssh", "ping"] {
        let path = bin.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let inherited = std::env::var("PATH").unwrap_or_default();
    format!("{}:{inherited}", bin.display())
}

// ---------------------------------------------------------------------------
// recover execs
// ---------------------------------------------------------------------------

#[test]
fn execs_lists_builtin_execs() {
    recover()
        .arg("execs")
        .assert()
        .success()
        .stdout(predicate::str::contains("cros_ping"))
        .stdout(predicate::str::contains("servo_set_gbb_flags"));
}

#[test]
fn execs_json_is_an_array() {
    let out = recover().args(["execs", "--json"]).output().unwrap();
    assert!(out.status.success());
    let value: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert!(value.as_array().is_some_and(|a| !a.is_empty()));
}

// ---------------------------------------------------------------------------
// recover config
// ---------------------------------------------------------------------------

#[test]
fn default_config_validates() {
    let dir = TempDir::new().unwrap();
    let out = recover().args(["config", "default"]).output().unwrap();
    assert!(out.status.success());
    let path = dir.path().join("plans.yaml");
    std::fs::write(&path, &out.stdout).unwrap();

    recover()
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"))
        .stdout(predicate::str::contains("cros"));
}

#[test]
fn config_with_cycle_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "plans.yaml",
        r#"
plan_names: [cros]
plans:
  cros:
    verifiers: [a]
    actions:
      - name: a
        exec_name: sample_pass
        dependencies: [b]
      - name: b
        exec_name: sample_pass
        dependencies: [a]
"#,
    );

    recover()
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn config_with_unknown_exec_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "plans.yaml",
        "plan_names: [cros]\nplans:\n  cros:\n    verifiers: [a]\n    actions:\n      - name: a\n        exec_name: no_such_exec\n",
    );

    recover()
        .args(["config", "validate"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no_such_exec"));
}

// ---------------------------------------------------------------------------
// recover run
// ---------------------------------------------------------------------------

#[test]
fn run_without_inventory_fails() {
    let dir = TempDir::new().unwrap();
    recover()
        .args(["run", "--unit", "dut-1", "--inventory"])
        .arg(dir.path().join("missing.yaml"))
        .env_remove("RECOVERY_INVENTORY")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load inventory"));
}

#[test]
fn run_passing_plan_reports_records() {
    let dir = TempDir::new().unwrap();
    let inventory = write(&dir, "inventory.yaml", INVENTORY);
    let plans = write(&dir, "plans.yaml", PASSING_PLAN);

    recover()
        .env("PATH", stub_path(&dir))
        .args(["run", "--unit", "dut-1", "--inventory"])
        .arg(&inventory)
        .arg("--config")
        .arg(&plans)
        .assert()
        .success()
        .stdout(predicate::str::contains("plan:cros"))
        .stdout(predicate::str::contains("run_task:recovery"))
        .stdout(predicate::str::contains("fail").not());
}

#[test]
fn run_failing_plan_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    let inventory = write(&dir, "inventory.yaml", INVENTORY);
    let plans = write(&dir, "plans.yaml", FAILING_PLAN);

    recover()
        .env("PATH", stub_path(&dir))
        .args(["run", "--unit", "dut-1", "--inventory"])
        .arg(&inventory)
        .arg("--config")
        .arg(&plans)
        .assert()
        .failure()
        .stderr(predicate::str::contains("recovery failed"));
}

#[test]
fn run_json_emits_metrics_records() {
    let dir = TempDir::new().unwrap();
    let inventory = write(&dir, "inventory.yaml", INVENTORY);
    let plans = write(&dir, "plans.yaml", PASSING_PLAN);

    let out = recover()
        .env("PATH", stub_path(&dir))
        .args(["run", "--json", "--unit", "dut-1", "--task-id", "task-42", "--inventory"])
        .arg(&inventory)
        .arg("--config")
        .arg(&plans)
        .output()
        .unwrap();
    assert!(out.status.success());

    let records: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let records = records.as_array().unwrap();
    assert!(records
        .iter()
        .all(|r| r["swarming_task_id"] == "task-42"));
    assert!(records.iter().any(|r| r["kind"] == "run_library"));
}

#[test]
fn run_unknown_unit_fails() {
    let dir = TempDir::new().unwrap();
    let inventory = write(&dir, "inventory.yaml", INVENTORY);

    recover()
        .env("PATH", stub_path(&dir))
        .args(["run", "--unit", "dut-9", "--inventory"])
        .arg(&inventory)
        .assert()
        .failure()
        .stderr(predicate::str::contains("dut-9"));
}
