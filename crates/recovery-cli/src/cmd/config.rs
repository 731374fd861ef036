use crate::output::emit_json;
use anyhow::Context;
use clap::Subcommand;
use recovery_core::config::ConfigFile;
use recovery_core::defaults::default_configuration;
use recovery_core::exec::ExecRegistry;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Check a plan file: plans exist, references resolve, no cycles
    Validate {
        /// Path to the YAML plan file
        path: PathBuf,
    },

    /// Print the built-in plans as YAML
    Default,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate { path } => validate(path, json),
        ConfigSubcommand::Default => show_default(json),
    }
}

fn validate(path: PathBuf, json: bool) -> anyhow::Result<()> {
    let file = ConfigFile::load(&path)?;
    let config = file
        .validate(&ExecRegistry::with_defaults())
        .with_context(|| format!("{} is invalid", path.display()))?;

    if json {
        emit_json(&serde_json::json!({
            "valid": true,
            "plans": config.plan_names,
        }))?;
    } else {
        println!(
            "Config is valid: {} plan(s): {}",
            config.plan_names.len(),
            config.plan_names.join(", ")
        );
    }
    Ok(())
}

fn show_default(json: bool) -> anyhow::Result<()> {
    let config = default_configuration();
    if json {
        emit_json(&config)
    } else {
        print!("{}", config.to_yaml()?);
        Ok(())
    }
}
