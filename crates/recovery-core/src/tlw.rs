//! Capabilities the runtime hands to the engine: remote command execution,
//! reachability checks, servod control access and the inventory reader.
//!
//! Every call takes the caller's [`CancellationToken`]; implementations must
//! return [`RecoveryError::Cancelled`] promptly once it fires.

use crate::dut::Dut;
use crate::error::{RecoveryError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes a command on one named resource.
///
/// Returns trimmed stdout on exit code 0, [`RecoveryError::RemoteExec`] on a
/// non-zero code and [`RecoveryError::NoExitStatus`] when the connection
/// dropped before a status arrived.
///
/// `cmd` and `args` are joined with spaces and handed to the remote shell, so
/// pipes and redirections in them are honoured.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<String>;
}

/// Join a command and its arguments the way a remote shell receives them.
pub fn command_line(cmd: &str, args: &[&str]) -> String {
    let mut line = cmd.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

// ---------------------------------------------------------------------------
// Pinger
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Send `count` echo requests; success if any is answered.
    async fn ping(&self, cancel: &CancellationToken, count: u32) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ServodValue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ServodValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ServodValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServodValue::String(_) => "string",
            ServodValue::Int(_) => "int",
            ServodValue::Float(_) => "float",
            ServodValue::Bool(_) => "bool",
        }
    }

    /// Parse the textual form servod prints for a control.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            return ServodValue::Int(v);
        }
        if let Ok(v) = raw.parse::<f64>() {
            return ServodValue::Float(v);
        }
        match raw {
            "True" | "true" => ServodValue::Bool(true),
            "False" | "false" => ServodValue::Bool(false),
            _ => ServodValue::String(raw.to_string()),
        }
    }
}

impl fmt::Display for ServodValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServodValue::String(s) => f.write_str(s),
            ServodValue::Int(v) => write!(f, "{v}"),
            ServodValue::Float(v) => write!(f, "{v}"),
            ServodValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for ServodValue {
    fn from(s: &str) -> Self {
        ServodValue::String(s.to_string())
    }
}

impl From<String> for ServodValue {
    fn from(s: String) -> Self {
        ServodValue::String(s)
    }
}

impl From<i64> for ServodValue {
    fn from(v: i64) -> Self {
        ServodValue::Int(v)
    }
}

impl From<bool> for ServodValue {
    fn from(v: bool) -> Self {
        ServodValue::Bool(v)
    }
}

// ---------------------------------------------------------------------------
// Servod
// ---------------------------------------------------------------------------

/// Access to the servod daemon attached to a device.
#[async_trait]
pub trait Servod: Send + Sync {
    async fn get(&self, cancel: &CancellationToken, control: &str) -> Result<ServodValue>;

    async fn set(&self, cancel: &CancellationToken, control: &str, value: ServodValue)
        -> Result<()>;

    /// Succeeds when the control is known to the running servod.
    async fn has(&self, cancel: &CancellationToken, control: &str) -> Result<()>;

    fn port(&self) -> u16;
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

/// Per-resource capabilities plus the inventory reader.
#[async_trait]
pub trait Access: Send + Sync {
    fn runner(&self, resource: &str) -> Arc<dyn Runner>;

    fn pinger(&self, resource: &str) -> Arc<dyn Pinger>;

    /// Servod for the device named `resource`.
    fn servod(&self, resource: &str) -> Result<Arc<dyn Servod>>;

    async fn list_resources(&self, unit: &str) -> Result<Vec<String>>;

    async fn get_dut(&self, resource: &str) -> Result<Dut>;
}

/// Fail fast when the token already fired.
pub fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RecoveryError::Cancelled)
    } else {
        Ok(())
    }
}
