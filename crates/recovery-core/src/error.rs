use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The remote command ran and reported a non-zero exit code. `stdout`
    /// keeps whatever the command printed before failing.
    #[error("command '{command}' exited with code {exit_code}: {stderr}")]
    RemoteExec {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The remote connection dropped before an exit status was delivered.
    /// Reboot-class commands treat this as success.
    #[error("command '{command}' finished without exit status")]
    NoExitStatus { command: String },

    #[error("servod control not supported: {0}")]
    ServodControlMissing(String),

    #[error("servod error: {0}")]
    Servod(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid usage: {0}")]
    Usage(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("exec not found: {0}")]
    ExecNotFound(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RecoveryError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn is_no_exit_status(&self) -> bool {
        matches!(self, Self::NoExitStatus { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Copy of the error for replay from the run cache. Wrapped foreign
    /// errors keep only their message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::RemoteExec {
                command,
                exit_code,
                stdout,
                stderr,
            } => Self::RemoteExec {
                command: command.clone(),
                exit_code: *exit_code,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            },
            Self::NoExitStatus { command } => Self::NoExitStatus {
                command: command.clone(),
            },
            Self::ServodControlMissing(c) => Self::ServodControlMissing(c.clone()),
            Self::Servod(m) => Self::Servod(m.clone()),
            Self::Timeout(m) => Self::Timeout(m.clone()),
            Self::Usage(m) => Self::Usage(m.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Config(m) => Self::Config(m.clone()),
            Self::ExecNotFound(m) => Self::ExecNotFound(m.clone()),
            Self::Metrics(m) => Self::Metrics(m.clone()),
            Self::Failed(m) => Self::Failed(m.clone()),
            Self::Io(_) | Self::Yaml(_) | Self::Json(_) => Self::Failed(self.to_string()),
        }
    }

    /// Prefix the message with `context`, keeping the variant when the
    /// variant carries meaning callers branch on.
    pub fn context(self, context: impl AsRef<str>) -> Self {
        match self {
            Self::NoExitStatus { .. }
            | Self::Cancelled
            | Self::ServodControlMissing(_)
            | Self::RemoteExec { .. } => self,
            Self::Timeout(msg) => Self::Timeout(format!("{}: {msg}", context.as_ref())),
            Self::Usage(msg) => Self::Usage(format!("{}: {msg}", context.as_ref())),
            other => Self::Failed(format!("{}: {other}", context.as_ref())),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
