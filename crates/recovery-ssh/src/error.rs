use recovery_core::RecoveryError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary not found on PATH: {0}")]
    BinaryNotFound(String),

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<SshError> for RecoveryError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::Io(e) => RecoveryError::Io(e),
            SshError::Yaml(e) => RecoveryError::Yaml(e),
            SshError::Cancelled => RecoveryError::Cancelled,
            SshError::Timeout { .. } => RecoveryError::Timeout(e.to_string()),
            other => RecoveryError::failed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SshError>;
