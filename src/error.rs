use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RotationError>;

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("No service account credential JSON file found in {0:?}")]
    NoCredentialsFound(PathBuf),

    #[error("Another instance already holds the lock {path:?}: {reason}")]
    LockHeld { path: PathBuf, reason: String },

    #[error("core/stats poll failed: {0}")]
    Poll(String),

    #[error("core/stats failed {failures} times in a row, killed process {pid}")]
    SessionFatal { failures: u32, pid: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read credential {path:?}: {reason}")]
    Credential { path: PathBuf, reason: String },

    #[error("Instance state error at {path:?}: {reason}")]
    State { path: PathBuf, reason: String },

    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RotationError {
    /// Errors that end the controller before any session started.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            RotationError::NoCredentialsFound(_)
                | RotationError::LockHeld { .. }
                | RotationError::InvalidConfig(_)
        )
    }
}
