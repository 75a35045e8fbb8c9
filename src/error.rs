//! Error handling module for archstrap
//!
//! Provides centralized error handling with proper error types using thiserror.
//! The three fatal kinds of an installation run (preflight, destructive,
//! configuration) are distinct variants so the binary can map them to exit codes.

use thiserror::Error;

/// Main error type for archstrap
#[derive(Error, Debug)]
pub enum InstallError {
    /// A precondition of the live environment is unmet. Nothing was touched.
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// Failure during or after partitioning/formatting. The target disk may be
    /// left in an intermediate state; re-run and accept a full wipe.
    #[error("Disk provisioning failed: {0}")]
    Destructive(String),

    /// Failure while configuring the installed root. The system is partitioned
    /// and base-installed but not fully configured.
    #[error("System configuration failed: {0}")]
    Configuration(String),

    /// Invalid configuration input (file, flags, environment)
    #[error("Configuration error: {0}")]
    Config(String),

    /// User declined at the confirmation checkpoint
    #[error("Installation aborted by user")]
    Aborted,

    /// A prompt could not be answered (sealed prompter or missing unattended value)
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Install state machine transition errors
    #[error("Phase transition error: {0}")]
    Transition(String),

    /// External tool exited unsuccessfully
    #[error("{program} failed (exit code {code}): {stderr}")]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    /// IO errors (file operations, terminal, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for archstrap operations
pub type Result<T> = std::result::Result<T, InstallError>;

// Convenient error constructors
impl InstallError {
    /// Create a preflight error
    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    /// Create a destructive-phase error
    pub fn destructive(msg: impl Into<String>) -> Self {
        Self::Destructive(msg.into())
    }

    /// Create a chroot-configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a configuration input error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a prompt error
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Preflight(_) => 2,
            Self::Config(_) => 3,
            Self::Aborted => 4,
            Self::Destructive(_) => 5,
            Self::Configuration(_) => 6,
            _ => 1,
        }
    }

    /// Re-classify a lower-level failure as a destructive-phase failure.
    ///
    /// Errors that already carry one of the three fatal kinds keep it.
    pub fn into_destructive(self) -> Self {
        match self {
            Self::Preflight(_) | Self::Destructive(_) | Self::Configuration(_) => self,
            other => Self::Destructive(other.to_string()),
        }
    }

    /// Re-classify a lower-level failure as a chroot-configuration failure.
    pub fn into_configuration(self) -> Self {
        match self {
            Self::Preflight(_) | Self::Destructive(_) | Self::Configuration(_) => self,
            other => Self::Configuration(other.to_string()),
        }
    }
}
