use miette::Diagnostic;
use thiserror::Error;

/// Error type for manager (mgr) administrative commands
#[derive(Error, Debug, Diagnostic)]
pub enum AdminError {
    /// Command execution failed
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(snapbridge::admin::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// Command succeeded but returned a status string where none was expected
    #[error("Command '{prefix}' returned unexpected status: {status}")]
    #[diagnostic(
        code(snapbridge::admin::unexpected_status),
        help("The manager module answered with a message instead of data. Check that the rbd_support mgr module is enabled: ceph mgr module ls")
    )]
    UnexpectedStatus {
        #[allow(unused)]
        prefix: String,
        #[allow(unused)]
        status: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(snapbridge::admin::serialization_error),
        help("The command response did not match the expected JSON layout")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(snapbridge::admin::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },
}

/// Result type alias for admin operations
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn unexpected_status(prefix: impl Into<String>, status: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            prefix: prefix.into(),
            status: status.into(),
        }
    }

    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}

impl From<serde_json::Error> for AdminError {
    fn from(err: serde_json::Error) -> Self {
        AdminError::serialization_error(format!("JSON error: {}", err), Some(Box::new(err)))
    }
}
