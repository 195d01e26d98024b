//! Error types for Foundry.

use crate::run::NodeStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Load-time errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Dispatch errors
    #[error("Environment unavailable for {selector}: {message}")]
    EnvironmentUnavailable { selector: String, message: String },

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {minutes} minutes")]
    StepTimeout { minutes: u32 },

    #[error("Job timeout after {minutes} minutes")]
    JobTimeout { minutes: u32 },

    // Run errors
    #[error("Run canceled: {reason}")]
    Canceled { reason: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Load-time errors that prevent a run from starting.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<crate::expr::ExprError> for Error {
    fn from(err: crate::expr::ExprError) -> Self {
        Error::Configuration(err.to_string())
    }
}
