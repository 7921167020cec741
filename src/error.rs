//! Custom error types for the emulator.
//!
//! This module defines the primary error type, `EmulatorError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur, from configuration problems at startup to malformed
//! requests arriving on a session.
//!
//! ## Error Hierarchy
//!
//! - **`Protocol`**: Malformed framing or encoding on a connection. Session-local; an
//!   unrecoverable framing fault closes that connection only.
//! - **`InvalidParameter`**: A command value outside its physically plausible range.
//!   Reported to the client, state unchanged.
//! - **`UnknownCommand`**: An operation name neither service recognizes.
//! - **`RenderFailure`**: The renderer could not produce a frame for the snapshot and
//!   acquisition parameters it was given.
//! - **`ResourceExhaustion`**: Bind/accept failures at startup. Fatal.
//! - **`Config`** / **`ConfigValidation`**: Loading or validating `Settings`. Fatal.
//! - **`ServiceFailed`**: A service task panicked or was cancelled. Reported as `internal`.
//!
//! Per-request errors never cross the service-loop boundary: they are turned into an
//! [`ErrorKind`] plus message and sent back to the client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the emulator error type.
pub type AppResult<T> = std::result::Result<T, EmulatorError>;

/// Every failure the emulator can report.
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// Bad framing, bad JSON, or a request of the wrong shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command value outside its valid range.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the offending parameter.
        parameter: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// No service recognizes this operation name.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The renderer rejected its inputs or produced an unusable frame.
    #[error("Render failure: {0}")]
    RenderFailure(String),

    /// A listener could not be bound.
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Loading the layered configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration loaded but is out of bounds.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// Socket or file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write exceeded its deadline; the payload names the step.
    #[error("Timed out while {0}")]
    Timeout(&'static str),

    /// A service task died instead of returning.
    #[error("{service} service failed: {reason}")]
    ServiceFailed {
        /// Which service loop failed.
        service: &'static str,
        /// Panic or cancellation message from the runtime.
        reason: String,
    },

    /// One or more services did not stop cleanly.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<EmulatorError>),

    /// An error response received by a client.
    #[error("Server replied {kind:?}: {message}")]
    Remote {
        /// Classification sent by the server.
        kind: ErrorKind,
        /// Server-side message.
        message: String,
    },
}

impl EmulatorError {
    /// Shorthand for building an [`EmulatorError::InvalidParameter`].
    pub fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter,
            reason: reason.into(),
        }
    }

    /// The wire-level classification reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::Timeout(_) => ErrorKind::ProtocolError,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::UnknownCommand(_) => ErrorKind::UnknownCommand,
            Self::RenderFailure(_) => ErrorKind::RenderFailure,
            Self::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            Self::Remote { kind, .. } => *kind,
            Self::Config(_)
            | Self::ConfigValidation(_)
            | Self::Io(_)
            | Self::ServiceFailed { .. }
            | Self::ShutdownFailed(_) => ErrorKind::Internal,
        }
    }
}

impl From<figment::Error> for EmulatorError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// Error classes as they appear in a response's `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request framing or encoding.
    ProtocolError,
    /// A parameter was outside its valid range.
    InvalidParameter,
    /// The operation name is not recognized.
    UnknownCommand,
    /// The renderer could not produce a frame.
    RenderFailure,
    /// A server-side resource could not be obtained.
    ResourceExhaustion,
    /// Anything else; the server stays up.
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmulatorError::invalid("magnification_index", "must be >= 0, got -1");
        assert_eq!(
            err.to_string(),
            "Invalid parameter 'magnification_index': must be >= 0, got -1"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            EmulatorError::UnknownCommand("FOO".into()).kind(),
            ErrorKind::UnknownCommand
        );
        assert_eq!(
            EmulatorError::Timeout("reading frame body").kind(),
            ErrorKind::ProtocolError
        );
        assert_eq!(
            EmulatorError::RenderFailure("binning".into()).kind(),
            ErrorKind::RenderFailure
        );
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::InvalidParameter).unwrap();
        assert_eq!(json, "\"invalid_parameter\"");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = EmulatorError::ShutdownFailed(vec![
            EmulatorError::Protocol("tem loop panicked".into()),
            EmulatorError::Timeout("draining camera sessions"),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
