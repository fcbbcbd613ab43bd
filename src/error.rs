//! Custom error types for the archiver.
//!
//! This module defines the primary error type, `ArchiverError`, used across the crate.
//! Using the `thiserror` crate, it provides one consistent way to report the failures
//! that can occur between the transport, the protocol state machine and the disk.
//!
//! ## Error Hierarchy
//!
//! - **`TransportData`**: A raw chunk failed structural validation. Recovered locally
//!   according to the configured malformed-data policy.
//! - **`WriteFailure`**: Persisting a batch failed (directory, permissions, I/O, timeout).
//!   Surfaces as the `WriteError` protocol state and is retried; it never crashes the driver.
//! - **`Configuration`** / **`ConfigLoad`**: Invalid startup parameters. Fatal at construction.
//! - **`InvalidCommand`**: A command was issued in a state that does not accept it. The
//!   state is left unchanged.
//!
//! The remaining variants cover data rejection, the buffer cap and a stopped driver.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::state::ProtocolState;

/// Convenience alias for results using the crate error type.
pub type ArchiverResult<T> = std::result::Result<T, ArchiverError>;

/// Errors raised by the archiver.
#[derive(Error, Debug)]
pub enum ArchiverError {
    /// A raw chunk failed structural validation.
    #[error("Malformed sample: {0}")]
    TransportData(String),

    /// Persisting a batch failed.
    #[error(transparent)]
    WriteFailure(#[from] WriteFailure),

    /// A configuration value is out of range or inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// The command is not accepted in the current state.
    #[error("Command '{command}' is not accepted in state {state}")]
    InvalidCommand {
        /// Wire name of the rejected command
        command: String,
        /// State the driver was in
        state: ProtocolState,
    },

    /// Raw data arrived while the driver was not buffering.
    #[error("Raw data rejected in state {state}")]
    DataRejected {
        /// State the driver was in
        state: ProtocolState,
    },

    /// The buffer cap was reached.
    #[error("Sample buffer full ({limit_bytes} bytes); sample rejected")]
    BufferFull {
        /// Configured cap
        limit_bytes: usize,
    },

    /// A `set` value failed validation.
    #[error("Invalid value for parameter {parameter}: {reason}")]
    InvalidParameter {
        /// Wire name of the parameter
        parameter: String,
        /// Why the value was refused
        reason: String,
    },

    /// The driver task has exited.
    #[error("Protocol driver is not running")]
    DriverStopped,

    /// `wait_for_state` gave up.
    #[error("Timed out after {timeout:?} waiting for state {expected} (currently {actual})")]
    StateTimeout {
        /// State that was awaited
        expected: ProtocolState,
        /// State when the wait ended
        actual: ProtocolState,
        /// How long the caller waited
        timeout: std::time::Duration,
    },
}

impl ArchiverError {
    /// Shorthand for rejecting `command` in `state`.
    pub fn invalid_command(command: impl fmt::Display, state: ProtocolState) -> Self {
        ArchiverError::InvalidCommand {
            command: command.to_string(),
            state,
        }
    }

    /// Whether the driver keeps running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ArchiverError::Configuration(_)
                | ArchiverError::ConfigLoad(_)
                | ArchiverError::DriverStopped
        )
    }
}

/// Why a persist attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteFailureKind {
    /// The per-source directory does not exist and could not be created.
    DirectoryUnavailable,
    /// The target path is not writable.
    PermissionDenied,
    /// Any other I/O error reported during the write.
    Io,
    /// The write did not finish within the persist timeout.
    Timeout,
    /// The persist worker ended without reporting a result.
    Aborted,
}

impl fmt::Display for WriteFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailureKind::DirectoryUnavailable => write!(f, "directory unavailable"),
            WriteFailureKind::PermissionDenied => write!(f, "permission denied"),
            WriteFailureKind::Io => write!(f, "I/O error"),
            WriteFailureKind::Timeout => write!(f, "timed out"),
            WriteFailureKind::Aborted => write!(f, "aborted"),
        }
    }
}

/// Failed outcome of one persist attempt.
#[derive(Error, Debug, Clone)]
#[error("Write to '{}' failed ({kind}): {cause}", path.display())]
pub struct WriteFailure {
    /// Failure category
    pub kind: WriteFailureKind,
    /// File or directory the write was aimed at
    pub path: PathBuf,
    /// Underlying error message
    pub cause: String,
}

impl WriteFailure {
    /// Failure of `kind` at `path`.
    pub fn new(kind: WriteFailureKind, path: impl Into<PathBuf>, cause: impl fmt::Display) -> Self {
        Self {
            kind,
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    /// Classify an I/O error raised while writing `path`.
    pub fn from_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => WriteFailureKind::PermissionDenied,
            _ => WriteFailureKind::Io,
        };
        Self::new(kind, path, err)
    }
}
