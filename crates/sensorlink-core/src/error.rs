//! Unified error types for the sensorlink core library.
//!
//! Each module keeps its own error type ([`DecodeError`], [`TransportError`],
//! [`OperationError`](crate::transport::OperationError),
//! [`SessionError`](crate::session::SessionError),
//! [`RetrievalError`](crate::racp::RetrievalError),
//! [`ConfigError`](crate::config::ConfigError)) for internal use. Everything
//! that crosses the crate boundary is converted into [`SensorlinkError`].
//!
//! # Example
//!
//! ```rust
//! use sensorlink_core::error::{Result, SensorlinkError};
//! use sensorlink_core::types::PeripheralId;
//!
//! fn parse(address: &str) -> Result<PeripheralId> {
//!     address.parse()
//! }
//!
//! assert!(matches!(parse("nope"), Err(SensorlinkError::InvalidAddress(_))));
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::codec::DecodeError;
use crate::transport::TransportError;

/// The unified error type for all sensorlink operations.
#[derive(Debug, Error)]
pub enum SensorlinkError {
    // =========================================================================
    // PERIPHERAL & SESSION ERRORS
    // =========================================================================
    /// The string is not a Bluetooth address.
    #[error("Invalid Bluetooth address: '{0}'. Expected format 'AA:BB:CC:DD:EE:FF'.")]
    InvalidAddress(String),

    /// No session is managed for this peripheral.
    #[error("Peripheral not found: '{0}'. Add it before sending commands to it.")]
    NotFound(String),

    /// `connect` was called on a session that is already live.
    #[error("Peripheral '{0}' is already connected or connecting")]
    AlreadyConnected(String),

    /// The command needs a ready session.
    #[error("Peripheral '{address}' is not ready (state: {state})")]
    NotReady {
        /// Peripheral address.
        address: String,
        /// Current connection state.
        state: String,
    },

    /// The peripheral is already managed under a different profile.
    #[error("Peripheral '{address}' is already managed as {existing}, not {requested}. Forget it first.")]
    ProfileMismatch {
        /// Peripheral address.
        address: String,
        /// Profile it is managed with.
        existing: String,
        /// Profile that was asked for.
        requested: String,
    },

    /// The peripheral lacks a required characteristic.
    #[error("Peripheral '{0}' does not support the requested profile")]
    UnsupportedDevice(String),

    /// The registry was stopped and refuses new connections.
    #[error("Session registry is stopped")]
    RegistryStopped,

    // =========================================================================
    // RECORD ACCESS ERRORS
    // =========================================================================
    /// A record retrieval is already running on this session.
    #[error("A record retrieval is already in progress ({0})")]
    RetrievalInProgress(String),

    /// `abort` was called with nothing to abort.
    #[error("No abortable record retrieval is in progress ({0})")]
    NothingToAbort(String),

    /// The profile has no record access control point.
    #[error("Record access is not available for peripheral '{0}'")]
    RecordAccessUnavailable(String),

    // =========================================================================
    // WIRE ERRORS
    // =========================================================================
    /// The peripheral needs to be bonded before the operation can proceed.
    #[error("Authentication required: bond with the peripheral and retry")]
    AuthenticationRequired,

    /// An operation ran out of retries.
    #[error("Operation timed out")]
    OperationTimeout,

    /// The peripheral answered with something the protocol does not allow.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for sensorlink operations.
pub type Result<T> = std::result::Result<T, SensorlinkError>;

impl SensorlinkError {
    /// Returns `true` if this error concerns session lifecycle or identity.
    #[inline]
    #[must_use]
    pub const fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_)
                | Self::NotFound(_)
                | Self::AlreadyConnected(_)
                | Self::ProfileMismatch { .. }
                | Self::NotReady { .. }
                | Self::UnsupportedDevice(_)
                | Self::RegistryStopped
        )
    }

    /// Returns `true` if this error concerns record access.
    #[inline]
    #[must_use]
    pub const fn is_retrieval_error(&self) -> bool {
        matches!(
            self,
            Self::RetrievalInProgress(_)
                | Self::NothingToAbort(_)
                | Self::RecordAccessUnavailable(_)
                | Self::ProtocolError(_)
        )
    }

    /// Returns `true` if this error came off the wire or the transport.
    #[inline]
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::AuthenticationRequired
                | Self::OperationTimeout
                | Self::Decode(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if retrying later may succeed without user intervention.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OperationTimeout | Self::RetrievalInProgress(_) | Self::Decode(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidAddress(_) => 400,

            // 404 Not Found
            Self::NotFound(_) | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - refused in the current state
            Self::AlreadyConnected(_)
            | Self::ProfileMismatch { .. }
            | Self::NotReady { .. }
            | Self::RetrievalInProgress(_)
            | Self::NothingToAbort(_) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::UnsupportedDevice(_)
            | Self::RecordAccessUnavailable(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - the peripheral misbehaved
            Self::ProtocolError(_) | Self::Decode(_) => 502,

            // 503 Service Unavailable - radio or link issues
            Self::RegistryStopped
            | Self::Transport(_)
            | Self::AuthenticationRequired
            | Self::OperationTimeout => 503,
        }
    }

    /// Returns a machine-readable error code for API responses and events.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::NotFound(_) => "PERIPHERAL_NOT_FOUND",
            Self::AlreadyConnected(_) => "ALREADY_CONNECTED",
            Self::ProfileMismatch { .. } => "PROFILE_MISMATCH",
            Self::NotReady { .. } => "NOT_READY",
            Self::UnsupportedDevice(_) => "UNSUPPORTED_DEVICE",
            Self::RegistryStopped => "REGISTRY_STOPPED",
            Self::RetrievalInProgress(_) => "RETRIEVAL_IN_PROGRESS",
            Self::NothingToAbort(_) => "NOTHING_TO_ABORT",
            Self::RecordAccessUnavailable(_) => "RECORD_ACCESS_UNAVAILABLE",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::ProtocolError(_) => "PROTOCOL_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for SensorlinkError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {}", path.display(), source))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::NoConfigDirectory => {
                Self::PersistenceError("Cannot determine config directory".into())
            }
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::session::SessionError> for SensorlinkError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::SessionError;
        match err {
            SessionError::AlreadyConnected(id) => Self::AlreadyConnected(id.to_string()),
            SessionError::Unsupported(id) => Self::UnsupportedDevice(id.to_string()),
            SessionError::NotReady { peripheral, state } => Self::NotReady {
                address: peripheral.to_string(),
                state: state.to_string(),
            },
            SessionError::RecordAccessUnavailable(id) => {
                Self::RecordAccessUnavailable(id.to_string())
            }
            SessionError::Retrieval(e) => e.into(),
            SessionError::Transport(e) => Self::Transport(e),
        }
    }
}

impl From<crate::racp::RetrievalError> for SensorlinkError {
    fn from(err: crate::racp::RetrievalError) -> Self {
        use crate::racp::RetrievalError;
        match err {
            RetrievalError::Busy(phase) => Self::RetrievalInProgress(phase.to_string()),
            RetrievalError::NotAbortable(phase) => Self::NothingToAbort(phase.to_string()),
        }
    }
}

impl From<crate::transport::OperationError> for SensorlinkError {
    fn from(err: crate::transport::OperationError) -> Self {
        use crate::transport::OperationError;
        if err.is_authentication() {
            return Self::AuthenticationRequired;
        }
        match err {
            OperationError::Timeout => Self::OperationTimeout,
            other => Self::ProtocolError(other.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::racp::{Phase, RetrievalError};
    use crate::transport::OperationError;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_session_error_classification() {
        assert!(SensorlinkError::InvalidAddress("x".into()).is_session_error());
        assert!(SensorlinkError::NotFound("AA:BB:CC:DD:EE:FF".into()).is_session_error());
        assert!(SensorlinkError::RegistryStopped.is_session_error());
        assert!(!SensorlinkError::OperationTimeout.is_session_error());
    }

    #[test]
    fn test_retrieval_error_classification() {
        assert!(SensorlinkError::RetrievalInProgress("awaiting records".into()).is_retrieval_error());
        assert!(SensorlinkError::ProtocolError("bad".into()).is_retrieval_error());
        assert!(!SensorlinkError::RegistryStopped.is_retrieval_error());
    }

    #[test]
    fn test_config_and_io_classification() {
        assert!(SensorlinkError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(SensorlinkError::ConfigValidationError("bad".into()).is_config_error());
        assert!(SensorlinkError::IoError(IoErr::new(ErrorKind::NotFound, "test")).is_io_error());
        assert!(!SensorlinkError::RegistryStopped.is_config_error());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SensorlinkError::OperationTimeout.is_recoverable());
        assert!(!SensorlinkError::UnsupportedDevice("x".into()).is_recoverable());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(SensorlinkError::InvalidAddress("x".into()).http_status_code(), 400);
        assert_eq!(SensorlinkError::NotFound("x".into()).http_status_code(), 404);
        assert_eq!(
            SensorlinkError::RetrievalInProgress("x".into()).http_status_code(),
            409
        );
        assert_eq!(
            SensorlinkError::RecordAccessUnavailable("x".into()).http_status_code(),
            422
        );
        assert_eq!(SensorlinkError::RegistryStopped.http_status_code(), 503);
    }

    #[test]
    fn test_error_codes_are_screaming_snake_case() {
        let errors = [
            SensorlinkError::InvalidAddress("x".into()),
            SensorlinkError::NotFound("x".into()),
            SensorlinkError::AuthenticationRequired,
            SensorlinkError::OperationTimeout,
            SensorlinkError::PersistenceError("x".into()),
        ];
        for err in errors {
            let code = err.error_code();
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_from_config_error() {
        let err: SensorlinkError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "session.max_retries".into(),
                message: "too large".into(),
            },
            ConfigError::ValidationError {
                field: "server.bind_address".into(),
                message: "empty".into(),
            },
        ])
        .into();
        assert!(err.is_config_error());
        let message = err.to_string();
        assert!(message.contains("session.max_retries"));
        assert!(message.contains("server.bind_address"));
    }

    #[test]
    fn test_from_retrieval_error() {
        let err: SensorlinkError = RetrievalError::Busy(Phase::AwaitingRecords).into();
        assert_eq!(err.error_code(), "RETRIEVAL_IN_PROGRESS");
        let err: SensorlinkError = RetrievalError::NotAbortable(Phase::Idle).into();
        assert_eq!(err.error_code(), "NOTHING_TO_ABORT");
    }

    #[test]
    fn test_from_operation_error() {
        let err: SensorlinkError = OperationError::InsufficientAuthentication.into();
        assert!(matches!(err, SensorlinkError::AuthenticationRequired));
        let err: SensorlinkError = OperationError::Timeout.into();
        assert!(matches!(err, SensorlinkError::OperationTimeout));
    }
}
