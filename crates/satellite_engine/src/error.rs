//! Error types for the satellite engine.

use satellite_protocol::{ProtocolError, ProtocolVersion};
use satellite_storage::StorageError;
use thiserror::Error;

/// Result type for satellite operations.
pub type SatelliteResult<T> = Result<T, SatelliteError>;

/// Errors that can occur in the satellite process.
///
/// Transport and protocol errors are contained in the connection loop and
/// retried with backoff. Only storage failures, schema gaps and protocol
/// incompatibilities reach the application, through
/// [`crate::SatelliteStatus::Error`] or the failing call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SatelliteError {
    /// The local store cannot serve requests.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The local store rejected a statement.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the connection loop may retry.
        retryable: bool,
    },

    /// The peer sent a malformed or unexpected message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A migration needed to reach the server's schema is missing.
    #[error("schema gap: local version {local}, server version {remote}, missing version {missing}")]
    SchemaGap {
        /// Local schema watermark.
        local: u64,
        /// Version the server requires.
        remote: u64,
        /// First missing version.
        missing: u64,
    },

    /// A migration record could not be applied.
    #[error("invalid migration {version}: {reason}")]
    InvalidMigration {
        /// Record version.
        version: u64,
        /// What is wrong with it.
        reason: String,
    },

    /// Peers disagree on the protocol major version.
    #[error("incompatible protocol: local {local}, remote {remote}")]
    IncompatibleProtocol {
        /// Our version.
        local: ProtocolVersion,
        /// Server version.
        remote: ProtocolVersion,
    },

    /// The table is not enrolled in sync.
    #[error("table {0} is not tracked")]
    UnknownTable(String),

    /// No row with the given primary key.
    #[error("row not found in table {table}")]
    RowNotFound {
        /// Table name.
        table: String,
    },

    /// A row did not fit its table.
    #[error("invalid row for table {table}: {reason}")]
    InvalidRow {
        /// Table name.
        table: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Persisted sync state could not be decoded.
    #[error("corrupt sync state: {0}")]
    Corrupt(String),

    /// The satellite has been stopped.
    #[error("satellite stopped")]
    Stopped,

    /// `start` was called on a running satellite.
    #[error("satellite already started")]
    AlreadyStarted,
}

impl SatelliteError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a protocol violation.
    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Returns true if the connection loop should reconnect after this
    /// error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SatelliteError::Transport { retryable, .. } => *retryable,
            SatelliteError::ProtocolViolation(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error stops the satellite and is reported to
    /// the application.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<StorageError> for SatelliteError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(message) => SatelliteError::StorageUnavailable(message),
            other => SatelliteError::Storage(other),
        }
    }
}

impl From<ProtocolError> for SatelliteError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(message) => SatelliteError::Corrupt(message),
            other => SatelliteError::ProtocolViolation(other.to_string()),
        }
    }
}
