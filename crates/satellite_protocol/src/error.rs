//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame declared a length above the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame could not be decoded.
    #[error("corrupt frame (kind {kind}): {reason}")]
    Corrupt {
        /// Message kind byte (0 if the frame had none).
        kind: u8,
        /// What went wrong.
        reason: String,
    },

    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Creates a corrupt-frame error.
    pub fn corrupt(kind: u8, reason: impl Into<String>) -> Self {
        ProtocolError::Corrupt {
            kind,
            reason: reason.into(),
        }
    }
}
