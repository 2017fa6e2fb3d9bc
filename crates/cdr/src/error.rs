//! CDR error types

use thiserror::Error;

/// CDR encoding/decoding errors
#[derive(Debug, Error)]
pub enum CdrError {
    /// Buffer underflow - not enough data left in the stream
    #[error("buffer underflow at position {position}: needed {needed} bytes, have {have}")]
    BufferUnderflow {
        position: usize,
        needed: usize,
        have: usize,
    },

    /// Invalid string - missing terminator, bad length prefix or invalid encoding
    #[error("invalid string: {0}")]
    InvalidString(String),

    /// Length prefix larger than the remaining stream
    #[error("invalid length prefix {length} with {remaining} bytes remaining")]
    InvalidLength { length: usize, remaining: usize },

    /// Invalid discriminant for a union
    #[error("invalid union discriminant: {0}")]
    InvalidDiscriminant(u32),

    /// Invalid boolean octet (must be 0 or 1)
    #[error("invalid boolean octet: {0:#04x}")]
    InvalidBoolean(u8),

    /// Encapsulation shorter than its own endian flag
    #[error("invalid encapsulation: {0}")]
    InvalidEncapsulation(String),

    /// UTF-8 decoding error
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

/// Result type for CDR operations
pub type Result<T> = std::result::Result<T, CdrError>;
