//! Error types for the GIOP message layer

use thiserror::Error;

/// GIOP protocol errors
#[derive(Debug, Error)]
pub enum GiopError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] cdr::CdrError),

    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported GIOP version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("unsupported target addressing disposition: {0}")]
    UnsupportedTargetAddress(u16),

    #[error("message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("fragment for unknown request id {0}")]
    UnknownFragment(u32),

    #[error("fragmented message already in progress for request id {0}")]
    DuplicateFragment(u32),

    #[error("unexpected fragment message")]
    UnexpectedFragment,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {0} cancelled")]
    Cancelled(u32),

    #[error("request {0} timed out")]
    Timeout(u32),

    #[error("peer signalled a message error")]
    PeerMessageError,

    #[error("connection is not allowed to be closed by this side")]
    NotCloseable,
}

pub type Result<T> = std::result::Result<T, GiopError>;
