//! Error taxonomy for the ORB engine.
//!
//! Every failure an invocation can produce maps onto one of the variants
//! here. Faults raised while serving a request travel back to the caller as
//! a GIOP system exception (repository id, minor code, completion status);
//! [`OrbError::to_system_exception`] and [`OrbError::from_system_exception`]
//! are the two halves of that mapping.

use bytes::Bytes;
use thiserror::Error;

/// Standard repository id for an unknown server-side failure.
pub const EX_UNKNOWN: &str = "IDL:omg.org/CORBA/UNKNOWN:1.0";
/// Raised when a message or value graph cannot be decoded.
pub const EX_MARSHAL: &str = "IDL:omg.org/CORBA/MARSHAL:1.0";
/// Raised when the target object key names nothing.
pub const EX_OBJECT_NOT_EXIST: &str = "IDL:omg.org/CORBA/OBJECT_NOT_EXIST:1.0";
/// Raised when the operation name is not part of the target interface.
pub const EX_BAD_OPERATION: &str = "IDL:omg.org/CORBA/BAD_OPERATION:1.0";
/// Raised when a repository id has no registered descriptor.
pub const EX_NO_IMPLEMENT: &str = "IDL:omg.org/CORBA/NO_IMPLEMENT:1.0";
/// Raised when an object reference is structurally unusable.
pub const EX_INV_OBJREF: &str = "IDL:omg.org/CORBA/INV_OBJREF:1.0";

/// Completion status carried by a system exception, telling the caller
/// whether the target had finished executing when the fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Yes,
    No,
    Maybe,
}

impl CompletionStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CompletionStatus::Yes),
            1 => Some(CompletionStatus::No),
            2 => Some(CompletionStatus::Maybe),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CompletionStatus::Yes => 0,
            CompletionStatus::No => 1,
            CompletionStatus::Maybe => 2,
        }
    }
}

/// Errors produced by reference resolution, marshalling and dispatch.
#[derive(Debug, Error)]
pub enum OrbError {
    /// A frame, header or value graph violated the wire format.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// No profile of the reference led to a usable connection.
    #[error("unresolvable reference: {0}")]
    UnresolvableReference(String),

    /// A repository id with no registered descriptor or mapping.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// The object key does not name an active servant.
    #[error("object does not exist: {0}")]
    ObjectNotExist(String),

    /// An identifier was already taken in its scope.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// The operation is not part of the target interface.
    #[error("bad operation: {0}")]
    BadOperation(String),

    /// The underlying connection closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller cancelled the request with this identifier.
    #[error("request {0} cancelled")]
    Cancelled(u32),

    /// No reply arrived for this request within the configured deadline.
    #[error("request {0} timed out")]
    Timeout(u32),

    /// A system exception reported by the peer that maps to no local variant.
    #[error("system exception {repo_id} (minor {minor})")]
    SystemException {
        repo_id: String,
        minor: u32,
        completed: CompletionStatus,
    },

    /// An application-defined exception raised by the servant. The payload
    /// is opaque to the engine; callers decode it against their own layout.
    #[error("user exception {repo_id}")]
    UserException { repo_id: String, body: Bytes },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrbError {
    /// Repository id, minor code and completion status used when this error
    /// is reported to a remote caller as a system exception.
    pub fn to_system_exception(&self) -> (&str, u32, CompletionStatus) {
        match self {
            OrbError::ObjectNotExist(_) => (EX_OBJECT_NOT_EXIST, 1, CompletionStatus::No),
            OrbError::MalformedMessage(_) => (EX_MARSHAL, 1, CompletionStatus::No),
            OrbError::UnknownType(_) => (EX_NO_IMPLEMENT, 1, CompletionStatus::No),
            OrbError::BadOperation(_) => (EX_BAD_OPERATION, 1, CompletionStatus::No),
            OrbError::UnresolvableReference(_) => (EX_INV_OBJREF, 1, CompletionStatus::No),
            OrbError::SystemException {
                repo_id,
                minor,
                completed,
            } => (repo_id.as_str(), *minor, *completed),
            _ => (EX_UNKNOWN, 1, CompletionStatus::Maybe),
        }
    }

    /// Reverse of [`to_system_exception`]: fold a system exception received
    /// from the peer back into the local taxonomy where one fits.
    ///
    /// [`to_system_exception`]: OrbError::to_system_exception
    pub fn from_system_exception(
        repo_id: String,
        minor: u32,
        completed: CompletionStatus,
    ) -> Self {
        match repo_id.as_str() {
            EX_OBJECT_NOT_EXIST => {
                OrbError::ObjectNotExist(format!("reported by peer (minor {minor})"))
            }
            EX_MARSHAL => OrbError::MalformedMessage(format!("reported by peer (minor {minor})")),
            EX_NO_IMPLEMENT => OrbError::UnknownType(format!("reported by peer (minor {minor})")),
            EX_BAD_OPERATION => {
                OrbError::BadOperation(format!("reported by peer (minor {minor})"))
            }
            _ => OrbError::SystemException {
                repo_id,
                minor,
                completed,
            },
        }
    }
}

impl From<cdr::CdrError> for OrbError {
    fn from(err: cdr::CdrError) -> Self {
        OrbError::MalformedMessage(err.to_string())
    }
}

impl From<giop::GiopError> for OrbError {
    fn from(err: giop::GiopError) -> Self {
        match err {
            giop::GiopError::ConnectionClosed => OrbError::ConnectionClosed,
            giop::GiopError::Cancelled(id) => OrbError::Cancelled(id),
            giop::GiopError::Timeout(id) => OrbError::Timeout(id),
            giop::GiopError::Io(err) => OrbError::Io(err),
            other => OrbError::MalformedMessage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrbError>;
