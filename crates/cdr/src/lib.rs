//! CDR (Common Data Representation) runtime library
//!
//! This crate implements the CDR transfer syntax used by GIOP, as specified
//! in CORBA 2.x chapter 15.
//!
//! # CDR Wire Format
//!
//! Key characteristics:
//! - Primitives align to their natural size (1, 2, 4, or 8 bytes), measured
//!   from the start of the enclosing message, not from the value itself
//! - Byte order is chosen per message by the sender and flagged in the
//!   message header; receivers must accept both
//! - Strings carry a u32 length that includes the terminating NUL octet
//! - Sequences carry a u32 element count followed by the elements
//! - Encapsulations are octet sequences with their own endian flag and an
//!   independent alignment origin

mod decode;
mod encode;
mod error;
mod reader;
mod writer;

pub use decode::CdrDecode;
pub use encode::CdrEncode;
pub use error::{CdrError, Result};
pub use reader::CdrReader;
pub use writer::CdrWriter;

/// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};
