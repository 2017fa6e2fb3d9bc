//! GIOP message layer
//!
//! This crate implements the General Inter-ORB Protocol version 1.2 over
//! TCP (IIOP): message framing, fragmentation and connection management.
//! It moves complete frames; marshalling of operation arguments and
//! value graphs lives above it.
//!
//! # Features
//!
//! - GIOP 1.2 message model: Request, Reply, CancelRequest,
//!   LocateRequest, LocateReply, CloseConnection, MessageError, Fragment
//! - Both byte orders on decode, per-message byte order on encode
//! - Fragment trains split and reassembled transparently
//! - Connections multiplex concurrent calls, matched by request id
//! - Bidirectional reuse: an accepted connection whose peer advertised
//!   listen points carries callbacks instead of dialing back
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use giop::{ConnectionManager, ManagerConfig, Message, MessageWriter, RequestHeader};
//!
//! #[tokio::main]
//! async fn main() -> giop::Result<()> {
//!     let manager = ConnectionManager::new(ManagerConfig::default());
//!     let conn = manager.get_connection("192.0.2.10:2809").await?;
//!
//!     let request_id = conn.next_request_id();
//!     let header = RequestHeader::new(request_id, Bytes::from_static(b"obj-key"), "ping");
//!     let frame = MessageWriter::request(&header, false).finish();
//!
//!     let reply = conn.invoke_frame(request_id, frame).await?;
//!     if let Message::Reply { header, .. } = Message::parse(reply)? {
//!         println!("reply status: {:?}", header.status);
//!     }
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod fragments;
pub mod manager;
pub mod message;
pub mod transport;

pub use error::{GiopError, Result};

pub use message::{
    BiDirContext, CodeSetsContext, GiopHeader, ListenPoint, LocateReplyHeader, LocateRequestHeader,
    LocateStatus, Message, MessageKind, MessageWriter, ReplyHeader, ReplyStatus, RequestHeader,
    ServiceContext, GIOP_MAGIC, GIOP_MAJOR, GIOP_MINOR,
};

pub use connection::{
    BoxedReader, BoxedWriter, Connection, ConnectionConfig, ConnectionRole, RequestHandler,
};
pub use fragments::{FragmentAssembler, FragmentSplitter, MIN_FRAGMENT_FRAME};
pub use manager::{ConnectionManager, ManagerConfig};
pub use transport::{GiopTransport, DEFAULT_MAX_MESSAGE_SIZE};
