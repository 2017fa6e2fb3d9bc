//! GIOP message types
//!
//! This module implements the GIOP 1.2 wire format as defined in CORBA 2.x
//! chapter 15.
//!
//! GIOP message header format:
//! ```text
//! +--------+--------+--------+--------+
//! |  'G'   |  'I'   |  'O'   |  'P'   |
//! +--------+--------+--------+--------+
//! | major  | minor  | flags  | type   |
//! +--------+--------+--------+--------+
//! |           message size            |
//! +--------+--------+--------+--------+
//! ```
//!
//! Flags: bit 0 is the byte order of everything after the flags octet
//! (1 = little-endian), bit 1 signals that more fragments follow. The
//! message size does not include the 12 header octets. CDR positions are
//! counted from the first magic octet, which is why Request and Reply
//! bodies land on an 8-octet boundary relative to the header start.

use crate::error::{GiopError, Result};
use bytes::Bytes;
use cdr::{CdrReader, CdrWriter};

/// GIOP magic octets
pub const GIOP_MAGIC: [u8; 4] = *b"GIOP";
/// GIOP protocol major version
pub const GIOP_MAJOR: u8 = 1;
/// GIOP protocol minor version
pub const GIOP_MINOR: u8 = 2;

/// GIOP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Invocation request
    Request = 0,
    /// Invocation reply
    Reply = 1,
    /// Best-effort cancellation of a pending request
    CancelRequest = 2,
    /// Object location query
    LocateRequest = 3,
    /// Object location answer
    LocateReply = 4,
    /// Orderly connection shutdown
    CloseConnection = 5,
    /// Protocol error signal
    MessageError = 6,
    /// Continuation of a fragmented message
    Fragment = 7,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Reply),
            2 => Some(Self::CancelRequest),
            3 => Some(Self::LocateRequest),
            4 => Some(Self::LocateReply),
            5 => Some(Self::CloseConnection),
            6 => Some(Self::MessageError),
            7 => Some(Self::Fragment),
            _ => None,
        }
    }
}

/// The 12-octet GIOP message header
#[derive(Debug, Clone, Copy)]
pub struct GiopHeader {
    pub little_endian: bool,
    pub more_fragments: bool,
    pub kind: MessageKind,
    /// Octets following the header
    pub size: u32,
}

impl GiopHeader {
    /// Header size in octets
    pub const SIZE: usize = 12;
    /// Byte-order flag (set = little-endian)
    pub const FLAG_LITTLE_ENDIAN: u8 = 0x01;
    /// More-fragments flag
    pub const FLAG_MORE_FRAGMENTS: u8 = 0x02;

    pub fn new(kind: MessageKind, little_endian: bool) -> Self {
        Self {
            little_endian,
            more_fragments: false,
            kind,
            size: 0,
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.little_endian {
            flags |= Self::FLAG_LITTLE_ENDIAN;
        }
        if self.more_fragments {
            flags |= Self::FLAG_MORE_FRAGMENTS;
        }
        flags
    }

    /// Write the header at the current position (which must be 0 for a
    /// well-formed message stream).
    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_opaque(&GIOP_MAGIC);
        w.write_octet(GIOP_MAJOR);
        w.write_octet(GIOP_MINOR);
        w.write_octet(self.flags());
        w.write_octet(self.kind as u8);
        w.write_u32(self.size);
    }

    /// Parse a header from the first 12 octets of a frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(GiopError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("GIOP header too short: {} octets", data.len()),
            )));
        }
        let magic: [u8; 4] = [data[0], data[1], data[2], data[3]];
        if magic != GIOP_MAGIC {
            return Err(GiopError::BadMagic(magic));
        }
        // Header fields of 1.0/1.1 frames would parse, but every body
        // layout in this engine is 1.2; other minors are torn down as
        // unsupported rather than misread.
        let (major, minor) = (data[4], data[5]);
        if major != GIOP_MAJOR || minor != GIOP_MINOR {
            return Err(GiopError::UnsupportedVersion { major, minor });
        }
        let flags = data[6];
        let little_endian = (flags & Self::FLAG_LITTLE_ENDIAN) != 0;
        let kind = MessageKind::from_u8(data[7]).ok_or(GiopError::InvalidMessageType(data[7]))?;
        let size = if little_endian {
            u32::from_le_bytes([data[8], data[9], data[10], data[11]])
        } else {
            u32::from_be_bytes([data[8], data[9], data[10], data[11]])
        };
        Ok(Self {
            little_endian,
            more_fragments: (flags & Self::FLAG_MORE_FRAGMENTS) != 0,
            kind,
            size,
        })
    }
}

/// Reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyStatus {
    NoException = 0,
    UserException = 1,
    SystemException = 2,
    LocationForward = 3,
}

impl ReplyStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::NoException),
            1 => Some(Self::UserException),
            2 => Some(Self::SystemException),
            3 => Some(Self::LocationForward),
            _ => None,
        }
    }
}

/// Locate reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LocateStatus {
    UnknownObject = 0,
    ObjectHere = 1,
    ObjectForward = 2,
}

impl LocateStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::UnknownObject),
            1 => Some(Self::ObjectHere),
            2 => Some(Self::ObjectForward),
            _ => None,
        }
    }
}

/// An IOP service context: a tagged encapsulation attached to request and
/// reply headers. Contexts this engine does not understand are preserved
/// opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    pub context_id: u32,
    pub data: Bytes,
}

impl ServiceContext {
    /// CodeSets context id
    pub const CODE_SETS: u32 = 1;
    /// BiDirIIOP context id
    pub const BI_DIR_IIOP: u32 = 5;

    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.context_id);
        w.write_octet_seq(&self.data);
    }

    pub fn decode(r: &mut CdrReader) -> Result<Self> {
        let context_id = r.read_u32()?;
        let data = r.read_octet_seq()?;
        Ok(Self { context_id, data })
    }
}

pub(crate) fn write_service_contexts(w: &mut CdrWriter, contexts: &[ServiceContext]) {
    w.write_u32(contexts.len() as u32);
    for context in contexts {
        context.encode(w);
    }
}

pub(crate) fn read_service_contexts(r: &mut CdrReader) -> Result<Vec<ServiceContext>> {
    let count = r.read_seq_len(8)?;
    let mut contexts = Vec::with_capacity(count);
    for _ in 0..count {
        contexts.push(ServiceContext::decode(r)?);
    }
    Ok(contexts)
}

/// An advertised callback endpoint inside a BiDirIIOP context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenPoint {
    pub host: String,
    pub port: u16,
}

impl ListenPoint {
    /// Endpoint key used by the connection manager tables.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// BiDirIIOP service context body: the listen points under which the
/// sending side accepts callback requests over this same connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BiDirContext {
    pub listen_points: Vec<ListenPoint>,
}

impl BiDirContext {
    pub fn to_context(&self) -> ServiceContext {
        let mut encap = CdrWriter::encapsulation(false);
        encap.write_u32(self.listen_points.len() as u32);
        for point in &self.listen_points {
            encap.write_string(&point.host);
            encap.write_u16(point.port);
        }
        ServiceContext {
            context_id: ServiceContext::BI_DIR_IIOP,
            data: encap.into_bytes(),
        }
    }

    pub fn from_context(context: &ServiceContext) -> Result<Self> {
        let mut encap = CdrReader::encapsulation(context.data.clone())?;
        let count = encap.read_seq_len(7)?;
        let mut listen_points = Vec::with_capacity(count);
        for _ in 0..count {
            let host = encap.read_string()?;
            let port = encap.read_u16()?;
            listen_points.push(ListenPoint { host, port });
        }
        Ok(Self { listen_points })
    }
}

/// CodeSets service context body: the char and wchar transmission code
/// sets selected by the sending side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSetsContext {
    pub char_set: u32,
    pub wchar_set: u32,
}

impl CodeSetsContext {
    /// OSF registry id for UTF-8
    pub const UTF8: u32 = 0x0501_0001;
    /// OSF registry id for UTF-16
    pub const UTF16: u32 = 0x0001_0109;

    /// The code sets this engine transmits: UTF-8 strings, UTF-16 wide.
    pub fn native() -> Self {
        Self {
            char_set: Self::UTF8,
            wchar_set: Self::UTF16,
        }
    }

    pub fn to_context(&self) -> ServiceContext {
        let mut encap = CdrWriter::encapsulation(false);
        encap.write_u32(self.char_set);
        encap.write_u32(self.wchar_set);
        ServiceContext {
            context_id: ServiceContext::CODE_SETS,
            data: encap.into_bytes(),
        }
    }

    pub fn from_context(context: &ServiceContext) -> Result<Self> {
        let mut encap = CdrReader::encapsulation(context.data.clone())?;
        Ok(Self {
            char_set: encap.read_u32()?,
            wchar_set: encap.read_u32()?,
        })
    }
}

/// GIOP 1.2 Request header
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub request_id: u32,
    /// 0x03 = reply expected, 0x00 = oneway
    pub response_flags: u8,
    /// Object key of the target servant (KeyAddr addressing)
    pub object_key: Bytes,
    pub operation: String,
    pub service_contexts: Vec<ServiceContext>,
}

impl RequestHeader {
    /// Response flags octet for a call that expects a reply
    pub const RESPONSE_EXPECTED: u8 = 0x03;
    /// Response flags octet for a oneway call
    pub const NO_RESPONSE: u8 = 0x00;
    /// KeyAddr target addressing disposition
    pub const KEY_ADDR: u16 = 0;

    pub fn new(request_id: u32, object_key: Bytes, operation: impl Into<String>) -> Self {
        Self {
            request_id,
            response_flags: Self::RESPONSE_EXPECTED,
            object_key,
            operation: operation.into(),
            service_contexts: Vec::new(),
        }
    }

    pub fn oneway(mut self) -> Self {
        self.response_flags = Self::NO_RESPONSE;
        self
    }

    /// Bit 0 is set for every sync scope that produces a reply, in 1.0/1.1
    /// encodings as well as 1.2.
    pub fn response_expected(&self) -> bool {
        (self.response_flags & 0x01) != 0
    }

    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.request_id);
        w.write_octet(self.response_flags);
        w.write_opaque(&[0, 0, 0]);
        w.write_u16(Self::KEY_ADDR);
        w.write_octet_seq(&self.object_key);
        w.write_string(&self.operation);
        write_service_contexts(w, &self.service_contexts);
    }

    pub fn decode(r: &mut CdrReader) -> Result<Self> {
        let request_id = r.read_u32()?;
        let response_flags = r.read_octet()?;
        r.read_opaque(3)?;
        let disposition = r.read_u16()?;
        if disposition != Self::KEY_ADDR {
            return Err(GiopError::UnsupportedTargetAddress(disposition));
        }
        let object_key = r.read_octet_seq()?;
        let operation = r.read_string()?;
        let service_contexts = read_service_contexts(r)?;
        Ok(Self {
            request_id,
            response_flags,
            object_key,
            operation,
            service_contexts,
        })
    }

    pub fn context(&self, context_id: u32) -> Option<&ServiceContext> {
        self.service_contexts
            .iter()
            .find(|c| c.context_id == context_id)
    }
}

/// GIOP 1.2 Reply header
#[derive(Debug, Clone)]
pub struct ReplyHeader {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub service_contexts: Vec<ServiceContext>,
}

impl ReplyHeader {
    pub fn new(request_id: u32, status: ReplyStatus) -> Self {
        Self {
            request_id,
            status,
            service_contexts: Vec::new(),
        }
    }

    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.request_id);
        w.write_u32(self.status as u32);
        write_service_contexts(w, &self.service_contexts);
    }

    pub fn decode(r: &mut CdrReader) -> Result<Self> {
        let request_id = r.read_u32()?;
        let raw_status = r.read_u32()?;
        let status = ReplyStatus::from_u32(raw_status)
            .ok_or(cdr::CdrError::InvalidDiscriminant(raw_status))?;
        let service_contexts = read_service_contexts(r)?;
        Ok(Self {
            request_id,
            status,
            service_contexts,
        })
    }
}

/// GIOP 1.2 LocateRequest header
#[derive(Debug, Clone)]
pub struct LocateRequestHeader {
    pub request_id: u32,
    pub object_key: Bytes,
}

impl LocateRequestHeader {
    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.request_id);
        w.write_u16(RequestHeader::KEY_ADDR);
        w.write_octet_seq(&self.object_key);
    }

    pub fn decode(r: &mut CdrReader) -> Result<Self> {
        let request_id = r.read_u32()?;
        let disposition = r.read_u16()?;
        if disposition != RequestHeader::KEY_ADDR {
            return Err(GiopError::UnsupportedTargetAddress(disposition));
        }
        let object_key = r.read_octet_seq()?;
        Ok(Self {
            request_id,
            object_key,
        })
    }
}

/// GIOP 1.2 LocateReply header
#[derive(Debug, Clone, Copy)]
pub struct LocateReplyHeader {
    pub request_id: u32,
    pub status: LocateStatus,
}

impl LocateReplyHeader {
    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.request_id);
        w.write_u32(self.status as u32);
    }

    pub fn decode(r: &mut CdrReader) -> Result<Self> {
        let request_id = r.read_u32()?;
        let raw_status = r.read_u32()?;
        let status = LocateStatus::from_u32(raw_status)
            .ok_or(cdr::CdrError::InvalidDiscriminant(raw_status))?;
        Ok(Self { request_id, status })
    }
}

/// A parsed, complete (reassembled) GIOP message.
///
/// Request, Reply and LocateReply carry a body reader positioned right
/// after their header, with stream positions preserved from the original
/// frame so value-type indirections resolve correctly.
#[derive(Debug)]
pub enum Message {
    Request {
        header: RequestHeader,
        body: CdrReader,
    },
    Reply {
        header: ReplyHeader,
        body: CdrReader,
    },
    CancelRequest {
        request_id: u32,
    },
    LocateRequest(LocateRequestHeader),
    LocateReply {
        header: LocateReplyHeader,
        body: CdrReader,
    },
    CloseConnection,
    MessageError,
}

impl Message {
    /// Parse a complete frame (header plus body, fragments already
    /// reassembled).
    pub fn parse(frame: Bytes) -> Result<Self> {
        let header = GiopHeader::decode(&frame)?;
        if header.more_fragments {
            return Err(GiopError::UnexpectedFragment);
        }
        let mut r = CdrReader::new(frame, header.little_endian);
        r.read_opaque(GiopHeader::SIZE)?;
        match header.kind {
            MessageKind::Request => {
                let request = RequestHeader::decode(&mut r)?;
                align_body(&mut r)?;
                Ok(Message::Request {
                    header: request,
                    body: r,
                })
            }
            MessageKind::Reply => {
                let reply = ReplyHeader::decode(&mut r)?;
                align_body(&mut r)?;
                Ok(Message::Reply {
                    header: reply,
                    body: r,
                })
            }
            MessageKind::CancelRequest => Ok(Message::CancelRequest {
                request_id: r.read_u32()?,
            }),
            MessageKind::LocateRequest => {
                Ok(Message::LocateRequest(LocateRequestHeader::decode(&mut r)?))
            }
            MessageKind::LocateReply => {
                let locate = LocateReplyHeader::decode(&mut r)?;
                Ok(Message::LocateReply {
                    header: locate,
                    body: r,
                })
            }
            MessageKind::CloseConnection => Ok(Message::CloseConnection),
            MessageKind::MessageError => Ok(Message::MessageError),
            MessageKind::Fragment => Err(GiopError::UnexpectedFragment),
        }
    }

    /// Request id this message correlates with, if any.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Message::Request { header, .. } => Some(header.request_id),
            Message::Reply { header, .. } => Some(header.request_id),
            Message::CancelRequest { request_id } => Some(*request_id),
            Message::LocateRequest(header) => Some(header.request_id),
            Message::LocateReply { header, .. } => Some(header.request_id),
            Message::CloseConnection | Message::MessageError => None,
        }
    }
}

/// Request and Reply bodies start on an 8-octet boundary in GIOP 1.2.
/// Peers may omit the padding when the body is empty, so only skip it when
/// octets remain.
fn align_body(r: &mut CdrReader) -> Result<()> {
    if r.remaining() > 0 {
        r.align(8)?;
    }
    Ok(())
}

/// Builder for outgoing frames. Writes the header and kind-specific header
/// fields immediately, exposes the body writer for payload encoding, and
/// patches the message size on `finish`.
#[derive(Debug)]
pub struct MessageWriter {
    w: CdrWriter,
}

impl MessageWriter {
    fn start(kind: MessageKind, little_endian: bool) -> Self {
        let mut w = CdrWriter::new(little_endian);
        GiopHeader::new(kind, little_endian).encode(&mut w);
        Self { w }
    }

    pub fn request(header: &RequestHeader, little_endian: bool) -> Self {
        let mut mw = Self::start(MessageKind::Request, little_endian);
        header.encode(&mut mw.w);
        mw.w.align(8);
        mw
    }

    pub fn reply(header: &ReplyHeader, little_endian: bool) -> Self {
        let mut mw = Self::start(MessageKind::Reply, little_endian);
        header.encode(&mut mw.w);
        mw.w.align(8);
        mw
    }

    pub fn cancel_request(request_id: u32, little_endian: bool) -> Self {
        let mut mw = Self::start(MessageKind::CancelRequest, little_endian);
        mw.w.write_u32(request_id);
        mw
    }

    pub fn locate_request(header: &LocateRequestHeader, little_endian: bool) -> Self {
        let mut mw = Self::start(MessageKind::LocateRequest, little_endian);
        header.encode(&mut mw.w);
        mw
    }

    pub fn locate_reply(header: &LocateReplyHeader, little_endian: bool) -> Self {
        let mut mw = Self::start(MessageKind::LocateReply, little_endian);
        header.encode(&mut mw.w);
        mw
    }

    pub fn close_connection(little_endian: bool) -> Self {
        Self::start(MessageKind::CloseConnection, little_endian)
    }

    pub fn message_error(little_endian: bool) -> Self {
        Self::start(MessageKind::MessageError, little_endian)
    }

    /// Writer for the message body. Positions continue from the header, so
    /// CDR alignment inside the body is message-relative as required.
    pub fn body(&mut self) -> &mut CdrWriter {
        &mut self.w
    }

    /// Patch the size field and yield the finished frame.
    pub fn finish(mut self) -> Bytes {
        let size = (self.w.position() - GiopHeader::SIZE) as u32;
        self.w.patch_u32(8, size);
        self.w.into_bytes()
    }
}
