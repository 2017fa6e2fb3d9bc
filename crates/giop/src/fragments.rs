//! GIOP message fragmentation
//!
//! A GIOP 1.2 message that exceeds the frame limit is sent as a fragment
//! train. The first frame keeps the original message type with the
//! more-fragments flag set; every following frame is a `Fragment` message
//! whose body starts with the request id, then continuation octets:
//!
//! ```text
//! first frame          continuation           final continuation
//! ├ GIOP header ┐      ├ GIOP header ┐        ├ GIOP header ┐
//! │ kind=Request│      │ kind=Fragment│       │ kind=Fragment│
//! │ flags |= 0x2│      │ flags |= 0x2 │       │ flags &= !0x2│
//! ├ request id  ┤      ├ request id   ┤       ├ request id   ┤
//! │ body[..a]   │      │ body[a..b]   │       │ body[b..]    │
//! ```
//!
//! Every frame except the last must be a multiple of 8 octets long. That
//! keeps continuation data 8-aligned both relative to its own frame and
//! relative to the reassembled message, so CDR alignment is unaffected by
//! where the cuts fall.
//!
//! Reassembly concatenates the continuation octets onto the first frame,
//! clears the more-fragments flag and patches the size field. The result
//! is octet for octet the frame the sender would have produced without
//! fragmentation.

use crate::error::{GiopError, Result};
use crate::message::{GiopHeader, MessageKind};
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;
use bytes::{Bytes, BytesMut};
use cdr::CdrWriter;
use std::collections::HashMap;

/// Octets preceding the continuation data in a `Fragment` frame: the GIOP
/// header plus the request id.
const FRAGMENT_HEADER_SIZE: usize = GiopHeader::SIZE + 4;

/// Smallest usable frame limit: a first frame must hold the header and the
/// request id, and a non-final continuation must carry at least one
/// 8-octet chunk. Limits below this are raised to it.
pub const MIN_FRAGMENT_FRAME: usize = 24;

/// Only messages that carry a request id in their first body word can be
/// fragmented; the id is what associates the continuation frames.
fn carries_request_id(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Request
            | MessageKind::Reply
            | MessageKind::LocateRequest
            | MessageKind::LocateReply
    )
}

/// Read the request id word that directly follows the GIOP header.
pub(crate) fn read_request_id(frame: &[u8], little_endian: bool) -> Result<u32> {
    if frame.len() < FRAGMENT_HEADER_SIZE {
        return Err(GiopError::Malformed(cdr::CdrError::BufferUnderflow {
            position: GiopHeader::SIZE,
            needed: 4,
            have: frame.len().saturating_sub(GiopHeader::SIZE),
        }));
    }
    let raw = [frame[12], frame[13], frame[14], frame[15]];
    Ok(if little_endian {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    })
}

/// Splitter for outgoing frames that exceed the peer's frame limit.
pub struct FragmentSplitter;

impl FragmentSplitter {
    /// Split a complete frame into a fragment train. Frames that already
    /// fit come back as a single element, untouched.
    pub fn split(frame: Bytes, max_frame_size: usize) -> Result<Vec<Bytes>> {
        if frame.len() <= max_frame_size {
            return Ok(vec![frame]);
        }
        let header = GiopHeader::decode(&frame)?;
        if header.more_fragments || !carries_request_id(header.kind) {
            return Err(GiopError::UnexpectedFragment);
        }
        let request_id = read_request_id(&frame, header.little_endian)?;

        // Non-final frames must be multiples of 8 octets.
        let frame_limit = max_frame_size.max(MIN_FRAGMENT_FRAME) & !7;
        if frame.len() <= frame_limit {
            return Ok(vec![frame]);
        }
        let first_payload = frame_limit - GiopHeader::SIZE;
        let continuation_payload = frame_limit - FRAGMENT_HEADER_SIZE;

        let mut frames = Vec::new();

        // First frame: the original octets up to the cut, fragment flag
        // set, size patched down to this frame's body.
        let mut first = BytesMut::with_capacity(frame_limit);
        first.extend_from_slice(&frame[..GiopHeader::SIZE + first_payload]);
        first[6] |= GiopHeader::FLAG_MORE_FRAGMENTS;
        patch_size(&mut first, first_payload as u32, header.little_endian);
        frames.push(first.freeze());

        let mut offset = GiopHeader::SIZE + first_payload;
        while offset < frame.len() {
            let chunk = (frame.len() - offset).min(continuation_payload);
            let more = offset + chunk < frame.len();

            let mut cont = GiopHeader::new(MessageKind::Fragment, header.little_endian);
            cont.more_fragments = more;
            cont.size = (4 + chunk) as u32;

            let mut w = CdrWriter::new(header.little_endian);
            cont.encode(&mut w);
            w.write_u32(request_id);
            w.write_opaque(&frame[offset..offset + chunk]);
            frames.push(w.into_bytes());

            offset += chunk;
        }

        Ok(frames)
    }
}

/// Patch the message size field at octets 8..12 of a frame.
fn patch_size(frame: &mut BytesMut, size: u32, little_endian: bool) {
    let raw = if little_endian {
        size.to_le_bytes()
    } else {
        size.to_be_bytes()
    };
    frame[8..12].copy_from_slice(&raw);
}

/// A message under reassembly: the first frame's octets with continuation
/// data appended as it arrives.
struct PendingMessage {
    little_endian: bool,
    buf: BytesMut,
}

impl PendingMessage {
    /// Restore the header of the now complete frame.
    fn finish(mut self) -> Bytes {
        self.buf[6] &= !GiopHeader::FLAG_MORE_FRAGMENTS;
        let size = (self.buf.len() - GiopHeader::SIZE) as u32;
        patch_size(&mut self.buf, size, self.little_endian);
        self.buf.freeze()
    }
}

/// Reassembler for incoming fragment trains, keyed by request id.
///
/// Complete frames pass through untouched, so a connection can funnel
/// every inbound frame through `push` and treat `Some` as ready to parse.
pub struct FragmentAssembler {
    max_message_size: usize,
    pending: HashMap<u32, PendingMessage>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Cap the reassembled message size. Individual frames are already
    /// limited by the transport; this bounds what a long fragment train
    /// can accumulate.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            pending: HashMap::new(),
        }
    }

    /// Number of messages currently under reassembly.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one inbound frame.
    ///
    /// Returns `Ok(Some(frame))` when the frame completes a message (or
    /// was never fragmented), `Ok(None)` while more fragments are owed.
    pub fn push(&mut self, frame: Bytes) -> Result<Option<Bytes>> {
        let header = GiopHeader::decode(&frame)?;
        match header.kind {
            MessageKind::Fragment => {
                let request_id = read_request_id(&frame, header.little_endian)?;
                let mut entry = self
                    .pending
                    .remove(&request_id)
                    .ok_or(GiopError::UnknownFragment(request_id))?;
                let payload = &frame[FRAGMENT_HEADER_SIZE..];
                if entry.buf.len() + payload.len() > self.max_message_size {
                    return Err(GiopError::MessageTooLarge {
                        size: entry.buf.len() + payload.len(),
                        max: self.max_message_size,
                    });
                }
                entry.buf.extend_from_slice(payload);
                if header.more_fragments {
                    self.pending.insert(request_id, entry);
                    Ok(None)
                } else {
                    Ok(Some(entry.finish()))
                }
            }
            _ if header.more_fragments => {
                if !carries_request_id(header.kind) {
                    return Err(GiopError::UnexpectedFragment);
                }
                let request_id = read_request_id(&frame, header.little_endian)?;
                if self.pending.contains_key(&request_id) {
                    return Err(GiopError::DuplicateFragment(request_id));
                }
                self.pending.insert(
                    request_id,
                    PendingMessage {
                        little_endian: header.little_endian,
                        buf: BytesMut::from(&frame[..]),
                    },
                );
                Ok(None)
            }
            _ => Ok(Some(frame)),
        }
    }

    /// Discard a partially received message, as when a CancelRequest
    /// arrives mid-train. Returns whether anything was pending.
    pub fn cancel(&mut self, request_id: u32) -> bool {
        self.pending.remove(&request_id).is_some()
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}
