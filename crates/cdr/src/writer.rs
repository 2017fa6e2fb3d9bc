//! CDR output stream
//!
//! A `CdrWriter` produces the aligned binary form of a GIOP message. Stream
//! position 0 is the first octet of the message (the GIOP header included),
//! because CDR alignment is computed from the start of the message, not from
//! the start of the value being written. Encapsulations restart the position
//! at their own first octet.

use bytes::{BufMut, Bytes, BytesMut};

/// CDR output stream with explicit byte order and position tracking.
///
/// Every multi-byte primitive aligns itself to its natural boundary before
/// writing, so callers never pad by hand.
#[derive(Debug)]
pub struct CdrWriter {
    buf: BytesMut,
    little_endian: bool,
}

impl CdrWriter {
    /// Create a writer for a top-level message stream.
    pub fn new(little_endian: bool) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            little_endian,
        }
    }

    /// Create a writer for an encapsulation. The endian flag octet is
    /// written at position 0 as required for encapsulated CDR data.
    pub fn encapsulation(little_endian: bool) -> Self {
        let mut w = Self::new(little_endian);
        w.write_octet(u8::from(little_endian));
        w
    }

    /// Byte order of this stream.
    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    /// Current stream position (octets written so far).
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Pad with zero octets up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(matches!(alignment, 1 | 2 | 4 | 8));
        let rem = self.buf.len() % alignment;
        if rem != 0 {
            self.buf.put_bytes(0, alignment - rem);
        }
    }

    pub fn write_octet(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.align(2);
        if self.little_endian {
            self.buf.put_u16_le(value);
        } else {
            self.buf.put_u16(value);
        }
    }

    pub fn write_i16(&mut self, value: i16) {
        self.align(2);
        if self.little_endian {
            self.buf.put_i16_le(value);
        } else {
            self.buf.put_i16(value);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.align(4);
        if self.little_endian {
            self.buf.put_u32_le(value);
        } else {
            self.buf.put_u32(value);
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.align(4);
        if self.little_endian {
            self.buf.put_i32_le(value);
        } else {
            self.buf.put_i32(value);
        }
    }

    pub fn write_u64(&mut self, value: u64) {
        self.align(8);
        if self.little_endian {
            self.buf.put_u64_le(value);
        } else {
            self.buf.put_u64(value);
        }
    }

    pub fn write_i64(&mut self, value: i64) {
        self.align(8);
        if self.little_endian {
            self.buf.put_i64_le(value);
        } else {
            self.buf.put_i64(value);
        }
    }

    pub fn write_f32(&mut self, value: f32) {
        self.align(4);
        if self.little_endian {
            self.buf.put_f32_le(value);
        } else {
            self.buf.put_f32(value);
        }
    }

    pub fn write_f64(&mut self, value: f64) {
        self.align(8);
        if self.little_endian {
            self.buf.put_f64_le(value);
        } else {
            self.buf.put_f64(value);
        }
    }

    /// Write a CDR string: u32 length including the terminating NUL,
    /// then the UTF-8 octets, then the NUL octet.
    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32 + 1);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    /// Write raw octets without alignment or length prefix.
    pub fn write_opaque(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Write an octet sequence: u32 count followed by the octets.
    pub fn write_octet_seq(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    /// Write a completed encapsulation as an octet sequence.
    pub fn write_encapsulation(&mut self, encap: CdrWriter) {
        self.write_octet_seq(&encap.into_bytes());
    }

    /// Overwrite 4 octets at `position` with `value` in this stream's byte
    /// order. Used to patch the message-size field of the GIOP header after
    /// the body is written.
    pub fn patch_u32(&mut self, position: usize, value: u32) {
        let bytes = if self.little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        self.buf[position..position + 4].copy_from_slice(&bytes);
    }

    /// Consume the writer, yielding the encoded octets.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
