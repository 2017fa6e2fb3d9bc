//! CDR input stream
//!
//! Mirror of [`crate::CdrWriter`]: positions count from the first octet of
//! the message so alignment lands on the same boundaries the writer used.
//! All reads are bounds-checked; a truncated stream surfaces as
//! [`CdrError::BufferUnderflow`](crate::CdrError::BufferUnderflow) instead
//! of a panic.

use crate::error::{CdrError, Result};
use bytes::Bytes;

/// CDR input stream with explicit byte order and position tracking.
#[derive(Debug, Clone)]
pub struct CdrReader {
    buf: Bytes,
    pos: usize,
    little_endian: bool,
}

impl CdrReader {
    /// Create a reader over a complete message stream.
    pub fn new(buf: Bytes, little_endian: bool) -> Self {
        Self {
            buf,
            pos: 0,
            little_endian,
        }
    }

    /// Create a reader over encapsulated octets. The first octet is the
    /// endian flag of the encapsulated stream; positions restart at 0.
    pub fn encapsulation(buf: Bytes) -> Result<Self> {
        let mut r = Self::new(buf, false);
        if r.remaining() == 0 {
            return Err(CdrError::InvalidEncapsulation(
                "empty encapsulation".into(),
            ));
        }
        let flag = r.read_octet()?;
        r.little_endian = (flag & 0x01) != 0;
        Ok(r)
    }

    /// Byte order of this stream.
    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    /// Current stream position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Octets left in the stream.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(CdrError::BufferUnderflow {
                position: self.pos,
                needed,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    /// Skip padding octets up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        debug_assert!(matches!(alignment, 1 | 2 | 4 | 8));
        let rem = self.pos % alignment;
        if rem != 0 {
            let pad = alignment - rem;
            self.check(pad)?;
            self.pos += pad;
        }
        Ok(())
    }

    pub fn read_octet(&mut self) -> Result<u8> {
        self.check(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_octet()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CdrError::InvalidBoolean(other)),
        }
    }

    fn read_array<const N: usize>(&mut self, alignment: usize) -> Result<[u8; N]> {
        self.align(alignment)?;
        self.check(N)?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(raw)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.read_array::<2>(2)?;
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.read_array::<4>(4)?;
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.read_array::<8>(8)?;
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a CDR string. The length prefix includes the terminating NUL.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Err(CdrError::InvalidString(
                "zero-length prefix (must include terminator)".into(),
            ));
        }
        if len > self.remaining() {
            return Err(CdrError::InvalidLength {
                length: len,
                remaining: self.remaining(),
            });
        }
        let bytes = self.read_opaque(len - 1)?.to_vec();
        let terminator = self.read_octet()?;
        if terminator != 0 {
            return Err(CdrError::InvalidString(format!(
                "missing NUL terminator, found {terminator:#04x}"
            )));
        }
        Ok(String::from_utf8(bytes)?)
    }

    /// Read `n` raw octets without alignment.
    pub fn read_opaque(&mut self, n: usize) -> Result<Bytes> {
        self.check(n)?;
        let slice = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    /// Read an octet sequence: u32 count followed by the octets.
    pub fn read_octet_seq(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(CdrError::InvalidLength {
                length: len,
                remaining: self.remaining(),
            });
        }
        self.read_opaque(len)
    }

    /// Read a sequence element count, validating it against the octets that
    /// are actually left (each element takes at least `min_element_size`).
    pub fn read_seq_len(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_size.max(1)) > self.remaining() {
            return Err(CdrError::InvalidLength {
                length: count,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    /// Read an encapsulation: octet sequence whose first octet is the
    /// endian flag of the nested stream. Positions restart at 0.
    pub fn read_encapsulation(&mut self) -> Result<CdrReader> {
        let data = self.read_octet_seq()?;
        Self::encapsulation(data)
    }
}
