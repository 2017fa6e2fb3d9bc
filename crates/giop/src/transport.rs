//! GIOP transport framing
//!
//! GIOP messages are self-delimiting: the 12-octet header carries the body
//! length, so frames can be cut out of a reliable byte stream without any
//! out-of-band delimiter.

use crate::error::{GiopError, Result};
use crate::message::GiopHeader;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted message size (header + body), 8 MB default
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Reads and writes whole GIOP frames over a byte stream.
pub struct GiopTransport<T> {
    inner: T,
    max_message_size: usize,
    read_buf: BytesMut,
}

impl<T> GiopTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_message_size(mut self, max_size: usize) -> Self {
        self.max_message_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> GiopTransport<T> {
    /// Read one complete GIOP frame (header included).
    ///
    /// Returns `ConnectionClosed` on a clean EOF between frames; EOF in the
    /// middle of a frame is an I/O error.
    pub async fn read_message(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < GiopHeader::SIZE {
            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Err(GiopError::ConnectionClosed);
                }
                return Err(GiopError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete GIOP header",
                )));
            }
        }

        let header = GiopHeader::decode(&self.read_buf)?;
        let frame_length = GiopHeader::SIZE + header.size as usize;
        if frame_length > self.max_message_size {
            return Err(GiopError::MessageTooLarge {
                size: frame_length,
                max: self.max_message_size,
            });
        }

        while self.read_buf.len() < frame_length {
            let n = self.inner.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(GiopError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete GIOP message: expected {} octets, got {}",
                        frame_length,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        Ok(self.read_buf.split_to(frame_length).freeze())
    }
}

impl<T: AsyncWrite + Unpin> GiopTransport<T> {
    /// Write one complete, already encoded frame.
    pub async fn write_message(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
