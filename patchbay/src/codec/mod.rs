//! Length-prefixed JSON framing.
//!
//! Every message on the wire is a 4-byte big-endian unsigned length `N`
//! followed by `N` bytes of UTF-8 JSON encoding a single object. EOF between
//! frames is a clean end-of-stream; EOF inside a frame is an error. A
//! zero-length frame is invalid, and frames above a configurable limit
//! (16 MiB by default) are rejected.

use std::fmt;

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) const HEADER_SIZE: usize = 4;

/// Default maximum frame body size.
pub const DEFAULT_FRAME_LIMIT: usize = 16 * 1024 * 1024;

/// Errors produced by the frame layer.
///
/// All of these are fatal for the connection that produced them.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    /// EOF arrived inside a header or body.
    #[error("stream ended mid-frame")]
    TruncatedFrame,
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    Oversize { len: usize, limit: usize },
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame parsed, but the top-level value is not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// The reading half of a framed channel.
#[derive(Debug)]
pub struct FramedRead<R> {
    io: R,
    limit: usize,
}

impl<R> FramedRead<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(io: R) -> Self {
        Self::with_limit(io, DEFAULT_FRAME_LIMIT)
    }

    pub fn with_limit(io: R, limit: usize) -> Self {
        FramedRead { io, limit }
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream, which is only legal on a
    /// frame boundary.
    pub async fn read(&mut self) -> Result<Option<Value>, CodecError> {
        let mut header = [0u8; HEADER_SIZE];
        let mut have = 0;
        while have < HEADER_SIZE {
            let n = self.io.read(&mut header[have..]).await?;
            if n == 0 {
                return if have == 0 {
                    Ok(None)
                } else {
                    Err(CodecError::TruncatedFrame)
                };
            }
            have += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(CodecError::EmptyFrame);
        }
        if len > self.limit {
            return Err(CodecError::Oversize {
                len,
                limit: self.limit,
            });
        }

        let mut body = BytesMut::zeroed(len);
        self.io.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                CodecError::TruncatedFrame
            } else {
                CodecError::Io(e)
            }
        })?;

        let value: Value = serde_json::from_slice(&body)?;
        if !value.is_object() {
            return Err(CodecError::NotAnObject);
        }
        trace!(len, "frame read");
        Ok(Some(value))
    }
}

/// A type-erased reading half, for callers that do not care about the
/// concrete transport.
pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

/// A type-erased writing half.
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

impl<R> FramedRead<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub fn boxed(self) -> FramedRead<BoxRead> {
        FramedRead {
            io: Box::new(self.io),
            limit: self.limit,
        }
    }
}

/// The writing half of a framed channel.
#[derive(Debug)]
pub struct FramedWrite<W> {
    io: W,
    limit: usize,
    buf: BytesMut,
}

impl<W> FramedWrite<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(io: W) -> Self {
        Self::with_limit(io, DEFAULT_FRAME_LIMIT)
    }

    pub fn with_limit(io: W, limit: usize) -> Self {
        FramedWrite {
            io,
            limit,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Frame and write one JSON object, then flush.
    pub async fn write(&mut self, msg: &Value) -> Result<(), CodecError> {
        if !msg.is_object() {
            return Err(CodecError::NotAnObject);
        }

        self.buf.clear();
        self.buf.put_u32(0);
        serde_json::to_writer((&mut self.buf).writer(), msg)?;

        // now that we know length, we can fill in the header
        let len = self.buf.len() - HEADER_SIZE;
        if len > self.limit {
            return Err(CodecError::Oversize {
                len,
                limit: self.limit,
            });
        }
        self.buf[..HEADER_SIZE].copy_from_slice(&(len as u32).to_be_bytes());

        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        trace!(len, "frame written");
        Ok(())
    }

    /// Shut down the underlying stream.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

impl<W> FramedWrite<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn boxed(self) -> FramedWrite<BoxWrite> {
        FramedWrite {
            io: Box::new(self.io),
            limit: self.limit,
            buf: self.buf,
        }
    }
}

/// A bidirectional framed channel: `read()` / `write(msg)` / `close()`.
pub struct Channel<T> {
    read: FramedRead<io::ReadHalf<T>>,
    write: FramedWrite<io::WriteHalf<T>>,
}

impl<T> Channel<T>
where
    T: AsyncRead + AsyncWrite,
{
    pub fn new(io: T) -> Self {
        Self::with_limit(io, DEFAULT_FRAME_LIMIT)
    }

    pub fn with_limit(io: T, limit: usize) -> Self {
        let (r, w) = io::split(io);
        Channel {
            read: FramedRead::with_limit(r, limit),
            write: FramedWrite::with_limit(w, limit),
        }
    }

    pub async fn read(&mut self) -> Result<Option<Value>, CodecError> {
        self.read.read().await
    }

    pub async fn write(&mut self, msg: &Value) -> Result<(), CodecError> {
        self.write.write(msg).await
    }

    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.write.close().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (FramedRead<io::ReadHalf<T>>, FramedWrite<io::WriteHalf<T>>) {
        (self.read, self.write)
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish()
    }
}
