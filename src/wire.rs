//! Length-Prefixed Frame Codec
//!
//! Wire format between the ingester and the processor: a 4-byte unsigned
//! big-endian payload length followed by exactly that many bytes of UTF-8
//! JSON. Frames larger than [`MAX_FRAME`] are rejected before the body is
//! read.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted payload size (1 MiB)
pub const MAX_FRAME: usize = 1024 * 1024;

/// Size of the length prefix
pub const HEADER_SIZE: usize = 4;

/// Errors during frame decode/encode
#[derive(Debug)]
pub enum FrameError {
    /// Stream ended inside the 4-byte length prefix
    ShortHeader,
    /// Stream ended inside the payload
    ShortBody,
    /// Declared length exceeds MAX_FRAME
    LengthTooLarge(usize),
    /// Underlying transport error
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortHeader => write!(f, "stream ended inside frame header"),
            Self::ShortBody => write!(f, "stream ended inside frame body"),
            Self::LengthTooLarge(n) => {
                write!(f, "frame length {} exceeds max {}", n, MAX_FRAME)
            }
            Self::Io(e) => write!(f, "frame io error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Decodes a stream of length-prefixed frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame payload.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. EOF inside a frame
    /// is an error: [`FrameError::ShortHeader`] inside the length prefix,
    /// [`FrameError::ShortBody`] inside the payload.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(FrameError::ShortHeader)
                };
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME {
            return Err(FrameError::LengthTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FrameError::ShortBody
            } else {
                FrameError::Io(e)
            }
        })?;

        Ok(Some(payload))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encodes length-prefixed frames onto an async byte stream.
///
/// Used by the replay tools and tests; the processor itself only decodes.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame: big-endian length, then exactly that many bytes.
    ///
    /// Oversize payloads are rejected before anything touches the stream, so
    /// a failed write never leaves a partial frame behind.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > MAX_FRAME {
            return Err(FrameError::LengthTooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        self.inner.write_all(&buf).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), FrameError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
