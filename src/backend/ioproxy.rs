//! Stream framing for log output.
//!
//! Log bytes are forwarded to the caller's sink wrapped in docker-style
//! multiplexing frames: an 8-byte header carrying the stream kind and the
//! big-endian payload length, followed by the payload verbatim. The wire
//! layer relays these frames to clients that demultiplex stdout/stderr.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Which process stream a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Standard output.
    Stdout = 1,
    /// Standard error.
    Stderr = 2,
}

/// Writer that frames every chunk for one stream kind.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    stream: StreamType,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a sink, tagging all frames with the given stream kind.
    pub fn new(inner: W, stream: StreamType) -> Self {
        FrameWriter { inner, stream }
    }

    /// Write one frame: header, then the payload verbatim.
    ///
    /// Returns the number of payload bytes accepted; an empty payload is
    /// accepted as zero without touching the sink.
    pub async fn write_frame(&mut self, payload: &[u8]) -> std::io::Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.stream as u8;
        header[4..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.inner.write_all(&header).await?;
        self.inner.write_all(payload).await?;
        Ok(payload.len())
    }

    /// Flush the underlying sink.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    /// Unwrap the sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}
