//! Fixed-size frame reassembly over a raw byte stream

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Minimum read size; a single socket read never asks for less than this
const READ_CHUNK: usize = 64 * 1024;

/// Reads exactly `frame_size` bytes at a time from an async stream
///
/// Bytes are accumulated until at least one whole frame is buffered. The
/// remainder after each frame stays buffered for the next call. At EOF any
/// partial frame is discarded.
pub struct FrameReader<R> {
    reader: R,
    frame_size: usize,
    buffer: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader yielding frames of `frame_size` bytes
    ///
    /// # Panics
    ///
    /// Panics if `frame_size` is zero.
    pub fn new(reader: R, frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame size must be non-zero");
        Self {
            reader,
            frame_size,
            buffer: BytesMut::with_capacity(frame_size.max(READ_CHUNK)),
            eof: false,
        }
    }

    /// Frame size in bytes
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Bytes currently buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next whole frame, or `None` once the stream has ended
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if self.buffer.len() >= self.frame_size {
                return Ok(Some(self.buffer.split_to(self.frame_size).freeze()));
            }
            if self.eof {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        discarded = self.buffer.len(),
                        frame_size = self.frame_size,
                        "Stream ended with a partial frame"
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }

            let want = (self.frame_size - self.buffer.len()).max(READ_CHUNK);
            self.buffer.reserve(want);
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}
