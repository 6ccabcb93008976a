//! Bounded line reader for the JSON-line framing.
//!
//! Both the listener and the backend transport read frames through
//! [`FrameReader`], which never buffers more than one frame's worth of bytes.

use std::io;

use mcroute_proto::codec::MAX_FRAME_LEN;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(read: R) -> Self {
        Self::with_limit(read, MAX_FRAME_LEN)
    }

    /// `limit` counts the trailing newline.
    pub(crate) fn with_limit(read: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(read),
            buf: Vec::new(),
            limit,
        }
    }

    /// Next frame with its newline, or `None` at end of stream.
    ///
    /// A frame longer than the limit fails with `InvalidData`; the stream is
    /// left mid-frame and should be closed.
    pub(crate) async fn next_frame(&mut self) -> io::Result<Option<&[u8]>> {
        self.buf.clear();
        let n = (&mut self.reader)
            .take(self.limit as u64)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if n == self.limit && self.buf.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", self.limit),
            ));
        }
        Ok(Some(self.buf.as_slice()))
    }
}
