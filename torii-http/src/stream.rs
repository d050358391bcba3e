use crate::error::HttpError;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};

const READ_CHUNK: usize = 16 * 1024;

/// Buffered reader/writer pair over one bidirectional monoio stream.
///
/// Reads land in a reusable scratch buffer and accumulate in `pending`
/// until a caller consumes them; writes accumulate in `wbuf` until
/// `flush`. End-of-stream is explicit: `fill` latches `eof`, and the
/// line/exact readers surface it as `PrematureClose` (or `None` from
/// `read_head` when the peer closed between messages). A zero-length
/// read is never silently returned to a caller.
pub struct BufStream<S> {
    io: S,
    scratch: Vec<u8>,
    pending: Vec<u8>,
    start: usize,
    wbuf: Vec<u8>,
    eof: bool,
}

impl<S: AsyncReadRent + AsyncWriteRent> BufStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            scratch: vec![0u8; READ_CHUNK],
            pending: Vec::with_capacity(READ_CHUNK),
            start: 0,
            wbuf: Vec::with_capacity(4096),
            eof: false,
        }
    }

    /// Unconsumed buffered bytes.
    #[inline]
    pub fn available(&self) -> &[u8] {
        &self.pending[self.start..]
    }

    /// True when no buffered bytes remain — a pooled connection must be in
    /// this state to be reusable (no dangling body).
    pub fn is_drained(&self) -> bool {
        self.start == self.pending.len()
    }

    #[inline]
    fn consume(&mut self, n: usize) {
        self.start += n;
        debug_assert!(self.start <= self.pending.len());
        // Reclaim the consumed prefix once it dominates the buffer.
        if self.start == self.pending.len() {
            self.pending.clear();
            self.start = 0;
        } else if self.start > READ_CHUNK {
            self.pending.drain(..self.start);
            self.start = 0;
        }
    }

    /// Read once from the underlying stream into the pending buffer.
    /// Returns the number of bytes read; 0 latches EOF.
    async fn fill(&mut self) -> std::io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let buf = std::mem::take(&mut self.scratch);
        let (res, buf) = self.io.read(buf).await;
        self.scratch = buf;
        let n = res?;
        if n == 0 {
            self.eof = true;
        } else {
            self.pending.extend_from_slice(&self.scratch[..n]);
        }
        Ok(n)
    }

    /// Read a full message head, terminated by an empty line (CRLFCRLF).
    /// Returns the head bytes including the terminator. `Ok(None)` means
    /// the peer closed cleanly before sending anything.
    pub async fn read_head(&mut self, max: usize) -> Result<Option<Vec<u8>>, HttpError> {
        loop {
            if let Some(end) = find_head_end(self.available()) {
                if end > max {
                    return Err(HttpError::malformed("message head exceeds limit"));
                }
                let head = self.available()[..end].to_vec();
                self.consume(end);
                return Ok(Some(head));
            }
            if self.available().len() > max {
                return Err(HttpError::malformed("message head exceeds limit"));
            }
            if self.fill().await? == 0 {
                if self.available().is_empty() {
                    return Ok(None);
                }
                return Err(HttpError::PrematureClose);
            }
        }
    }

    /// Read one CRLF-terminated line, returned without the terminator.
    pub async fn read_line(&mut self, max: usize) -> Result<Vec<u8>, HttpError> {
        loop {
            if let Some(pos) = self.available().iter().position(|&b| b == b'\n') {
                if pos > max {
                    return Err(HttpError::malformed("line exceeds limit"));
                }
                if pos == 0 || self.available()[pos - 1] != b'\r' {
                    return Err(HttpError::malformed("line not CRLF-terminated"));
                }
                let line = self.available()[..pos - 1].to_vec();
                self.consume(pos + 1);
                return Ok(line);
            }
            if self.available().len() > max {
                return Err(HttpError::malformed("line exceeds limit"));
            }
            if self.fill().await? == 0 {
                return Err(HttpError::PrematureClose);
            }
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, HttpError> {
        while self.available().len() < n {
            if self.fill().await? == 0 {
                return Err(HttpError::PrematureClose);
            }
        }
        let out = self.available()[..n].to_vec();
        self.consume(n);
        Ok(out)
    }

    /// Read until the peer closes, bounded by `cap`.
    pub async fn read_to_close(&mut self, cap: usize) -> Result<Vec<u8>, HttpError> {
        loop {
            if self.available().len() > cap {
                return Err(HttpError::malformed("close-delimited body exceeds limit"));
            }
            if self.fill().await? == 0 {
                let out = self.available().to_vec();
                let len = out.len();
                self.consume(len);
                return Ok(out);
            }
        }
    }

    // ── write side ───────────────────────────────────────────────

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.wbuf.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.wbuf.extend_from_slice(s.as_bytes());
    }

    /// Flush the accumulated write buffer to the stream.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.wbuf);
        let (res, mut buf) = self.io.write_all(buf).await;
        buf.clear();
        self.wbuf = buf;
        res?;
        Ok(())
    }
}

/// Offset one past the CRLFCRLF terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStream;

    #[monoio::test]
    async fn read_head_finds_terminator() {
        let io = MockStream::reading(b"GET / HTTP/1.1\r\nhost: x\r\n\r\nrest");
        let mut s = BufStream::new(io);
        let head = s.read_head(1024).await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&head[..3], b"GET");
        assert_eq!(s.available(), b"rest");
    }

    #[monoio::test]
    async fn read_head_clean_eof_is_none() {
        let io = MockStream::reading(b"");
        let mut s = BufStream::new(io);
        assert!(s.read_head(1024).await.unwrap().is_none());
    }

    #[monoio::test]
    async fn read_head_mid_message_eof_is_premature() {
        let io = MockStream::reading(b"GET / HTTP/1.1\r\nhost");
        let mut s = BufStream::new(io);
        let err = s.read_head(1024).await.unwrap_err();
        assert!(matches!(err, HttpError::PrematureClose));
    }

    #[monoio::test]
    async fn read_head_enforces_limit() {
        let mut data = b"GET / HTTP/1.1\r\n".to_vec();
        data.extend_from_slice("x-pad: aaaaaaaaaa\r\n".repeat(100).as_bytes());
        data.extend_from_slice(b"\r\n");
        let io = MockStream::reading(&data);
        let mut s = BufStream::new(io);
        let err = s.read_head(64).await.unwrap_err();
        assert!(matches!(err, HttpError::Malformed(_)));
    }

    #[monoio::test]
    async fn read_line_strips_crlf() {
        let io = MockStream::reading(b"5;ext=1\r\nhello\r\n");
        let mut s = BufStream::new(io);
        assert_eq!(s.read_line(128).await.unwrap(), b"5;ext=1");
    }

    #[monoio::test]
    async fn read_line_rejects_bare_lf() {
        let io = MockStream::reading(b"bad\n");
        let mut s = BufStream::new(io);
        assert!(matches!(
            s.read_line(128).await.unwrap_err(),
            HttpError::Malformed(_)
        ));
    }

    #[monoio::test]
    async fn read_exact_across_fills() {
        // one-byte chunks force repeated fills
        let io = MockStream::reading(b"abcdefgh").with_chunk(1);
        let mut s = BufStream::new(io);
        assert_eq!(s.read_exact(8).await.unwrap(), b"abcdefgh");
    }

    #[monoio::test]
    async fn read_exact_eof_is_premature() {
        let io = MockStream::reading(b"abc");
        let mut s = BufStream::new(io);
        assert!(matches!(
            s.read_exact(4).await.unwrap_err(),
            HttpError::PrematureClose
        ));
    }

    #[monoio::test]
    async fn read_to_close_returns_all() {
        let io = MockStream::reading(b"tail bytes").with_chunk(3);
        let mut s = BufStream::new(io);
        assert_eq!(s.read_to_close(1024).await.unwrap(), b"tail bytes");
        assert!(s.is_drained());
    }

    #[monoio::test]
    async fn write_accumulates_until_flush() {
        let io = MockStream::reading(b"");
        let mut s = BufStream::new(io);
        s.write_str("HTTP/1.1 200 OK\r\n");
        s.write_bytes(b"\r\n");
        s.flush().await.unwrap();
        assert_eq!(s.io.written, b"HTTP/1.1 200 OK\r\n\r\n");
    }
}
