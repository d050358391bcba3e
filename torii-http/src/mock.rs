//! In-memory stream double for codec and engine tests.

use monoio::buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut};
use monoio::io::{AsyncReadRent, AsyncWriteRent};
use monoio::BufResult;

/// Scripted bidirectional stream: serves `input` to reads (in `chunk`-sized
/// pieces, then EOF) and records writes into `written`.
pub struct MockStream {
    input: Vec<u8>,
    pos: usize,
    chunk: usize,
    pub written: Vec<u8>,
}

impl MockStream {
    pub fn reading(input: &[u8]) -> Self {
        Self {
            input: input.to_vec(),
            pos: 0,
            chunk: usize::MAX,
            written: Vec::new(),
        }
    }

    /// Cap each read at `chunk` bytes to exercise refill paths.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }
}

impl AsyncReadRent for MockStream {
    async fn read<T: IoBufMut>(&mut self, mut buf: T) -> BufResult<usize, T> {
        let remaining = self.input.len() - self.pos;
        if remaining == 0 {
            return (Ok(0), buf);
        }
        let n = remaining.min(self.chunk).min(buf.bytes_total());
        unsafe {
            std::ptr::copy_nonoverlapping(self.input.as_ptr().add(self.pos), buf.write_ptr(), n);
            buf.set_init(n);
        }
        self.pos += n;
        (Ok(n), buf)
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        (Ok(0), buf)
    }
}

impl AsyncWriteRent for MockStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        let n = buf.bytes_init();
        let slice = unsafe { std::slice::from_raw_parts(buf.read_ptr(), n) };
        self.written.extend_from_slice(slice);
        (Ok(n), buf)
    }

    async fn writev<T: IoVecBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        (Ok(0), buf)
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
