//! Per-connection buffers.
//!
//! Each connection owns one `ReadBuffer` and one `WriteBuffer`. Neither is
//! shared: only the continuation currently driving the connection touches
//! them, so no pooling or synchronization is needed.
//!
//! ## Read side
//!
//! `ReadBuffer` is a fixed-capacity region filled by non-blocking reads and
//! handed to the request handler as a single byte span.
//!
//! ## Write side
//!
//! `WriteBuffer` owns the complete response and a cursor. Responses larger
//! than the read capacity are written across as many partial writes as the
//! socket needs, resuming from the cursor each time.

use bytes::Bytes;

/// Fixed-capacity buffer for a single read operation.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl ReadBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received so far.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// The unfilled tail, where the next read lands.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Mark `n` more bytes of the spare region as filled.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len(), "advance past capacity");
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// The received bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Forget the received bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

/// A response being written, with the number of bytes already sent.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: Bytes,
    written: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the next response. The previous one must be fully written.
    pub fn load(&mut self, data: Bytes) {
        debug_assert!(self.is_done(), "response loaded over an unfinished write");
        self.data = data;
        self.written = 0;
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    /// Record that `n` bytes of `remaining()` were written.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.data.len(), "consume past end");
        self.written = (self.written + n).min(self.data.len());
    }

    pub fn is_done(&self) -> bool {
        self.written == self.data.len()
    }

    #[cfg(test)]
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// Drop the response. Cloned `Bytes` handles keep their data alive.
    pub fn clear(&mut self) {
        self.data = Bytes::new();
        self.written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_buffer_fill() {
        let mut buf = ReadBuffer::with_capacity(8);
        assert_eq!(buf.capacity(), 8);
        assert!(buf.is_empty());

        buf.spare_mut()[..5].copy_from_slice(b"hello");
        buf.advance(5);
        assert_eq!(buf.filled(), b"hello");
        assert_eq!(buf.spare_mut().len(), 3);
        assert!(!buf.is_full());

        buf.spare_mut().copy_from_slice(b"!!!");
        buf.advance(3);
        assert!(buf.is_full());
        assert!(buf.spare_mut().is_empty());

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_write_buffer_partial_writes() {
        let mut buf = WriteBuffer::new();
        assert!(buf.is_done());

        buf.load(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"));
        assert_eq!(buf.total(), 19);
        assert!(!buf.is_done());

        buf.consume(9);
        assert_eq!(buf.remaining(), b"200 OK\r\n\r\n");
        assert_eq!(buf.written(), 9);

        buf.consume(10);
        assert!(buf.is_done());
        assert!(buf.remaining().is_empty());

        buf.clear();
        assert_eq!(buf.total(), 0);
    }

    #[test]
    fn test_write_buffer_empty_response_is_done() {
        let mut buf = WriteBuffer::new();
        buf.load(Bytes::new());
        assert!(buf.is_done());
    }
}
