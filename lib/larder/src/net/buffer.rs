use crate::net::shared::{DATA_BUFFER_SIZE, READ_BUFFER_HIGHWAT};
use std::io;

/// The per-connection read buffer: a byte queue that is appended at the
/// tail by socket reads and consumed from the head by the parser. Grows by
/// doubling when full and shrinks back to its baseline between requests
/// once it passes the high-watermark.
pub struct Buffer {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    baseline: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Buffer {
        Buffer {
            buf: vec![0; size],
            head: 0,
            tail: 0,
            baseline: size,
        }
    }

    /// Unconsumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Slice of unconsumed data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    /// Advances the head past `count` consumed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Appends bytes directly, growing as needed. Used by the UDP read
    /// path (the datagram was already received into a stack buffer) and by
    /// tests.
    pub fn push(&mut self, data: &[u8]) {
        self.compact();
        while self.buf.len() - self.tail < data.len() {
            let grown = self.buf.len() * 2;
            self.buf.resize(grown, 0);
        }
        self.buf[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
    }

    /// Reads from `reader` until it would block, growing the buffer by
    /// doubling whenever it fills. Returns the number of bytes taken in;
    /// a clean peer close surfaces as `UnexpectedEof`.
    pub fn fill<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.compact();

        let mut total = 0;
        loop {
            if self.tail == self.buf.len() {
                let grown = self.buf.len() * 2;
                self.buf.resize(grown, 0);
            }
            let avail = self.buf.len() - self.tail;
            match reader.read(&mut self.buf[self.tail..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.tail += n;
                    total += n;
                    if n < avail {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Shrinks an oversized buffer back to baseline. Only safe between
    /// requests; pending data below the baseline is preserved.
    pub fn shrink(&mut self) {
        if self.buf.len() > READ_BUFFER_HIGHWAT && self.len() < DATA_BUFFER_SIZE {
            self.compact();
            self.buf.truncate(self.baseline.max(self.tail));
            self.buf.shrink_to_fit();
        }
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.buf.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader that hands out its data in fixed-size chunks and then
    /// reports WouldBlock, like a non-blocking socket.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    #[test]
    fn test_fill_reads_until_would_block() {
        let payload: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 333);
        let mut buffer = Buffer::new(DATA_BUFFER_SIZE);

        let got = buffer.fill(&mut channel).unwrap();
        assert_eq!(got, payload.len());
        assert_eq!(buffer.data(), &payload[..]);
    }

    #[test]
    fn test_fill_grows_by_doubling() {
        let payload = vec![7u8; DATA_BUFFER_SIZE * 3];
        let mut channel = MockChannel::new(payload.clone(), 4096);
        let mut buffer = Buffer::new(DATA_BUFFER_SIZE);

        buffer.fill(&mut channel).unwrap();
        assert_eq!(buffer.len(), payload.len());
        assert!(buffer.capacity() >= payload.len());
        assert_eq!(buffer.data(), &payload[..]);
    }

    #[test]
    fn test_fill_reports_peer_close() {
        let mut eof = io::empty();
        let mut buffer = Buffer::new(DATA_BUFFER_SIZE);

        let err = buffer.fill(&mut eof).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_consume_and_compact() {
        let mut buffer = Buffer::new(DATA_BUFFER_SIZE);
        buffer.push(b"get foo\r\nget bar\r\n");

        buffer.consume(9);
        assert_eq!(buffer.data(), b"get bar\r\n");

        // A refill after partial consumption keeps the pending fragment.
        let mut channel = MockChannel::new(b"get baz\r\n".to_vec(), 4);
        buffer.fill(&mut channel).unwrap();
        assert_eq!(buffer.data(), b"get bar\r\nget baz\r\n");

        buffer.consume(buffer.len());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_shrink_back_to_baseline() {
        let mut buffer = Buffer::new(DATA_BUFFER_SIZE);
        let big = vec![1u8; READ_BUFFER_HIGHWAT * 2];
        buffer.push(&big);
        assert!(buffer.capacity() > READ_BUFFER_HIGHWAT);

        // Still holding data above the watermark: no shrink.
        buffer.consume(big.len() - DATA_BUFFER_SIZE);
        buffer.shrink();
        assert!(buffer.capacity() > READ_BUFFER_HIGHWAT);

        // Below the pending-data threshold it snaps back and keeps the
        // leftover bytes.
        buffer.consume(DATA_BUFFER_SIZE - 10);
        buffer.shrink();
        assert_eq!(buffer.capacity(), DATA_BUFFER_SIZE);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.data(), &big[..10]);
    }
}
