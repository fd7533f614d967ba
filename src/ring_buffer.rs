//! Fixed-capacity byte FIFO used to reassemble frames split across reads.

/// Power-of-two ring of bytes.
///
/// The read and write positions are free-running counters; their difference is the fill
/// level and masking with `capacity - 1` gives the slot. Wrapping arithmetic keeps this
/// correct across counter overflow.
pub struct RingBuffer {
    buf: Box<[u8]>,
    mask: usize,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring buffer capacity must be a power of two, got {capacity}"
        );
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            mask: capacity - 1,
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Appends as much of `data` as fits and returns how many bytes were taken.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let start = self.tail & self.mask;
        let first = n.min(self.capacity() - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.tail = self.tail.wrapping_add(n);
        n
    }

    /// Copies up to `out.len()` bytes from the front without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        let start = self.head & self.mask;
        let first = n.min(self.capacity() - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        n
    }

    /// Copies up to `out.len()` bytes from the front and consumes them.
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.head = self.head.wrapping_add(n);
        n
    }

    /// Discards up to `n` bytes from the front.
    pub fn pop(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.head = self.head.wrapping_add(n);
        n
    }

    pub fn clear(&mut self) {
        self.head = self.tail;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_across_wraparound() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.put(b"abcdef"), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.get(&mut out), 4);
        assert_eq!(&out, b"abcd");

        // "ef" sits at 4..6, the new bytes wrap past the end
        assert_eq!(ring.put(b"ghijkl"), 6);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.free(), 0);

        let mut all = [0u8; 8];
        assert_eq!(ring.get(&mut all), 8);
        assert_eq!(&all, b"efghijkl");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_put_is_limited_by_free_space() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.put(b"abcdef"), 4);
        assert_eq!(ring.put(b"x"), 0);
        let mut out = [0u8; 4];
        ring.peek(&mut out);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut ring = RingBuffer::new(16);
        ring.put(b"0005hello");
        let mut prefix = [0u8; 4];
        assert_eq!(ring.peek(&mut prefix), 4);
        assert_eq!(ring.peek(&mut prefix), 4);
        assert_eq!(&prefix, b"0005");
        assert_eq!(ring.len(), 9);

        assert_eq!(ring.pop(4), 4);
        let mut payload = [0u8; 16];
        let n = ring.get(&mut payload);
        assert_eq!(&payload[..n], b"hello");
    }

    #[test]
    fn test_short_reads() {
        let mut ring = RingBuffer::new(8);
        ring.put(b"ab");
        let mut out = [0u8; 8];
        assert_eq!(ring.get(&mut out), 2);
        assert_eq!(ring.get(&mut out), 0);
        assert_eq!(ring.pop(3), 0);
    }

    #[test]
    fn test_counters_survive_many_cycles() {
        let mut ring = RingBuffer::new(4);
        let mut out = [0u8; 3];
        for i in 0..10_000u32 {
            let bytes = [i as u8, (i >> 8) as u8, (i >> 16) as u8];
            assert_eq!(ring.put(&bytes), 3);
            assert_eq!(ring.get(&mut out), 3);
            assert_eq!(out, bytes);
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        let _ = RingBuffer::new(12);
    }
}
