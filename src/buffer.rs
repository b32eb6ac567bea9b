//! Growable byte region backing each direction of a connection.

use std::fmt;

/// A contiguous, growable byte region with independent written and consumed
/// cursors.
///
/// One instance backs each direction of a [`Connection`]: received bytes are
/// appended at the written cursor and handed to the data callback, while
/// outgoing bytes queued by a partial send are drained through the consumed
/// cursor without any data movement.
///
/// Invariant: `consumed <= written <= capacity`.
///
/// [`Connection`]: crate::Connection
#[derive(Default)]
pub struct IoBuffer {
    storage: Vec<u8>,
    written: usize,
    consumed: usize,
}

impl IoBuffer {
    /// Creates a buffer with the given starting capacity.
    pub fn with_capacity(capacity: usize) -> IoBuffer {
        IoBuffer {
            storage: vec![0; capacity],
            written: 0,
            consumed: 0,
        }
    }

    /// Total capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes written but not yet consumed.
    pub fn unconsumed(&self) -> usize {
        self.written - self.consumed
    }

    /// Free space between the written cursor and the end of storage.
    pub fn writable(&self) -> usize {
        self.storage.len() - self.written
    }

    /// Appends `data` after the written cursor, doubling the capacity until
    /// the tail fits. No-op for an empty slice.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        self.ensure_writable(data.len());
        self.storage[self.written..self.written + data.len()].copy_from_slice(data);
        self.written += data.len();
    }

    /// Moves the consumed cursor forward by `n`.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`unconsumed`](IoBuffer::unconsumed).
    pub fn advance_consumed(&mut self, n: usize) {
        assert!(n <= self.unconsumed());
        self.consumed += n;
    }

    /// Resets both cursors without shrinking the backing storage.
    pub fn clear(&mut self) {
        self.written = 0;
        self.consumed = 0;
    }

    /// The written-but-unconsumed region.
    pub fn unconsumed_bytes(&self) -> &[u8] {
        &self.storage[self.consumed..self.written]
    }

    /// Grows the backing storage until at least `additional` bytes fit after
    /// the written cursor.
    pub fn ensure_writable(&mut self, additional: usize) {
        let required = self.written + additional;
        if required <= self.storage.len() {
            return;
        }

        let mut capacity = self.storage.len().max(1);
        while capacity < required {
            capacity *= 2;
        }
        self.storage.resize(capacity, 0);
    }

    /// The free region after the written cursor.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        let written = self.written;
        &mut self.storage[written..]
    }

    /// Records `n` bytes produced directly into the spare region by an I/O
    /// call.
    pub(crate) fn advance_written(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.storage.len());
        self.written += n;
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.storage.len())
            .field("written", &self.written)
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::IoBuffer;

    #[test]
    fn fresh_buffer_is_empty() {
        let buf = IoBuffer::with_capacity(64);
        assert_eq!(buf.unconsumed(), 0);
        assert_eq!(buf.writable(), 64);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn append_then_consume() {
        let mut buf = IoBuffer::with_capacity(16);
        buf.append(b"hello world");
        assert_eq!(buf.unconsumed(), 11);
        assert_eq!(buf.unconsumed_bytes(), b"hello world");

        buf.advance_consumed(6);
        assert_eq!(buf.unconsumed(), 5);
        assert_eq!(buf.unconsumed_bytes(), b"world");

        buf.advance_consumed(5);
        assert_eq!(buf.unconsumed(), 0);
    }

    #[test]
    fn append_grows_by_doubling() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.append(&[42u8; 100]);
        assert_eq!(buf.unconsumed(), 100);
        // 8 -> 16 -> 32 -> 64 -> 128
        assert_eq!(buf.capacity(), 128);
        assert!(buf.unconsumed_bytes().iter().all(|&b| b == 42));
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.append(&[]);
        assert_eq!(buf.unconsumed(), 0);
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = IoBuffer::with_capacity(4);
        buf.append(&[1, 2, 3, 4, 5, 6]);
        buf.clear();
        assert_eq!(buf.unconsumed(), 0);
        assert_eq!(buf.writable(), buf.capacity());
        assert!(buf.capacity() >= 6);
    }

    #[test]
    fn appends_interleave_with_consumption() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.append(b"abc");
        buf.advance_consumed(2);
        buf.append(b"def");
        assert_eq!(buf.unconsumed_bytes(), b"cdef");
    }

    #[test]
    fn io_writes_land_in_spare_region() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.spare_mut()[..3].copy_from_slice(b"xyz");
        buf.advance_written(3);
        assert_eq!(buf.unconsumed_bytes(), b"xyz");
    }

    #[test]
    #[should_panic]
    fn over_consuming_panics() {
        let mut buf = IoBuffer::with_capacity(8);
        buf.append(b"ab");
        buf.advance_consumed(3);
    }
}
