//! Fixed-capacity input accumulator
//!
//! Bytes read from the socket are appended here until the protocol engine
//! has consumed them. The accumulator never grows past its capacity: writes
//! that do not fit are truncated and the caller is told how much was taken.

/// Fixed-capacity byte buffer with a "used" cursor.
///
/// Owned by the event-loop thread; it is not shared and not thread-safe.
#[derive(Debug)]
pub struct ByteAccumulator {
    data: Box<[u8]>,
    used: usize,
}

impl ByteAccumulator {
    /// Create an accumulator holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// Append as many bytes of `input` as fit, returning how many were taken.
    ///
    /// Returns 0 when the buffer is already full.
    pub fn write(&mut self, input: &[u8]) -> usize {
        let count = input.len().min(self.remaining());
        if count == 0 {
            return 0;
        }
        self.data[self.used..self.used + count].copy_from_slice(&input[..count]);
        self.used += count;
        count
    }

    /// Mark the whole buffer free
    pub fn drain(&mut self) {
        self.used = 0;
    }

    /// Discard a consumed prefix of `count` bytes and move the rest to the front.
    ///
    /// # Panics
    ///
    /// Panics if `count >= available()`; a fully consumed buffer must be
    /// released with [`drain`](Self::drain).
    pub fn shift(&mut self, count: usize) {
        assert!(
            count < self.used,
            "shift of {count} bytes requires fewer than {} buffered bytes",
            self.used
        );
        self.data.copy_within(count..self.used, 0);
        self.used -= count;
    }

    /// Number of buffered bytes
    pub fn available(&self) -> usize {
        self.used
    }

    /// Buffered bytes, oldest first
    pub fn data(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_write_appends_in_order() {
        let mut acc = ByteAccumulator::new(16);
        assert_eq!(acc.write(b"abc"), 3);
        assert_eq!(acc.write(b"def"), 3);
        assert_eq!(acc.data(), b"abcdef");
        assert_eq!(acc.available(), 6);
        assert_eq!(acc.remaining(), 10);
    }

    #[test]
    fn test_write_truncates_at_capacity() {
        let mut acc = ByteAccumulator::new(4);
        assert_eq!(acc.write(b"abcdef"), 4);
        assert!(acc.is_full());
        assert_eq!(acc.data(), b"abcd");
        assert_eq!(acc.write(b"x"), 0);
        assert_eq!(acc.data(), b"abcd");
    }

    #[test]
    fn test_write_exactly_remaining_capacity() {
        // Filling the last free bytes must be accepted whole
        let mut acc = ByteAccumulator::new(6);
        acc.write(b"abc");
        assert_eq!(acc.write(b"def"), 3);
        assert_eq!(acc.data(), b"abcdef");
    }

    #[test]
    fn test_drain_resets() {
        let mut acc = ByteAccumulator::new(8);
        acc.write(b"hello");
        acc.drain();
        assert_eq!(acc.available(), 0);
        assert!(acc.is_empty());
        assert_eq!(acc.remaining(), 8);
    }

    #[test]
    fn test_shift_compacts_remainder() {
        let mut acc = ByteAccumulator::new(8);
        acc.write(b"abcdef");
        acc.shift(2);
        assert_eq!(acc.data(), b"cdef");
        acc.write(b"gh");
        assert_eq!(acc.data(), b"cdefgh");
    }

    #[test]
    #[should_panic]
    fn test_shift_entire_buffer_panics() {
        let mut acc = ByteAccumulator::new(8);
        acc.write(b"abc");
        acc.shift(3);
    }

    #[test]
    fn test_zero_capacity() {
        let mut acc = ByteAccumulator::new(0);
        assert_eq!(acc.write(b"abc"), 0);
        assert!(acc.is_full());
        assert!(acc.is_empty());
    }

    proptest! {
        #[test]
        fn prop_writes_within_capacity_concatenate(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..16)
        ) {
            let capacity = 512;
            let mut acc = ByteAccumulator::new(capacity);
            let mut expected = Vec::new();
            for chunk in &chunks {
                let written = acc.write(chunk);
                prop_assert_eq!(written, chunk.len());
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(acc.available(), expected.len());
            prop_assert_eq!(acc.data(), expected.as_slice());
        }

        #[test]
        fn prop_used_never_exceeds_capacity(
            capacity in 0usize..64,
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..10)
        ) {
            let mut acc = ByteAccumulator::new(capacity);
            let mut expected = Vec::new();
            for chunk in &chunks {
                let written = acc.write(chunk);
                expected.extend_from_slice(&chunk[..written]);
                prop_assert!(acc.available() <= capacity);
            }
            prop_assert_eq!(acc.data(), expected.as_slice());
        }

        #[test]
        fn prop_shift_then_write_forgets_prefix(
            old in prop::collection::vec(any::<u8>(), 1..64),
            new in prop::collection::vec(any::<u8>(), 0..64),
            cut in any::<prop::sample::Index>()
        ) {
            let mut acc = ByteAccumulator::new(128);
            acc.write(&old);
            let n = cut.index(old.len());
            if n > 0 {
                acc.shift(n);
            }
            acc.write(&new);

            let mut expected = old[n..].to_vec();
            expected.extend_from_slice(&new);
            prop_assert_eq!(acc.data(), expected.as_slice());
        }

        #[test]
        fn prop_drain_always_empties(
            content in prop::collection::vec(any::<u8>(), 0..64)
        ) {
            let mut acc = ByteAccumulator::new(64);
            acc.write(&content);
            acc.drain();
            prop_assert_eq!(acc.available(), 0);
        }
    }
}
