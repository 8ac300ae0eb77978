//! FIFO of byte chunks awaiting transmission

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Ordered chunks emitted by the protocol engine, written front first.
///
/// A partially written chunk keeps its unwritten tail at the front.
#[derive(Debug, Default)]
pub struct OutputQueue {
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
    high_water: usize,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk at the back. Empty chunks are ignored.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.queued_bytes += chunk.len();
        self.chunks.push_back(chunk);
        self.high_water = self.high_water.max(self.chunks.len());
    }

    /// Unwritten bytes of the front chunk, or an empty slice
    pub fn front(&self) -> &[u8] {
        self.chunks.front().map(|chunk| chunk.as_ref()).unwrap_or(&[])
    }

    /// Record that `written` bytes of the front chunk reached the socket.
    ///
    /// Returns true when the front chunk was fully written and popped.
    pub fn advance(&mut self, written: usize) -> bool {
        let Some(front) = self.chunks.front_mut() else {
            return false;
        };
        let written = written.min(front.len());
        front.advance(written);
        self.queued_bytes -= written;
        if front.is_empty() {
            self.chunks.pop_front();
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Largest number of chunks ever queued at once
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.queued_bytes = 0;
    }
}
