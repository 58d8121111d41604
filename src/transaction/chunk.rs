//! Fixed-size re-chunking.

use bytes::{Bytes, BytesMut};

/// Re-chunks a byte stream into `size`-byte chunks.
///
/// Every chunk but the last is exactly `size` bytes; [`flush`](Self::flush)
/// yields the short remainder.
#[derive(Debug)]
pub struct ChunkProducer {
    size: usize,
    buffer: BytesMut,
}

impl ChunkProducer {
    /// Create a producer for `size`-byte chunks
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            buffer: BytesMut::with_capacity(size),
        }
    }

    /// Chunk size
    pub fn chunk_size(&self) -> usize {
        self.size
    }

    /// Bytes held back waiting for a full chunk
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consume `data`, returning every chunk it completes
    pub fn push(&mut self, mut data: Bytes) -> Vec<Bytes> {
        let mut chunks = Vec::with_capacity((self.buffer.len() + data.len()) / self.size);

        while !data.is_empty() {
            if self.buffer.is_empty() && data.len() >= self.size {
                chunks.push(data.split_to(self.size));
                continue;
            }

            let take = (self.size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data.split_to(take));
            if self.buffer.len() == self.size {
                chunks.push(self.buffer.split().freeze());
                self.buffer.reserve(self.size);
            }
        }

        chunks
    }

    /// Take the final, possibly short chunk
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }
}
