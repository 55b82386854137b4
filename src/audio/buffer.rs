//! # Chunk Buffer
//!
//! Collects PCM bytes as they come off the audio device and hands them out in
//! fixed-size chunks. The device callback delivers whatever period size the
//! hardware picked; the uplink wants every chunk to be exactly the configured
//! size (1024 bytes by default) so end-to-end latency stays bounded.
//!
//! ## Key Features:
//! - **Fixed output size**: `next_chunk` never returns a partial chunk
//! - **Order preserving**: bytes come out in exactly the order they went in
//! - **Sample aligned**: the chunk size must be even, so a chunk never splits a sample

use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::VecDeque;

/// FIFO of PCM bytes emitted in fixed-size chunks.
///
/// ## Rust Concepts:
/// - **VecDeque<u8>**: cheap appends at the back and drains from the front
///
/// Not thread-safe on its own; it lives inside a single microphone reader.
#[derive(Debug)]
pub struct ChunkBuffer {
    pending: VecDeque<u8>,
    chunk_bytes: usize,
}

impl ChunkBuffer {
    /// ## Panics:
    /// Never; a zero or odd size is rounded up to the next even number.
    pub fn new(chunk_bytes: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(2);
        let chunk_bytes = chunk_bytes + chunk_bytes % 2;
        Self {
            pending: VecDeque::with_capacity(chunk_bytes * 4),
            chunk_bytes,
        }
    }

    /// Append raw little-endian PCM bytes.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.pending.extend(data.iter().copied());
    }

    /// Append samples, encoding them as PCM16 little-endian.
    pub fn push_samples(&mut self, samples: &[i16]) {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            // writing into a Vec cannot fail
            let _ = bytes.write_i16::<LittleEndian>(sample);
        }
        self.push_bytes(&bytes);
    }

    /// Copy the next full chunk into `out`.
    ///
    /// ## Returns:
    /// - **Some(n)**: `n` bytes were written, `n = min(chunk size, out.len())`
    /// - **None**: fewer than a full chunk is pending
    pub fn next_chunk(&mut self, out: &mut [u8]) -> Option<usize> {
        if self.pending.len() < self.chunk_bytes {
            return None;
        }
        let n = self.chunk_bytes.min(out.len());
        for (slot, byte) in out.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Some(n)
    }

}

#[cfg(test)]
impl ChunkBuffer {
    fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Number of bytes waiting for a full chunk.
    fn len(&self) -> usize {
        self.pending.len()
    }
}
