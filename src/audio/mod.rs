//! # Audio Module
//!
//! Capture, playback and turn arbitration for the voice session.
//!
//! ## Key Components:
//! - **capture**: cancellable microphone pipeline producing fixed-size PCM chunks
//! - **playback**: gapless queue of WAV-framed chunks with instant interruption
//! - **session**: the coordinator that decides which of the two is live
//! - **buffer / processor / wav**: byte- and sample-level helpers shared by the pipelines
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono (1 channel)
//! - **Sample Rate**: 16kHz outbound, 24kHz inbound; the two are independent

use std::sync::Arc;

pub mod buffer;      // Fixed-size chunking of a byte stream
pub mod capture;     // Microphone pipeline
pub mod playback;    // Player pipeline
pub mod processor;   // Sample format conversion and resampling
pub mod session;     // Duplex session coordinator
pub mod wav;         // 44-byte WAV framing

#[cfg(test)]
pub(crate) mod testing;

/// An immutable run of PCM16 mono samples at a known sample rate.
///
/// ## Rust Concepts:
/// - **Arc<[u8]>**: the bytes are shared, so cloning a chunk for every
///   broadcast subscriber costs a reference-count bump, not a copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    data: Arc<[u8]>,
    sample_rate: u32,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback length in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.data.len() as u64 / 2) * 1000 / self.sample_rate as u64
    }
}
