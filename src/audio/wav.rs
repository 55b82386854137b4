//! # WAV Framing
//!
//! Prefixes raw PCM16 mono bytes with a canonical 44-byte RIFF/WAVE header so
//! that every chunk becomes an independently playable unit.
//!
//! ## Header Layout (all integers little-endian):
//! ```text
//! 0..4   "RIFF"          4..8   36 + data_len
//! 8..12  "WAVE"          12..16 "fmt "
//! 16..20 16 (fmt size)   20..22 1 (PCM)
//! 22..24 1 (mono)        24..28 sample_rate
//! 28..32 sample_rate*2   32..34 2 (block align)
//! 34..36 16 (bits)       36..40 "data"
//! 40..44 data_len
//! ```
//!
//! The header is a pure function of `(data_len, sample_rate)`.

use byteorder::{ByteOrder, LittleEndian};

pub const WAV_HEADER_LEN: usize = 44;

const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;

/// Build the 44-byte header for `data_len` bytes of PCM16 mono at `sample_rate`.
pub fn wav_header(data_len: u32, sample_rate: u32) -> [u8; WAV_HEADER_LEN] {
    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], data_len.wrapping_add(36));
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], 1);
    LittleEndian::write_u16(&mut header[22..24], CHANNELS);
    LittleEndian::write_u32(&mut header[24..28], sample_rate);
    LittleEndian::write_u32(&mut header[28..32], sample_rate.wrapping_mul(BLOCK_ALIGN as u32));
    LittleEndian::write_u16(&mut header[32..34], BLOCK_ALIGN);
    LittleEndian::write_u16(&mut header[34..36], BITS_PER_SAMPLE);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], data_len);
    header
}

/// Header followed by the PCM payload.
pub fn wrap_pcm(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let mut container = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    container.extend_from_slice(&wav_header(pcm.len() as u32, sample_rate));
    container.extend_from_slice(pcm);
    container
}
