//! # Sample Conversion
//!
//! Glue between the sample formats audio devices hand us and the PCM16 mono
//! format spoken on the wire.
//!
//! ## Key Functions:
//! - **Format conversion**: device samples (f32/i16/u16) → f32 → PCM16
//! - **Downmixing**: interleaved multi-channel frames → mono
//! - **Resampling**: streaming linear interpolation between device and wire rates
//!
//! Devices rarely run at 16kHz or 24kHz natively, so the capture side
//! resamples device rate → 16kHz and the playback side 24kHz → device rate.

/// Convert 16-bit PCM samples to 32-bit floats in [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| i16_to_f32(sample)).collect()
}

/// Convert floats back to 16-bit PCM, clamping anything out of range.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&sample| f32_to_i16(sample)).collect()
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32_768.0
}

pub fn u16_to_f32(sample: u16) -> f32 {
    (sample as f32 - 32_768.0) / 32_768.0
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32_768.0).clamp(-32_768.0, 32_767.0) as i16
}

/// Average interleaved frames down to mono and append them to `out`.
///
/// ## Parameters:
/// - **channels**: samples per frame; 0 is treated as 1
/// - **convert**: maps one device sample to f32
pub fn append_downmixed<T: Copy>(
    out: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
) {
    let channels = channels.max(1);
    if channels == 1 {
        out.extend(data.iter().map(|&s| convert(s)));
        return;
    }
    for frame in data.chunks_exact(channels) {
        let sum: f32 = frame.iter().map(|&s| convert(s)).sum();
        out.push(sum / channels as f32);
    }
}

/// Streaming linear-interpolation resampler.
///
/// ## Why stateful:
/// Audio arrives in small blocks. Keeping the fractional read position and
/// the last input sample across calls means block boundaries do not click.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    step: f64,
    /// Read position relative to the extended block `[prev, input...]`
    pos: f64,
    prev: f32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            from_rate,
            to_rate,
            step,
            pos: 1.0,
            prev: 0.0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    /// Resample one block, appending the output to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        // Extended block: index 0 is the last sample of the previous call.
        let len = input.len() as f64;
        let sample_at = |i: usize| if i == 0 { self.prev } else { input[i - 1] };

        while self.pos <= len {
            let base = self.pos.floor() as usize;
            let frac = (self.pos - base as f64) as f32;
            let a = sample_at(base);
            let b = if base < input.len() { sample_at(base + 1) } else { a };
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= len;
        self.prev = input[input.len() - 1];
    }

    pub fn reset(&mut self) {
        self.pos = 1.0;
        self.prev = 0.0;
    }
}
