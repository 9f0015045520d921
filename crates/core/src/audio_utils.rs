//! PCM16 codec and the base64 transport encoding.
//!
//! Capture, transport and playback share a single sample rate; nothing in
//! this crate resamples.

use crate::error::{FormatError, StreamError};
use base64::Engine;
use std::time::Duration;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Audio parameters shared by every stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second, mono.
    pub sample_rate: u32,
    /// Samples per uplink capture frame.
    pub frame_size: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            frame_size,
        }
    }

    /// Number of samples covering `duration` at this rate.
    pub fn samples_for(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as usize
    }

    /// Wall-clock length of one capture frame. Zero when the rate is zero.
    pub fn frame_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }

    /// Rejects formats that cannot drive a session.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.sample_rate == 0 {
            return Err(StreamError::InvalidFormat(
                "sample rate must be non-zero".to_string(),
            ));
        }
        if self.frame_size == 0 {
            return Err(StreamError::InvalidFormat(
                "frame size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Quantizes f32 samples to PCM16.
///
/// Samples are clamped to `[-1, 1]`; the positive half scales by 32767 and
/// the negative half by 32768 so both rails are reachable. NaN maps to 0.
pub fn quantize(frame: &[f32]) -> Vec<i16> {
    frame.iter().map(|&s| quantize_sample(s)).collect()
}

fn quantize_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s >= 0.0 {
        (s * i16::MAX as f32).round() as i16
    } else {
        (s * 32768.0).round() as i16
    }
}

/// Converts PCM16 back to f32 samples in `[-1, 1)`.
pub fn dequantize(block: &[i16]) -> Vec<f32> {
    block.iter().map(|&v| v as f32 / 32768.0).collect()
}

/// Little-endian byte layout of a PCM16 block.
pub fn pcm_to_bytes(block: &[i16]) -> Vec<u8> {
    block.iter().flat_map(|&v| v.to_le_bytes()).collect()
}

/// Parses little-endian PCM16 bytes. A trailing half sample is an error, not truncated.
pub fn pcm_from_bytes(bytes: &[u8]) -> Result<Vec<i16>, FormatError> {
    if bytes.len() % 2 != 0 {
        return Err(FormatError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

pub fn encode_i16(block: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm_to_bytes(block))
}

pub fn decode_i16(base64_fragment: &str) -> Result<Vec<i16>, FormatError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    pcm_from_bytes(&bytes)
}

/// Quantizes f32 samples and wraps them in base64, ready for the wire.
pub fn encode_f32_to_base64_i16(frame: &[f32]) -> String {
    encode_i16(&quantize(frame))
}

/// Unwraps a base64 PCM16 payload into f32 samples.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Result<Vec<f32>, FormatError> {
    decode_i16(base64_fragment).map(|block| dequantize(&block))
}

/// Root mean square level of a frame, 0.0 for an empty frame.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

/// Generates a mono sine tone.
pub fn sine_tone(frequency: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let count = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
    let step = 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
    (0..count)
        .map(|i| amplitude * (step * i as f32).sin())
        .collect()
}
