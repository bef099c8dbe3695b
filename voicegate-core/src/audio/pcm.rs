//! Sample-level PCM operations.
//!
//! Everything the pipelines need between the wire and the codecs:
//! byte/sample conversion, base64 transport encoding, channel downmix,
//! bit-depth widening, linear-interpolation resampling, and the switch's
//! slin codec naming.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PcmError {
    #[error("not a WAV container: {0}")]
    BadContainer(String),

    #[error("unsupported sample width: {0} bits")]
    UnsupportedWidth(u16),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
}

/// Standard switch rates and their slin codec names, ascending.
const SLIN_RATES: [(u32, &str); 8] = [
    (8_000, "slin"),
    (16_000, "slin16"),
    (24_000, "slin24"),
    (32_000, "slin32"),
    (44_100, "slin44"),
    (48_000, "slin48"),
    (96_000, "slin96"),
    (192_000, "slin192"),
];

/// Codec name for an exactly-matching sample rate.
pub fn codec_for_rate(rate: u32) -> Option<&'static str> {
    SLIN_RATES
        .iter()
        .find(|(r, _)| *r == rate)
        .map(|(_, name)| *name)
}

/// Nearest standard rate at or below `rate`. Rates below 8 kHz clamp up to
/// 8 kHz, since the switch has nothing slower.
pub fn nearest_standard_rate(rate: u32) -> u32 {
    SLIN_RATES
        .iter()
        .rev()
        .map(|(r, _)| *r)
        .find(|r| *r <= rate)
        .unwrap_or(SLIN_RATES[0].0)
}

/// Convert raw little-endian bytes to i16 samples.
///
/// A trailing odd byte is dropped.
pub fn bytes_to_i16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Convert i16 samples to little-endian bytes.
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Encode raw PCM bytes for the textual event stream.
pub fn base64_encode_pcm(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode base64 PCM from the event stream.
pub fn base64_decode_pcm(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}

/// Widen 8-bit samples (already signed, as WAV readers deliver them) to
/// 16-bit by shifting into the high byte.
pub fn widen_8_to_16(samples: &[i8]) -> Vec<i16> {
    samples.iter().map(|&s| (s as i16) << 8).collect()
}

/// Downmix interleaved multi-channel PCM to mono.
///
/// Each output sample is the per-frame channel average, rounded half away
/// from zero and clamped to i16. For stereo that is `round((L + R) / 2)`.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i64 = frame.iter().map(|&s| s as i64).sum();
            let avg = round_div(sum, channels as i64);
            avg.clamp(i16::MIN as i64, i16::MAX as i64) as i16
        })
        .collect()
}

fn round_div(num: i64, den: i64) -> i64 {
    if num >= 0 {
        (num + den / 2) / den
    } else {
        (num - den / 2) / den
    }
}

/// Resample mono 16-bit PCM by linear interpolation.
///
/// `resample_linear(x, r, r) == x`. Output length is
/// `floor(len * to_rate / from_rate)`.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx.min(samples.len() - 1)] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        let v = a + (b - a) * frac;
        out.push(v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let original: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_i16(&i16_to_bytes(&original)), original);
    }

    #[test]
    fn test_base64_roundtrip() {
        let bytes = i16_to_bytes(&[12, -34, 5678]);
        let encoded = base64_encode_pcm(&bytes);
        assert_eq!(base64_decode_pcm(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(codec_for_rate(8_000), Some("slin"));
        assert_eq!(codec_for_rate(16_000), Some("slin16"));
        assert_eq!(codec_for_rate(44_100), Some("slin44"));
        assert_eq!(codec_for_rate(22_050), None);
    }

    #[test]
    fn test_nearest_standard_rate_rounds_down() {
        assert_eq!(nearest_standard_rate(16_000), 16_000);
        assert_eq!(nearest_standard_rate(22_050), 16_000);
        assert_eq!(nearest_standard_rate(44_000), 32_000);
        assert_eq!(nearest_standard_rate(11_025), 8_000);
        assert_eq!(nearest_standard_rate(4_000), 8_000);
    }

    #[test]
    fn test_downmix_linearity() {
        // round((L + R) / 2), clamped
        let stereo = [100i16, 200, -100, -201, i16::MAX, i16::MAX, 1, 2];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono, vec![150, -151, i16::MAX, 2]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let samples = [1i16, 2, 3];
        assert_eq!(downmix_to_mono(&samples, 1), samples.to_vec());
    }

    #[test]
    fn test_resample_identity() {
        let samples: Vec<i16> = (0..480).map(|i| (i % 127) as i16 * 13).collect();
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_resample_halving() {
        let samples: Vec<i16> = (0..320).map(|i| i as i16).collect();
        let out = resample_linear(&samples, 16_000, 8_000);
        assert_eq!(out.len(), 160);
        // Every second sample survives exactly under a 2:1 ratio.
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 2);
        assert_eq!(out[79], 158);
    }

    #[test]
    fn test_resample_interpolates_midpoints() {
        let samples = [0i16, 100];
        let out = resample_linear(&samples, 8_000, 16_000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
    }

    #[test]
    fn test_widen() {
        assert_eq!(widen_8_to_16(&[0, 1, -1, 127, -128]), vec![0, 256, -256, 32512, -32768]);
    }
}
