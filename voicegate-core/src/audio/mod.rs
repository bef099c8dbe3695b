//! Linear-PCM utilities shared by the capture and playback pipelines.

pub mod pcm;
pub mod wav;

pub use pcm::{
    base64_decode_pcm, base64_encode_pcm, bytes_to_i16, codec_for_rate, downmix_to_mono,
    i16_to_bytes, nearest_standard_rate, resample_linear, widen_8_to_16, PcmError,
};
pub use wav::{parse_wav, prepare_for_playback, wrap_pcm, PreparedPcm, WavAudio};

/// Frame length used on every media socket.
pub const FRAME_MS: u64 = 20;

/// Default capture codec and rate (signed linear 16-bit at 16 kHz).
pub const DEFAULT_FORMAT: &str = "slin16";
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Bytes in one 20 ms frame of mono 16-bit PCM at `sample_rate`.
pub fn frame_bytes(sample_rate: u32) -> usize {
    (sample_rate as usize / 1000) * FRAME_MS as usize * 2
}
