//! RIFF/WAVE parsing and assembly on top of `hound`.
//!
//! TTS servers answer with WAV containers in whatever shape their vocoder
//! produces; the playback pipeline only speaks mono 16-bit slin. This module
//! normalizes between the two.

use std::io::Cursor;

use crate::audio::pcm::{
    codec_for_rate, downmix_to_mono, nearest_standard_rate, resample_linear, widen_8_to_16,
    PcmError,
};

/// Decoded WAV payload, widened to 16-bit but otherwise untouched.
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Mono 16-bit PCM at a rate the switch has a codec name for.
#[derive(Debug, Clone)]
pub struct PreparedPcm {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub codec: &'static str,
}

impl PreparedPcm {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Parse a RIFF/WAVE container from memory.
///
/// 8-bit input is widened to 16-bit; 16-bit passes through; anything else
/// is rejected (no codec transcoding here).
pub fn parse_wav(bytes: &[u8]) -> Result<WavAudio, PcmError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PcmError::BadContainer(e.to_string()))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(PcmError::UnsupportedChannels(0));
    }

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PcmError::BadContainer(e.to_string()))?,
        (hound::SampleFormat::Int, 8) => {
            let raw = reader
                .samples::<i8>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| PcmError::BadContainer(e.to_string()))?;
            widen_8_to_16(&raw)
        }
        (_, bits) => return Err(PcmError::UnsupportedWidth(bits)),
    };

    Ok(WavAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Reduce decoded WAV audio to something the playback pipeline can stream:
/// mono, 16-bit, at a rate with an exact slin mapping (resampling down to
/// the nearest standard rate when needed).
pub fn prepare_for_playback(audio: WavAudio) -> PreparedPcm {
    let mono = downmix_to_mono(&audio.samples, audio.channels);
    let (samples, rate) = match codec_for_rate(audio.sample_rate) {
        Some(_) => (mono, audio.sample_rate),
        None => {
            let target = nearest_standard_rate(audio.sample_rate);
            (resample_linear(&mono, audio.sample_rate, target), target)
        }
    };
    // The rate is standard by construction at this point.
    let codec = codec_for_rate(rate).expect("standard rate has a codec name");
    PreparedPcm {
        samples,
        sample_rate: rate,
        codec,
    }
}

/// Wrap mono 16-bit PCM in a WAV container.
pub fn wrap_pcm(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).expect("in-memory WAV writer");
        for &s in samples {
            writer.write_sample(s).expect("in-memory WAV write");
        }
        writer.finalize().expect("in-memory WAV finalize");
    }
    cursor.into_inner()
}
