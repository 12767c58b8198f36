//! PCM16 audio helpers
//!
//! All audio that crosses the bridge is raw single-channel 16-bit
//! little-endian PCM. Browsers occasionally hand us container formats
//! (WebM/Opus from MediaRecorder, WAV from file uploads), so inbound frames
//! are sniffed and validated before they are forwarded upstream.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Canonical WAV header length produced by common encoders.
const WAV_HEADER_LEN: usize = 44;

/// Container formats we can recognize from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// No known container signature; assumed raw PCM16.
    RawPcm,
    /// RIFF/WAVE container.
    Wav,
    /// WebM/Matroska (what MediaRecorder produces by default).
    Webm,
    /// MP3 (ID3 tag or MPEG frame sync).
    Mp3,
    /// Ogg container.
    Ogg,
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AudioFormat::RawPcm => "pcm16",
            AudioFormat::Wav => "wav",
            AudioFormat::Webm => "webm",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
        };
        write!(f, "{name}")
    }
}

/// Validation failures for inbound audio payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("empty audio payload")]
    Empty,
    #[error("odd byte length {0} is not valid PCM16")]
    OddByteLength(usize),
    #[error("unsupported audio container: {0}")]
    UnsupportedFormat(AudioFormat),
}

/// Check that a payload is plausible raw PCM16.
///
/// This cannot prove the bytes are audio; it rejects the two failure modes
/// that actually occur in practice (empty frames and odd-length payloads
/// from a miscut byte stream).
pub fn validate_pcm16(data: &[u8]) -> Result<(), AudioError> {
    if data.is_empty() {
        return Err(AudioError::Empty);
    }
    if data.len() % 2 != 0 {
        return Err(AudioError::OddByteLength(data.len()));
    }
    Ok(())
}

/// Sniff the container format from magic bytes.
///
/// Heuristic by nature: raw PCM has no signature, so anything unrecognized
/// is assumed to be PCM. The MP3 frame-sync check is deliberately narrow
/// (`FF FB` only) to avoid misclassifying loud PCM samples.
pub fn detect_format(data: &[u8]) -> AudioFormat {
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        AudioFormat::Wav
    } else if data.len() >= 4 && data[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        AudioFormat::Webm
    } else if data.len() >= 3 && &data[0..3] == b"ID3" {
        AudioFormat::Mp3
    } else if data.len() >= 2 && data[0] == 0xFF && data[1] == 0xFB {
        AudioFormat::Mp3
    } else if data.len() >= 4 && &data[0..4] == b"OggS" {
        AudioFormat::Ogg
    } else {
        AudioFormat::RawPcm
    }
}

/// Strip a canonical 44-byte WAV header, returning the PCM payload.
///
/// Returns `None` when the buffer is too short to contain any samples
/// past the header. Non-canonical headers (extra chunks) are not parsed;
/// clients sending WAV are expected to use the standard encoder layout.
pub fn strip_wav_header(data: &[u8]) -> Option<&[u8]> {
    if data.len() <= WAV_HEADER_LEN {
        return None;
    }
    Some(&data[WAV_HEADER_LEN..])
}

/// Root-mean-square energy of a PCM16 buffer, normalized to `[0.0, 1.0]`.
///
/// This is the signal the client-energy VAD path feeds to the turn
/// detector. Invalid (odd-length) buffers ignore the trailing byte.
pub fn rms_energy(data: &[u8]) -> f32 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for chunk in data.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / i16::MAX as f64;
        sum_squares += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_squares / count as f64).sqrt() as f32
}

/// Linear-interpolation resampler for PCM16 mono.
///
/// Quality is adequate for speech; anything fancier belongs in the client.
/// Equal rates and degenerate inputs pass through unchanged.
pub fn resample_linear(data: &[u8], from_hz: u32, to_hz: u32) -> Vec<u8> {
    if from_hz == to_hz || data.len() < 4 || from_hz == 0 || to_hz == 0 {
        return data.to_vec();
    }

    let samples: Vec<i16> = data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let ratio = to_hz as f64 / from_hz as f64;
    let out_len = (samples.len() as f64 * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len * 2);

    for i in 0..out_len {
        let src = i as f64 / ratio;
        let i0 = (src.floor() as usize).min(samples.len() - 1);
        let i1 = (i0 + 1).min(samples.len() - 1);
        let frac = src - i0 as f64;
        let value = samples[i0] as f64 * (1.0 - frac) + samples[i1] as f64 * frac;
        out.extend_from_slice(&(value.round() as i16).to_le_bytes());
    }

    out
}

/// Approximate duration of a PCM16 mono buffer in milliseconds.
pub fn duration_ms(byte_len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    (byte_len as f64 / 2.0) * 1000.0 / sample_rate as f64
}

/// Per-session audio counters, updated lock-free from the relay task and
/// read by the status endpoint.
#[derive(Debug, Default)]
pub struct AudioStats {
    /// Frames accepted from the client and forwarded upstream.
    pub frames_in: AtomicU64,
    /// Response frames delivered to the client.
    pub frames_out: AtomicU64,
    /// Inbound frames rejected by validation.
    pub rejected: AtomicU64,
    /// Frames discarded by backpressure, both directions.
    pub dropped: AtomicU64,
}

impl AudioStats {
    pub fn record_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new cumulative dropped count.
    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> AudioStatsSnapshot {
        AudioStatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AudioStats`], serialized into session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioStatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub rejected: u64,
    pub dropped: u64,
}
