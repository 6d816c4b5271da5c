//! Frame encoders and decoders for the audio wire.
//!
//! * PCM mode: mono little-endian `i16`, no header.
//! * Blob mode: one mono 16-bit WAV container (`hound`) per frame.
//! * Peer track fallback: G.711 µ-law, when the remote peer has no Opus.
//!
//! Quantisation maps `[-1.0, 1.0]` onto the full `i16` range: `1.0 → 32767`,
//! `-1.0 → -32768`, `0.0 → 0`; anything outside is clamped first.

use std::io::Cursor;

use thiserror::Error;

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// A block of mono samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cannot encode an empty frame")]
    Empty,

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
}

/// A malformed inbound audio payload.  Always recovered by dropping the frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty audio payload")]
    Empty,

    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),

    #[error("invalid WAV payload: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported WAV format: {0}")]
    UnsupportedWav(String),
}

// ---------------------------------------------------------------------------
// Sample quantisation
// ---------------------------------------------------------------------------

pub fn quantize_sample(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32_768.0) as i16
    } else {
        (s * 32_767.0) as i16
    }
}

pub fn dequantize_sample(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32_768.0
    } else {
        sample as f32 / 32_767.0
    }
}

pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| quantize_sample(s).to_le_bytes())
        .collect()
}

pub fn decode_pcm16(payload: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    if payload.len() % 2 != 0 {
        return Err(DecodeError::OddLength(payload.len()));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| dequantize_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

// ---------------------------------------------------------------------------
// WAV
// ---------------------------------------------------------------------------

pub fn encode_wav(frame: &AudioFrame) -> Result<Vec<u8>, EncodeError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: frame.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
        for &s in &frame.samples {
            writer.write_sample(quantize_sample(s))?;
        }
        writer.finalize()?;
    }
    Ok(bytes)
}

/// Decode a WAV container, downmixing to mono.
pub fn decode_wav(payload: &[u8]) -> Result<AudioFrame, DecodeError> {
    let reader = hound::WavReader::new(Cursor::new(payload))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(dequantize_sample))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Float, 32) => {
            reader.into_samples::<f32>().collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(DecodeError::UnsupportedWav(format!("{format:?} {bits}-bit")));
        }
    };
    if interleaved.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(AudioFrame::new(
        super::downmix(&interleaved, spec.channels),
        spec.sample_rate,
    ))
}

fn looks_like_wav(payload: &[u8]) -> bool {
    payload.len() >= 12 && &payload[..4] == b"RIFF" && &payload[8..12] == b"WAVE"
}

// ---------------------------------------------------------------------------
// G.711 µ-law
// ---------------------------------------------------------------------------

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

pub fn mulaw_encode(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn mulaw_decode(byte: u8) -> i16 {
    let u = !byte as i32;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

// ---------------------------------------------------------------------------
// Encoder / decoder capabilities
// ---------------------------------------------------------------------------

/// Turns a captured frame into one binary wire payload.
pub trait AudioEncoder: Send {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<u8>, EncodeError>;
}

/// Turns one inbound binary payload back into samples.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<AudioFrame, DecodeError>;
}

/// Raw little-endian `i16`, no header.
#[derive(Debug, Default)]
pub struct Pcm16Encoder;

impl AudioEncoder for Pcm16Encoder {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<u8>, EncodeError> {
        if frame.samples.is_empty() {
            return Err(EncodeError::Empty);
        }
        Ok(encode_pcm16(&frame.samples))
    }
}

/// One self-describing WAV blob per frame.
#[derive(Debug, Default)]
pub struct WavBlobEncoder;

impl AudioEncoder for WavBlobEncoder {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<u8>, EncodeError> {
        if frame.samples.is_empty() {
            return Err(EncodeError::Empty);
        }
        encode_wav(frame)
    }
}

/// Accepts both wire formats: RIFF/WAVE payloads decode as WAV, everything
/// else as headerless PCM16 at `pcm_rate`.
#[derive(Debug, Clone)]
pub struct BestEffortDecoder {
    pcm_rate: u32,
}

impl BestEffortDecoder {
    pub fn new(pcm_rate: u32) -> Self {
        Self { pcm_rate }
    }
}

impl AudioDecoder for BestEffortDecoder {
    fn decode(&self, payload: &[u8]) -> Result<AudioFrame, DecodeError> {
        if looks_like_wav(payload) {
            decode_wav(payload)
        } else {
            Ok(AudioFrame::new(decode_pcm16(payload)?, self.pcm_rate))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
