//! Audio capture and playback.
//!
//! # Pipelines
//!
//! ```text
//! Microphone → cpal callback → AudioChunk (mpsc) → audio-frames thread
//!           → downmix → resample to wire rate → frame → mute check → encode → transport
//!
//! transport binary frame → BestEffortDecoder → AudioOutputSink (ring buffer → speaker)
//! peer RemoteTrack ────────────────────────────┘
//! ```
//!
//! Devices sit behind [`AudioInputSource`] and [`AudioOutputSink`]; codecs
//! behind [`AudioEncoder`] and [`AudioDecoder`].

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod mute;
pub mod pipeline;
pub mod playback;
pub mod resample;

pub use buffer::RingBuffer;
pub use capture::{AudioChunk, AudioInputSource, CpalInput, DeviceError, StreamHandle};
pub use codec::{
    AudioDecoder, AudioEncoder, AudioFrame, BestEffortDecoder, DecodeError, EncodeError,
    Pcm16Encoder, WavBlobEncoder,
};
pub use mute::{MuteFlag, MuteReader};
pub use pipeline::{AcquiredInput, CapturePipeline, CaptureSettings, CaptureStats, LocalStream};
pub use playback::{
    AudioOutputSink, CpalOutput, NullSink, PlaybackPipeline, PlaybackStats, RemoteTrack,
};
pub use resample::{downmix, StreamResampler};
