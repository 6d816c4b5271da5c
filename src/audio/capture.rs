//! Microphone and speaker devices via `cpal`.
//!
//! [`AudioInputSource`] is the capability the capture pipeline needs: start
//! streaming [`AudioChunk`]s into an mpsc channel and hand back a
//! [`StreamHandle`].  Dropping the handle releases the device.
//!
//! `cpal::Stream` is not `Send` on every platform, so [`CpalInput`] builds
//! and owns the stream on a dedicated `audio-capture` thread which parks
//! until the handle is stopped.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use thiserror::Error;

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// A single buffer of raw audio as delivered by the cpal callback.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

// ---------------------------------------------------------------------------
// DeviceError
// ---------------------------------------------------------------------------

/// Microphone or speaker unavailable.  Fatal for the call attempt.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no audio device found on the default host")]
    NoDevice,

    #[error("audio device {0:?} not found")]
    NotFound(String),

    #[error("failed to enumerate audio devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build audio stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),

    #[error("audio thread failed: {0}")]
    Thread(String),
}

// ---------------------------------------------------------------------------
// Device selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) enum Direction {
    Input,
    Output,
}

/// The device called `name`, or the host default when `name` is `None`.
pub(crate) fn select_device(
    name: Option<&str>,
    direction: Direction,
) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    let Some(wanted) = name else {
        let device = match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or(DeviceError::NoDevice);
    };

    let mut devices: Box<dyn Iterator<Item = cpal::Device>> = match direction {
        Direction::Input => Box::new(host.input_devices()?),
        Direction::Output => Box::new(host.output_devices()?),
    };
    devices
        .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        .ok_or_else(|| DeviceError::NotFound(wanted.to_string()))
}

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// Keeps a device stream alive.  Stopping or dropping it releases the device.
pub struct StreamHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// A handle for a stream owned by `thread`, which exits once `stop` is
    /// dropped.
    pub fn new(stop: mpsc::Sender<()>, thread: JoinHandle<()>) -> Self {
        Self {
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    /// A handle with nothing to release.
    pub fn detached() -> Self {
        Self {
            stop: None,
            thread: None,
        }
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("audio: device thread panicked");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// AudioInputSource
// ---------------------------------------------------------------------------

/// Something that can produce microphone audio.
pub trait AudioInputSource: Send + Sync {
    /// Begin streaming chunks into `tx`.  Blocks until the device is running
    /// or has failed.
    fn start(&self, tx: mpsc::Sender<AudioChunk>) -> Result<StreamHandle, DeviceError>;
}

/// The system microphone, or a named input device.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioInputSource for CpalInput {
    fn start(&self, tx: mpsc::Sender<AudioChunk>) -> Result<StreamHandle, DeviceError> {
        let device_name = self.device_name.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(device_name.as_deref(), tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Parks until the handle drops its sender.
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("capture: input device released");
            })
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(StreamHandle::new(stop_tx, thread)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Thread(
                    "capture thread exited during start-up".into(),
                ))
            }
        }
    }
}

fn open_input_stream(
    name: Option<&str>,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream, DeviceError> {
    let device = select_device(name, Direction::Input)?;
    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    log::info!(
        "capture: opening {:?} @ {} Hz, {} ch, {:?}",
        device.name().unwrap_or_default(),
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, tx)?,
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, tx)?,
        other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.play()?;
    Ok(stream)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let chunk = AudioChunk {
                samples: data.iter().map(|&s| s.to_sample::<f32>()).collect(),
                sample_rate,
                channels,
            };
            // The receiver goes away when the pipeline stops.
            let _ = tx.send(chunk);
        },
        |err: cpal::StreamError| {
            log::error!("capture: stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
