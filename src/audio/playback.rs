//! Playback pipeline: inbound audio → decoder → output sink.
//!
//! Two independent inputs feed the same sink:
//!
//! * discrete binary frames relayed over the signaling transport
//!   ([`PlaybackPipeline::handle_frame`]), decoded best-effort;
//! * a negotiated peer track ([`PlaybackPipeline::attach_remote_track`]),
//!   already decoded by the session backend.
//!
//! A frame that fails to decode is logged and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Sample;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::buffer::RingBuffer;
use super::capture::{select_device, DeviceError, Direction, StreamHandle};
use super::codec::{AudioDecoder, AudioFrame};
use super::resample::StreamResampler;

// ---------------------------------------------------------------------------
// AudioOutputSink
// ---------------------------------------------------------------------------

/// Somewhere decoded audio can be rendered.  `play` must not block.
pub trait AudioOutputSink: Send + Sync {
    fn play(&self, frame: AudioFrame);
}

/// Sink used when no output device is available.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioOutputSink for NullSink {
    fn play(&self, frame: AudioFrame) {
        log::debug!(
            "playback: no output device, discarding {:.3}s of audio",
            frame.duration_secs()
        );
    }
}

// ---------------------------------------------------------------------------
// RemoteTrack
// ---------------------------------------------------------------------------

/// Continuous audio from a negotiated peer session.
#[derive(Debug)]
pub struct RemoteTrack {
    pub id: String,
    pub frames: mpsc::Receiver<AudioFrame>,
}

// ---------------------------------------------------------------------------
// PlaybackPipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PlaybackStats {
    decoded: AtomicU64,
    dropped: AtomicU64,
    track_frames: AtomicU64,
}

impl PlaybackStats {
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    /// Frames that failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn track_frames(&self) -> u64 {
        self.track_frames.load(Ordering::Relaxed)
    }
}

pub struct PlaybackPipeline {
    decoder: Arc<dyn AudioDecoder>,
    sink: Arc<dyn AudioOutputSink>,
    stats: Arc<PlaybackStats>,
    track: Option<JoinHandle<()>>,
}

impl PlaybackPipeline {
    pub fn new(decoder: Arc<dyn AudioDecoder>, sink: Arc<dyn AudioOutputSink>) -> Self {
        Self {
            decoder,
            sink,
            stats: Arc::new(PlaybackStats::default()),
            track: None,
        }
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        Arc::clone(&self.stats)
    }

    /// Decode one inbound binary frame and schedule it for playback.
    ///
    /// Returns `false` when the frame was dropped.
    pub fn handle_frame(&self, payload: &[u8]) -> bool {
        match self.decoder.decode(payload) {
            Ok(frame) => {
                self.stats.decoded.fetch_add(1, Ordering::Relaxed);
                self.sink.play(frame);
                true
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("playback: dropping {}-byte frame: {e}", payload.len());
                false
            }
        }
    }

    /// Play `track` until it ends or is replaced.
    pub fn attach_remote_track(&mut self, mut track: RemoteTrack) {
        self.detach_remote_track();
        log::info!("playback: playing remote track {}", track.id);

        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        self.track = Some(tokio::spawn(async move {
            while let Some(frame) = track.frames.recv().await {
                stats.track_frames.fetch_add(1, Ordering::Relaxed);
                sink.play(frame);
            }
            log::info!("playback: remote track {} ended", track.id);
        }));
    }

    pub fn detach_remote_track(&mut self) {
        if let Some(task) = self.track.take() {
            task.abort();
        }
    }

    pub fn has_remote_track(&self) -> bool {
        self.track.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.detach_remote_track();
    }
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

type SharedQueue = Arc<Mutex<RingBuffer<f32>>>;

/// Speaker output fed from a bounded queue.
///
/// Frames are resampled to the device rate on `play`; the device callback
/// pulls from the queue and plays silence when it runs dry or the queue is
/// busy.  When the queue is full the oldest audio is overwritten.
pub struct CpalOutput {
    queue: SharedQueue,
    device_rate: u32,
    resampler: Mutex<Option<StreamResampler>>,
    overruns: AtomicU64,
    _stream: StreamHandle,
}

impl CpalOutput {
    pub fn open(device_name: Option<String>, buffer_secs: f32) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(SharedQueue, u32), DeviceError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let (stream, queue, rate) = match open_output_stream(device_name.as_deref(), buffer_secs) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((queue, rate)));
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("playback: output device released");
            })
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok((queue, device_rate))) => Ok(Self {
                queue,
                device_rate,
                resampler: Mutex::new(None),
                overruns: AtomicU64::new(0),
                _stream: StreamHandle::new(stop_tx, thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Thread(
                    "playback thread exited during start-up".into(),
                ))
            }
        }
    }
}

impl AudioOutputSink for CpalOutput {
    fn play(&self, frame: AudioFrame) {
        let samples = {
            let mut resampler = self
                .resampler
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if resampler.as_ref().map(StreamResampler::from_rate) != Some(frame.sample_rate) {
                *resampler = Some(StreamResampler::new(frame.sample_rate, self.device_rate));
            }
            match resampler.as_mut() {
                Some(r) => r.process(&frame.samples),
                None => return,
            }
        };
        let overwritten = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_slice(&samples);
        if overwritten > 0 {
            let total = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("playback: queue full, dropped {overwritten} oldest samples ({total} overruns)");
        }
    }
}

fn open_output_stream(
    name: Option<&str>,
    buffer_secs: f32,
) -> Result<(cpal::Stream, SharedQueue, u32), DeviceError> {
    let device = select_device(name, Direction::Output)?;
    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    let capacity = ((rate as f32 * buffer_secs.max(0.1)) as usize).max(1);
    let queue: SharedQueue = Arc::new(Mutex::new(RingBuffer::new(capacity)));

    log::info!(
        "playback: opening {:?} @ {} Hz, {} ch, {:?}, {:.1}s queue",
        device.name().unwrap_or_default(),
        rate,
        config.channels,
        sample_format,
        buffer_secs
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, Arc::clone(&queue))?,
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, Arc::clone(&queue))?,
        other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
    };
    stream.play()?;
    Ok((stream, queue, rate))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: SharedQueue,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    // One second of scratch so the callback never allocates.
    let mut mono: Vec<f32> = Vec::with_capacity(config.sample_rate.0 as usize);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            render(&queue, &mut mono, data, channels);
        },
        |err: cpal::StreamError| {
            log::error!("playback: stream error: {err}");
        },
        None,
    )?;
    Ok(stream)
}

/// Fill one device buffer from `queue`, copying each mono sample to every
/// channel.  Plays silence instead of waiting when `play` holds the queue.
fn render<T>(queue: &Mutex<RingBuffer<f32>>, mono: &mut Vec<f32>, data: &mut [T], channels: usize)
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let frames = data.len() / channels;
    mono.clear();
    mono.resize(frames, 0.0);
    match queue.try_lock() {
        Ok(mut queue) => {
            queue.pop_into(mono);
        }
        Err(std::sync::TryLockError::Poisoned(poisoned)) => {
            poisoned.into_inner().pop_into(mono);
        }
        Err(std::sync::TryLockError::WouldBlock) => {}
    }

    for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
        let value = T::from_sample(*sample);
        for out in frame {
            *out = value;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{encode_pcm16, BestEffortDecoder};
    use crate::testing::{wait_until, CollectingSink};

    fn pipeline(sink: Arc<CollectingSink>) -> PlaybackPipeline {
        PlaybackPipeline::new(Arc::new(BestEffortDecoder::new(16_000)), sink)
    }

    #[test]
    fn decoded_frames_reach_the_sink_in_order() {
        let sink = CollectingSink::new();
        let playback = pipeline(sink.clone());

        assert!(playback.handle_frame(&encode_pcm16(&[0.0, 1.0])));
        assert!(playback.handle_frame(&encode_pcm16(&[-1.0])));

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.0, 1.0]);
        assert_eq!(frames[1].samples, vec![-1.0]);
        assert_eq!(playback.stats().decoded(), 2);
    }

    #[test]
    fn bad_frames_are_dropped_without_stalling_later_ones() {
        let sink = CollectingSink::new();
        let playback = pipeline(sink.clone());

        assert!(!playback.handle_frame(&[]));
        assert!(!playback.handle_frame(&[1, 2, 3]));
        assert!(playback.handle_frame(&encode_pcm16(&[0.5])));

        assert_eq!(sink.frames().len(), 1);
        assert_eq!(playback.stats().dropped(), 2);
    }

    #[test]
    fn render_copies_mono_to_every_channel() {
        let queue = Mutex::new(RingBuffer::new(8));
        queue.lock().unwrap().push_slice(&[0.5, -0.5]);
        let mut mono = Vec::with_capacity(4);
        let mut data = [1.0_f32; 6];

        render(&queue, &mut mono, &mut data, 2);
        // Two queued frames, then silence once the queue runs dry.
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5, 0.0, 0.0]);
        assert!(queue.lock().unwrap().is_empty());
    }

    #[test]
    fn render_plays_silence_while_the_queue_is_busy() {
        let queue = Mutex::new(RingBuffer::new(8));
        queue.lock().unwrap().push_slice(&[0.5; 4]);
        let mut mono = Vec::new();
        let mut data = [7_i16; 4];

        let held = queue.lock().unwrap();
        render(&queue, &mut mono, &mut data, 1);
        assert_eq!(data, [0; 4]);
        assert_eq!(held.len(), 4);
    }

    #[tokio::test]
    async fn remote_track_plays_until_it_ends() {
        let sink = CollectingSink::new();
        let mut playback = pipeline(sink.clone());

        let (tx, rx) = mpsc::channel(4);
        playback.attach_remote_track(RemoteTrack {
            id: "remote".into(),
            frames: rx,
        });
        tx.send(AudioFrame::new(vec![0.1; 160], 8_000)).await.unwrap();
        tx.send(AudioFrame::new(vec![0.2; 160], 8_000)).await.unwrap();

        wait_until(|| sink.frames().len() == 2).await;
        assert_eq!(playback.stats().track_frames(), 2);
        assert!(playback.has_remote_track());

        drop(tx);
        wait_until(|| !playback.has_remote_track()).await;
    }

    #[tokio::test]
    async fn detaching_stops_track_playback() {
        let sink = CollectingSink::new();
        let mut playback = pipeline(sink.clone());

        let (tx, rx) = mpsc::channel(4);
        playback.attach_remote_track(RemoteTrack {
            id: "remote".into(),
            frames: rx,
        });
        playback.detach_remote_track();
        assert!(!playback.has_remote_track());

        // Sending may fail once the aborted task has dropped the receiver.
        let _ = tx.send(AudioFrame::new(vec![0.1; 8], 8_000)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sink.frames().is_empty());
    }
}
