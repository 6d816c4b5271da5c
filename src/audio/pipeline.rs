//! Capture pipeline: microphone → mono → wire rate → frames → transport.
//!
//! ```text
//! cpal callback ──AudioChunk (std mpsc)──▶ audio-frames thread
//!     downmix → resample → segment into frames
//!     muted?  ──yes──▶ count and discard
//!             ──no───▶ encode ──▶ Transport::send_binary
//!                      └──────▶ LocalStream subscribers (peer track)
//! ```
//!
//! The device keeps running while muted so unmuting never re-acquires it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{AudioConfig, CaptureMode};
use crate::transport::Transport;

use super::capture::{AudioChunk, AudioInputSource, DeviceError, StreamHandle};
use super::codec::{AudioEncoder, AudioFrame, Pcm16Encoder, WavBlobEncoder};
use super::mute::MuteReader;
use super::resample::{downmix, StreamResampler};

/// Poll interval for the frame thread's stop flag.
const PUMP_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// CaptureSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub mode: CaptureMode,
    pub wire_sample_rate: u32,
    pub pcm_block_size: usize,
    pub blob_interval: Duration,
}

impl CaptureSettings {
    /// Samples per transmitted frame at the wire rate.
    pub fn frame_len(&self) -> usize {
        let len = match self.mode {
            CaptureMode::Pcm => self.pcm_block_size,
            CaptureMode::Blob => {
                (self.wire_sample_rate as f64 * self.blob_interval.as_secs_f64()).round() as usize
            }
        };
        len.max(1)
    }

    fn encoder(&self) -> Box<dyn AudioEncoder> {
        match self.mode {
            CaptureMode::Pcm => Box::new(Pcm16Encoder),
            CaptureMode::Blob => Box::new(WavBlobEncoder),
        }
    }
}

impl From<&AudioConfig> for CaptureSettings {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            mode: audio.capture_mode,
            wire_sample_rate: audio.wire_sample_rate,
            pcm_block_size: audio.pcm_block_size,
            blob_interval: Duration::from_millis(audio.blob_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureStats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CaptureStats {
    produced: AtomicU64,
    muted: AtomicU64,
    forwarded: AtomicU64,
}

impl CaptureStats {
    /// Frames segmented from the device, muted or not.
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn muted(&self) -> u64 {
        self.muted.load(Ordering::Relaxed)
    }

    /// Frames handed to the transport.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// LocalStream
// ---------------------------------------------------------------------------

/// The live, unmuted microphone signal at the wire rate, for peer tracks.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    sample_rate: u32,
    frames: broadcast::Sender<AudioFrame>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, sample_rate: u32) -> Self {
        let (frames, _) = broadcast::channel(32);
        Self {
            id: id.into(),
            sample_rate,
            frames,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }
}

// ---------------------------------------------------------------------------
// CapturePipeline
// ---------------------------------------------------------------------------

/// A microphone opened for a call that is not forwarding frames yet.
/// Dropping it releases the device.
pub struct AcquiredInput {
    input: StreamHandle,
    chunks: mpsc::Receiver<AudioChunk>,
    stream: LocalStream,
}

impl AcquiredInput {
    pub fn stream(&self) -> &LocalStream {
        &self.stream
    }
}

struct ActiveCapture {
    input: StreamHandle,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    stream: LocalStream,
}

impl ActiveCapture {
    fn shutdown(mut self) {
        self.running.store(false, Ordering::Release);
        self.input.stop();
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                log::warn!("capture: frame thread panicked");
            }
        }
        log::info!("capture: stopped stream {}", self.stream.id);
    }
}

pub struct CapturePipeline {
    source: Arc<dyn AudioInputSource>,
    settings: CaptureSettings,
    mute: MuteReader,
    stats: Arc<CaptureStats>,
    active: Option<ActiveCapture>,
    next_stream: u64,
}

impl CapturePipeline {
    pub fn new(source: Arc<dyn AudioInputSource>, settings: CaptureSettings, mute: MuteReader) -> Self {
        Self {
            source,
            settings,
            mute,
            stats: Arc::new(CaptureStats::default()),
            active: None,
            next_stream: 0,
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the microphone and start forwarding frames to `transport`.
    ///
    /// Starting an already running pipeline returns the existing stream.
    pub async fn start(&mut self, transport: Arc<dyn Transport>) -> Result<LocalStream, DeviceError> {
        if let Some(active) = &self.active {
            return Ok(active.stream.clone());
        }
        let acquired = self.acquire().await?;
        self.install(acquired, transport)
    }

    /// Open the device without forwarding anything yet.
    ///
    /// The returned future owns what it needs and may run on another task.
    pub fn acquire(
        &mut self,
    ) -> impl Future<Output = Result<AcquiredInput, DeviceError>> + Send + 'static {
        self.next_stream += 1;
        let stream = LocalStream::new(
            format!("mic-{}", self.next_stream),
            self.settings.wire_sample_rate,
        );
        let source = Arc::clone(&self.source);

        async move {
            let (tx, chunks) = mpsc::channel::<AudioChunk>();
            let input = tokio::task::spawn_blocking(move || source.start(tx))
                .await
                .map_err(|e| DeviceError::Thread(e.to_string()))??;
            Ok(AcquiredInput {
                input,
                chunks,
                stream,
            })
        }
    }

    /// Start forwarding frames from an acquired device to `transport`.
    ///
    /// While already running, `acquired` is released and the existing stream
    /// returned.
    pub fn install(
        &mut self,
        acquired: AcquiredInput,
        transport: Arc<dyn Transport>,
    ) -> Result<LocalStream, DeviceError> {
        if let Some(active) = &self.active {
            return Ok(active.stream.clone());
        }
        let AcquiredInput {
            input,
            chunks,
            stream,
        } = acquired;

        let running = Arc::new(AtomicBool::new(true));
        let pump = FramePump {
            frame_len: self.settings.frame_len(),
            wire_rate: self.settings.wire_sample_rate,
            encoder: self.settings.encoder(),
            mute: self.mute.clone(),
            stats: Arc::clone(&self.stats),
            transport,
            frames: stream.frames.clone(),
            resampler: None,
            pending: Vec::new(),
        };
        let flag = Arc::clone(&running);
        let pump = std::thread::Builder::new()
            .name("audio-frames".into())
            .spawn(move || pump.run(chunks, flag))
            .map_err(|e| DeviceError::Thread(e.to_string()))?;

        log::info!(
            "capture: started stream {} ({:?}, {} samples/frame @ {} Hz)",
            stream.id,
            self.settings.mode,
            self.settings.frame_len(),
            self.settings.wire_sample_rate
        );

        self.active = Some(ActiveCapture {
            input,
            running,
            pump: Some(pump),
            stream: stream.clone(),
        });
        Ok(stream)
    }

    /// Release the device and stop producing frames.  No-op when not running.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || active.shutdown()).await {
            log::warn!("capture: shutdown task failed: {e}");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// FramePump: runs on the audio-frames thread
// ---------------------------------------------------------------------------

struct FramePump {
    frame_len: usize,
    wire_rate: u32,
    encoder: Box<dyn AudioEncoder>,
    mute: MuteReader,
    stats: Arc<CaptureStats>,
    transport: Arc<dyn Transport>,
    frames: broadcast::Sender<AudioFrame>,
    resampler: Option<StreamResampler>,
    pending: Vec<f32>,
}

impl FramePump {
    fn run(mut self, rx: mpsc::Receiver<AudioChunk>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Acquire) {
            let chunk = match rx.recv_timeout(PUMP_POLL) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.push_chunk(&chunk);
        }
        if !self.pending.is_empty() {
            log::debug!("capture: discarding {} partial-frame samples", self.pending.len());
        }
    }

    fn push_chunk(&mut self, chunk: &AudioChunk) {
        let mono = downmix(&chunk.samples, chunk.channels);
        if self.resampler.as_ref().map(StreamResampler::from_rate) != Some(chunk.sample_rate) {
            self.resampler = Some(StreamResampler::new(chunk.sample_rate, self.wire_rate));
        }
        if let Some(resampler) = self.resampler.as_mut() {
            self.pending.extend(resampler.process(&mono));
        }

        while self.pending.len() >= self.frame_len {
            let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            self.emit(AudioFrame::new(samples, self.wire_rate));
        }
    }

    fn emit(&mut self, frame: AudioFrame) {
        self.stats.produced.fetch_add(1, Ordering::Relaxed);
        if self.mute.is_muted() {
            self.stats.muted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.encoder.encode(&frame) {
            Ok(payload) => {
                self.transport.send_binary(payload);
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("capture: dropping frame: {e}"),
        }
        // No subscribers outside a peer session.
        let _ = self.frames.send(frame);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MuteFlag;
    use crate::testing::{wait_until, RecordingTransport, ScriptedInput};

    fn pcm_settings(block: usize) -> CaptureSettings {
        CaptureSettings {
            mode: CaptureMode::Pcm,
            wire_sample_rate: 16_000,
            pcm_block_size: block,
            blob_interval: Duration::from_millis(1_000),
        }
    }

    fn mono(samples: Vec<f32>, rate: u32) -> AudioChunk {
        AudioChunk {
            samples,
            sample_rate: rate,
            channels: 1,
        }
    }

    #[test]
    fn frame_len_by_mode() {
        assert_eq!(pcm_settings(4096).frame_len(), 4096);
        let blob = CaptureSettings {
            mode: CaptureMode::Blob,
            ..pcm_settings(4096)
        };
        assert_eq!(blob.frame_len(), 16_000);
        assert_eq!(pcm_settings(0).frame_len(), 1);
    }

    #[tokio::test]
    async fn pcm_frames_are_fixed_size_blocks() {
        let input = ScriptedInput::new();
        let transport = RecordingTransport::open();
        let mut pipeline = CapturePipeline::new(input.clone(), pcm_settings(4), MuteFlag::new().reader());

        pipeline.start(transport.clone()).await.unwrap();
        assert!(input.push(mono(vec![0.5; 10], 16_000)));

        wait_until(|| transport.binary().len() == 2).await;
        let frames = transport.binary();
        assert_eq!(frames[0].len(), 8);
        assert_eq!(&frames[0][..2], &16_383_i16.to_le_bytes());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stereo_device_audio_is_downmixed_and_resampled() {
        let input = ScriptedInput::new();
        let transport = RecordingTransport::open();
        let mut pipeline = CapturePipeline::new(input.clone(), pcm_settings(4), MuteFlag::new().reader());
        pipeline.start(transport.clone()).await.unwrap();

        // 12 stereo frames @ 48 kHz → 12 mono → 4 samples @ 16 kHz.
        input.push(AudioChunk {
            samples: vec![1.0, -1.0].repeat(12),
            sample_rate: 48_000,
            channels: 2,
        });

        wait_until(|| transport.binary().len() == 1).await;
        assert_eq!(transport.binary()[0], vec![0u8; 8]);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn muted_frames_are_produced_but_never_sent() {
        let input = ScriptedInput::new();
        let transport = RecordingTransport::open();
        let mute = MuteFlag::new();
        let mut pipeline = CapturePipeline::new(input.clone(), pcm_settings(4), mute.reader());
        let stream = pipeline.start(transport.clone()).await.unwrap();
        let mut local = stream.subscribe();
        let stats = pipeline.stats();

        mute.toggle();
        input.push(mono(vec![0.9; 8], 16_000));
        wait_until(|| stats.muted() == 2).await;
        assert_eq!(stats.produced(), 2);
        assert!(transport.binary().is_empty());
        assert!(local.try_recv().is_err());

        mute.toggle();
        input.push(mono(vec![0.1; 4], 16_000));
        wait_until(|| transport.binary().len() == 1).await;
        assert_eq!(stats.forwarded(), 1);
        assert_eq!(local.recv().await.unwrap().samples.len(), 4);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn blob_mode_sends_wav_containers() {
        let input = ScriptedInput::new();
        let transport = RecordingTransport::open();
        let settings = CaptureSettings {
            mode: CaptureMode::Blob,
            blob_interval: Duration::from_millis(1),
            ..pcm_settings(4096)
        };
        let mut pipeline = CapturePipeline::new(input.clone(), settings, MuteFlag::new().reader());
        pipeline.start(transport.clone()).await.unwrap();

        input.push(mono(vec![0.2; 16], 16_000));
        wait_until(|| transport.binary().len() == 1).await;
        assert_eq!(&transport.binary()[0][..4], b"RIFF");
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_is_safe_before_start_and_twice() {
        let input = ScriptedInput::new();
        let transport = RecordingTransport::open();
        let mut pipeline = CapturePipeline::new(input.clone(), pcm_settings(4), MuteFlag::new().reader());

        pipeline.stop().await;
        pipeline.start(transport).await.unwrap();
        assert!(pipeline.is_running());
        pipeline.stop().await;
        pipeline.stop().await;
        assert!(!pipeline.is_running());
        // The frame thread dropped its receiver.
        assert!(!input.push(mono(vec![0.0; 4], 16_000)));
    }

    #[tokio::test]
    async fn acquired_input_forwards_nothing_until_installed() {
        let input = ScriptedInput::new();
        let transport = RecordingTransport::open();
        let mut pipeline = CapturePipeline::new(input.clone(), pcm_settings(4), MuteFlag::new().reader());

        let acquired = pipeline.acquire().await.unwrap();
        assert_eq!(acquired.stream().id(), "mic-1");
        assert!(input.push(mono(vec![0.5; 4], 16_000)));
        assert!(!pipeline.is_running());

        pipeline.install(acquired, transport.clone()).unwrap();
        // Chunks buffered before the install are forwarded by the pump.
        wait_until(|| transport.binary().len() == 1).await;
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn dropping_an_acquired_input_releases_the_device() {
        let input = ScriptedInput::new();
        let mut pipeline = CapturePipeline::new(input.clone(), pcm_settings(4), MuteFlag::new().reader());

        let acquired = pipeline.acquire().await.unwrap();
        drop(acquired);
        assert!(!input.push(mono(vec![0.0; 4], 16_000)));
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn device_failure_leaves_pipeline_stopped() {
        let input = ScriptedInput::failing();
        let mut pipeline = CapturePipeline::new(input, pcm_settings(4), MuteFlag::new().reader());
        let err = pipeline.start(RecordingTransport::open()).await.unwrap_err();
        assert!(matches!(err, DeviceError::NoDevice));
        assert!(!pipeline.is_running());
    }
}
