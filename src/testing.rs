//! Test doubles for the unit tests: a transport that records what it is
//! asked to send, a connector handing it out, a scripted microphone, a
//! collecting speaker and a mock peer backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::audio::{
    AudioChunk, AudioFrame, AudioInputSource, AudioOutputSink, DeviceError, LocalStream,
    StreamHandle,
};
use crate::session::{BackendError, PeerBackend, PeerBackendFactory, PeerEvent};
use crate::signaling::{
    IceCandidate, InboundFrame, PeerId, SdpKind, SessionDescription, SignalingMessage,
};
use crate::transport::{AuthError, ConnectionState, Connector, OpenedTransport, Transport};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Poll `cond` every 10 ms, panicking after three seconds.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 3s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) fn local_stream() -> LocalStream {
    LocalStream::new("mic-test", 16_000)
}

// ---------------------------------------------------------------------------
// RecordingTransport / FakeConnector
// ---------------------------------------------------------------------------

/// One outbound frame, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Control(&'static str),
    Binary,
}

/// Records every frame it would put on the wire.  Like the real transport
/// it drops frames unless `Open`.
pub(crate) struct RecordingTransport {
    state: watch::Sender<ConnectionState>,
    sent: Mutex<Vec<SignalingMessage>>,
    binary: Mutex<Vec<Vec<u8>>>,
    timeline: Mutex<Vec<Sent>>,
    closes: AtomicUsize,
}

impl RecordingTransport {
    pub fn open() -> Arc<Self> {
        Self::with_state(ConnectionState::Open)
    }

    pub fn with_state(state: ConnectionState) -> Arc<Self> {
        let (tx, _rx) = watch::channel(state);
        Arc::new(Self {
            state: tx,
            sent: Mutex::new(Vec::new()),
            binary: Mutex::new(Vec::new()),
            timeline: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        lock(&self.sent).clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.sent).iter().map(|m| m.kind()).collect()
    }

    pub fn binary(&self) -> Vec<Vec<u8>> {
        lock(&self.binary).clone()
    }

    /// Control and binary frames interleaved as they were sent.
    pub fn timeline(&self) -> Vec<Sent> {
        lock(&self.timeline).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn send(&self, message: SignalingMessage) {
        if self.state().is_open() {
            lock(&self.timeline).push(Sent::Control(message.kind()));
            lock(&self.sent).push(message);
        }
    }

    fn send_binary(&self, frame: Vec<u8>) {
        if self.state().is_open() {
            lock(&self.timeline).push(Sent::Binary);
            lock(&self.binary).push(frame);
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Hands out the same [`RecordingTransport`] on every open.
pub(crate) struct FakeConnector {
    transport: Arc<RecordingTransport>,
    has_credential: bool,
    inbound: Mutex<Option<mpsc::Sender<InboundFrame>>>,
    opens: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    pub fn without_credential() -> Arc<Self> {
        Self::build(false)
    }

    fn build(has_credential: bool) -> Arc<Self> {
        Arc::new(Self {
            transport: RecordingTransport::with_state(ConnectionState::Disconnected),
            has_credential,
            inbound: Mutex::new(None),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn transport(&self) -> Arc<RecordingTransport> {
        Arc::clone(&self.transport)
    }

    /// Sender feeding the inbound channel of the latest open.
    pub fn inbound(&self) -> Option<mpsc::Sender<InboundFrame>> {
        lock(&self.inbound).clone()
    }

    /// Drop the inbound sender, as the connection driver does once it
    /// gives up reconnecting.
    pub fn give_up(&self) {
        lock(&self.inbound).take();
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn open(&self, _local_peer: &PeerId) -> Result<OpenedTransport, AuthError> {
        if !self.has_credential {
            return Err(AuthError::MissingCredential);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.transport.set_state(ConnectionState::Open);

        let (tx, rx) = mpsc::channel(16);
        *lock(&self.inbound) = Some(tx);
        Ok(OpenedTransport {
            transport: self.transport(),
            inbound: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedInput / CollectingSink
// ---------------------------------------------------------------------------

/// A microphone the test pushes chunks into.
pub(crate) struct ScriptedInput {
    feed: Mutex<Option<std_mpsc::Sender<AudioChunk>>>,
    fail: bool,
    starts: AtomicUsize,
}

impl ScriptedInput {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// Every start fails with [`DeviceError::NoDevice`].
    pub fn failing() -> Arc<Self> {
        Self::build(true)
    }

    fn build(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            feed: Mutex::new(None),
            fail,
            starts: AtomicUsize::new(0),
        })
    }

    /// Deliver `chunk` as the device callback would.  `false` once the
    /// pipeline has stopped listening.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        match lock(&self.feed).as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl AudioInputSource for ScriptedInput {
    fn start(&self, tx: std_mpsc::Sender<AudioChunk>) -> Result<StreamHandle, DeviceError> {
        if self.fail {
            return Err(DeviceError::NoDevice);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *lock(&self.feed) = Some(tx);
        Ok(StreamHandle::detached())
    }
}

#[derive(Default)]
pub(crate) struct CollectingSink {
    frames: Mutex<Vec<AudioFrame>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        lock(&self.frames).clone()
    }
}

impl AudioOutputSink for CollectingSink {
    fn play(&self, frame: AudioFrame) {
        lock(&self.frames).push(frame);
    }
}

// ---------------------------------------------------------------------------
// MockPeerFactory / MockPeerBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackendCall {
    AttachLocal(String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Clone, Default)]
struct Behaviour {
    fail_offers: bool,
    /// Answers left to refuse, shared by every session.
    answer_failures: Arc<AtomicUsize>,
    offer_delay: Option<Duration>,
}

/// Records every backend call across all sessions it creates.
pub(crate) struct MockPeerFactory {
    calls: Arc<Mutex<Vec<BackendCall>>>,
    events: Mutex<Option<mpsc::Sender<PeerEvent>>>,
    created: AtomicUsize,
    behaviour: Behaviour,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Self::build(Behaviour::default())
    }

    pub fn failing_offers() -> Arc<Self> {
        Self::build(Behaviour {
            fail_offers: true,
            ..Behaviour::default()
        })
    }

    /// The first `count` answers fail, later ones succeed.
    pub fn failing_answers(count: usize) -> Arc<Self> {
        Self::build(Behaviour {
            answer_failures: Arc::new(AtomicUsize::new(count)),
            ..Behaviour::default()
        })
    }

    /// Every offer takes `delay` to create.
    pub fn slow_offers(delay: Duration) -> Arc<Self> {
        Self::build(Behaviour {
            offer_delay: Some(delay),
            ..Behaviour::default()
        })
    }

    fn build(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(None),
            created: AtomicUsize::new(0),
            behaviour,
        })
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Remote candidates applied, in order.
    pub fn candidates(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                BackendCall::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| **c == BackendCall::Close)
            .count()
    }

    /// Pretend the latest session gathered a local candidate.
    pub fn emit_candidate(&self, candidate: &str) -> bool {
        match lock(&self.events).as_ref() {
            Some(tx) => tx
                .try_send(PeerEvent::LocalCandidate(IceCandidate::new(candidate)))
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PeerBackendFactory for MockPeerFactory {
    async fn create(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerBackend>, BackendError> {
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.events) = Some(events);
        Ok(Box::new(MockPeerBackend {
            id,
            calls: Arc::clone(&self.calls),
            behaviour: self.behaviour.clone(),
        }))
    }
}

struct MockPeerBackend {
    id: usize,
    calls: Arc<Mutex<Vec<BackendCall>>>,
    behaviour: Behaviour,
}

impl MockPeerBackend {
    fn record(&self, call: BackendCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl PeerBackend for MockPeerBackend {
    async fn attach_local_stream(&mut self, stream: &LocalStream) -> Result<(), BackendError> {
        self.record(BackendCall::AttachLocal(stream.id().to_string()));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, BackendError> {
        self.record(BackendCall::CreateOffer);
        if let Some(delay) = self.behaviour.offer_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behaviour.fail_offers {
            return Err(BackendError::new("offer refused"));
        }
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.id)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, BackendError> {
        self.record(BackendCall::CreateAnswer);
        let refuse = self
            .behaviour
            .answer_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(BackendError::new("answer refused"));
        }
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.id)))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::SetRemote(description.kind));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), BackendError> {
        self.record(BackendCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&mut self) {
        self.record(BackendCall::Close);
    }
}
