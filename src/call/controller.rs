//! Call controller: drives one call at a time over the signaling transport.
//!
//! [`CallController`] owns the [`SharedStatus`] and reacts to four event
//! sources multiplexed in [`run`](CallController::run):
//!
//! ```text
//! CallCommand (UI / hotkey) ──┐
//! InboundFrame (transport)  ──┼──▶ CallController ──▶ Transport::send
//! PeerEvent (negotiator)    ──┤          │
//! ConnectionState (watch)   ──┘          └──▶ SharedStatus (read by egui)
//! ```
//!
//! # Call flow
//!
//! ```text
//! StartCall    └─▶ setup task: session, microphone, offer       [Starting]
//!                  └─▶ setup done: send offer
//! answer       └─▶ apply, send start_conversation               [InCall]
//! offer (idle) └─▶ setup task: session, microphone, answer      [Starting]
//!                  └─▶ setup done: send answer                  [InCall]
//! Disconnect   └─▶ tear down, end_conversation + disconnect     [Idle]
//! ```
//!
//! Call setup runs on its own task so the loop keeps serving inbound audio,
//! mute and hang-up while the device opens and the offer is built.  Hanging
//! up during setup discards its result.
//!
//! Protocol errors are logged and the offending message dropped; device,
//! auth and lost-connection failures raise an [`Alert`] and leave the call
//! `Idle`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::{
    AcquiredInput, AudioDecoder, AudioInputSource, AudioOutputSink, CapturePipeline,
    CaptureSettings, DeviceError, MuteFlag, PlaybackPipeline,
};
use crate::session::{NegotiationError, PeerBackendFactory, PeerEvent, SessionNegotiator};
use crate::signaling::{
    IceCandidate, InboundFrame, PeerId, ProtocolError, SessionDescription, SignalingMessage,
};
use crate::transport::{AuthError, ConnectionState, Connector, Transport};

use super::state::{lock_status, Alert, AlertKind, CallState, Counters, SharedStatus};

/// How often the frame counters are copied into the status.
const STATS_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Commands / errors
// ---------------------------------------------------------------------------

/// User intents, sent by the window and the mute hotkey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Connect,
    SetRemotePeer(String),
    StartCall,
    ToggleMute,
    Disconnect,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("enter the id of the peer to call")]
    EmptyRemotePeer,

    #[error("not connected to the signaling server ({0})")]
    NotConnected(&'static str),

    #[error("a call is already in progress")]
    Busy,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("call setup task failed: {0}")]
    Setup(String),

    #[error("signaling server unreachable")]
    ConnectionLost,
}

/// Everything the controller needs from the outside world.
pub struct CallComponents {
    pub connector: Arc<dyn Connector>,
    pub peers: Arc<dyn PeerBackendFactory>,
    pub input: Arc<dyn AudioInputSource>,
    pub capture: CaptureSettings,
    pub decoder: Arc<dyn AudioDecoder>,
    pub sink: Arc<dyn AudioOutputSink>,
}

// ---------------------------------------------------------------------------
// Call setup
// ---------------------------------------------------------------------------

/// What a finished setup task hands back: the call's session, its opened
/// microphone and the offer or answer to send.
struct PreparedMedia {
    negotiator: SessionNegotiator,
    input: AcquiredInput,
    message: SignalingMessage,
}

/// A setup task in flight.
struct MediaSetup {
    remote: String,
    /// Remote candidates that arrived before the session existed.
    early_candidates: Vec<IceCandidate>,
    task: JoinHandle<Result<PreparedMedia, CallError>>,
}

/// Open a session for `remote`, acquire the microphone and build the offer,
/// or the answer to `offer`.  On failure everything opened is released.
async fn prepare_media(
    mut negotiator: SessionNegotiator,
    remote: String,
    acquire: impl Future<Output = Result<AcquiredInput, DeviceError>>,
    offer: Option<SessionDescription>,
) -> Result<PreparedMedia, CallError> {
    let prepared = async {
        negotiator.open_session(&remote).await?;
        let input = acquire.await?;
        negotiator.attach_local_stream(input.stream()).await?;
        let message = match offer {
            Some(offer) => negotiator.accept_offer(offer).await?,
            None => negotiator.create_offer().await?,
        };
        Ok::<_, CallError>((input, message))
    }
    .await;

    match prepared {
        Ok((input, message)) => Ok(PreparedMedia {
            negotiator,
            input,
            message,
        }),
        Err(e) => {
            negotiator.teardown().await;
            Err(e)
        }
    }
}

/// Close what a setup produced without using it.
async fn discard_media(mut prepared: PreparedMedia) {
    prepared.negotiator.teardown().await;
    let input = prepared.input;
    if let Err(e) = tokio::task::spawn_blocking(move || drop(input)).await {
        log::warn!("call: releasing the microphone failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// CallController
// ---------------------------------------------------------------------------

pub struct CallController {
    local_peer: PeerId,
    status: SharedStatus,
    state: CallState,
    remote_peer: Option<String>,
    /// Whether the current call got as far as `InCall`.
    reached_in_call: bool,
    mute: MuteFlag,

    connector: Arc<dyn Connector>,
    transport: Option<Arc<dyn Transport>>,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
    connection: Option<watch::Receiver<ConnectionState>>,

    peers: Arc<dyn PeerBackendFactory>,
    setup: Option<MediaSetup>,
    negotiator: SessionNegotiator,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
}

impl CallController {
    pub fn new(local_peer: PeerId, status: SharedStatus, parts: CallComponents) -> Self {
        let mute = MuteFlag::new();
        let negotiator = SessionNegotiator::new(local_peer.clone(), Arc::clone(&parts.peers));
        let capture = CapturePipeline::new(parts.input, parts.capture, mute.reader());
        let playback = PlaybackPipeline::new(parts.decoder, parts.sink);
        Self {
            local_peer,
            status,
            state: CallState::Idle,
            remote_peer: None,
            reached_in_call: false,
            mute,
            connector: parts.connector,
            transport: None,
            inbound: None,
            connection: None,
            peers: parts.peers,
            setup: None,
            negotiator,
            capture,
            playback,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }

    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    // -----------------------------------------------------------------------
    // Main async loop
    // -----------------------------------------------------------------------

    /// Run until `commands` is closed, then hang up and close the transport.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) {
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                frame = next_inbound(&mut self.inbound) => match frame {
                    Some(frame) => self.handle_inbound(frame).await,
                    None => self.on_transport_lost().await,
                },
                (early, prepared) = next_setup(&mut self.setup) => {
                    if let Err(e) = self.finish_setup(early, prepared).await {
                        self.report(&e);
                    }
                }
                state = next_connection_state(&mut self.connection) => {
                    if let Some(state) = state {
                        self.on_connection_state(state);
                    }
                }
                event = self.negotiator.next_event() => self.handle_peer_event(event).await,
                _ = stats.tick() => self.publish_counters(),
            }
        }

        log::info!("call: command channel closed, shutting down");
        self.disconnect_call().await;
    }

    async fn handle_command(&mut self, command: CallCommand) {
        log::debug!("call: command {command:?}");
        let result = match command {
            CallCommand::Connect => self.connect(),
            CallCommand::SetRemotePeer(peer) => {
                self.set_remote_peer(peer);
                Ok(())
            }
            CallCommand::StartCall => {
                let remote = self.remote_peer.clone().unwrap_or_default();
                self.start_call(&remote)
            }
            CallCommand::ToggleMute => {
                self.toggle_mute();
                Ok(())
            }
            CallCommand::Disconnect => {
                self.disconnect_call().await;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.report(&e);
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Open the signaling connection.  No-op while one is live.
    pub fn connect(&mut self) -> Result<(), CallError> {
        if self.transport.is_some() && self.inbound.is_some() {
            log::debug!("call: already connected");
            return Ok(());
        }

        let opened = match self.connector.open(&self.local_peer) {
            Ok(opened) => opened,
            Err(e) => {
                lock_status(&self.status).connection = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let connection = opened.transport.subscribe();
        let state = *connection.borrow();
        self.transport = Some(opened.transport);
        self.inbound = Some(opened.inbound);
        self.connection = Some(connection);

        let mut st = lock_status(&self.status);
        st.connection = state;
        if st.alert.as_ref().is_some_and(|a| a.kind == AlertKind::Auth) {
            st.alert = None;
        }
        log::info!("call: connecting as {}", self.local_peer);
        Ok(())
    }

    /// Remember the peer for the next call.  Ignored during a call.
    pub fn set_remote_peer(&mut self, peer: String) {
        if self.state != CallState::Idle {
            log::warn!("call: remote peer cannot change during a call");
            return;
        }
        let peer = peer.trim().to_string();
        let peer = (!peer.is_empty()).then_some(peer);
        lock_status(&self.status).remote_peer = peer.clone();
        self.remote_peer = peer;
    }

    /// Start an outgoing call to `remote`: exactly one offer is sent once
    /// the setup task finishes.
    ///
    /// Nothing is started, and the state stays `Idle`, when `remote` is empty
    /// or the transport is not open.
    pub fn start_call(&mut self, remote: &str) -> Result<(), CallError> {
        let remote = remote.trim();
        if remote.is_empty() {
            return Err(CallError::EmptyRemotePeer);
        }
        if self.state != CallState::Idle {
            return Err(CallError::Busy);
        }
        self.open_transport()?;

        self.remote_peer = Some(remote.to_string());
        lock_status(&self.status).remote_peer = self.remote_peer.clone();
        self.set_state(CallState::Starting);
        self.spawn_setup(remote.to_string(), None);
        Ok(())
    }

    fn spawn_setup(&mut self, remote: String, offer: Option<SessionDescription>) {
        let negotiator = SessionNegotiator::new(self.local_peer.clone(), Arc::clone(&self.peers));
        let acquire = self.capture.acquire();
        let task = tokio::spawn(prepare_media(negotiator, remote.clone(), acquire, offer));
        self.setup = Some(MediaSetup {
            remote,
            early_candidates: Vec::new(),
            task,
        });
    }

    /// Install a finished setup and send its offer or answer.
    async fn finish_setup(
        &mut self,
        early_candidates: Vec<IceCandidate>,
        prepared: Result<PreparedMedia, CallError>,
    ) -> Result<(), CallError> {
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.abort_call().await;
                return Err(e);
            }
        };
        let transport = match self.open_transport() {
            Ok(transport) => transport,
            Err(e) => {
                discard_media(prepared).await;
                self.abort_call().await;
                return Err(e);
            }
        };

        let PreparedMedia {
            negotiator,
            input,
            message,
        } = prepared;
        self.negotiator.teardown().await;
        self.negotiator = negotiator;
        if let Err(e) = self.capture.install(input, Arc::clone(&transport)) {
            self.abort_call().await;
            return Err(e.into());
        }
        for candidate in early_candidates {
            if let Err(e) = self.negotiator.add_remote_candidate(candidate).await {
                log::warn!("call: early candidate dropped: {e}");
            }
        }

        let answered = matches!(message, SignalingMessage::Answer { .. });
        transport.send(message);
        if answered {
            self.enter_in_call();
        } else if let Some(remote) = &self.remote_peer {
            log::info!("call: calling {remote}");
        }
        Ok(())
    }

    /// Abandon a setup still in flight.  Whatever it opens is closed in the
    /// background.
    fn cancel_setup(&mut self) {
        let Some(setup) = self.setup.take() else {
            return;
        };
        log::info!("call: abandoning call setup with {}", setup.remote);
        tokio::spawn(async move {
            if let Ok(Ok(prepared)) = setup.task.await {
                discard_media(prepared).await;
            }
        });
    }

    /// Flip the microphone mute.  Muted frames are never transmitted.
    pub fn toggle_mute(&mut self) -> bool {
        let muted = self.mute.toggle();
        lock_status(&self.status).muted = muted;
        log::info!("call: microphone {}", if muted { "muted" } else { "live" });
        muted
    }

    /// Hang up and close the signaling connection.  Safe to call repeatedly.
    ///
    /// Media stops before `end_conversation` and `disconnect` go out, so no
    /// audio follows them on the wire.
    pub async fn disconnect_call(&mut self) {
        if !self.call_active() && self.transport.is_none() {
            return;
        }

        self.set_state(CallState::Disconnecting);
        let reached_in_call = self.reached_in_call;
        self.release_media().await;

        let transport = self.transport.take();
        if let Some(transport) = &transport {
            if reached_in_call {
                transport.send(SignalingMessage::EndConversation {
                    user_id: self.local_peer.to_string(),
                });
            }
            transport.send(SignalingMessage::Disconnect {
                peer_id: Some(self.local_peer.to_string()),
            });
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.inbound = None;
        self.connection = None;

        {
            let mut st = lock_status(&self.status);
            st.connection = ConnectionState::Disconnected;
            st.remote_peer = None;
        }
        self.set_state(CallState::Idle);
        log::info!("call: disconnected");
    }

    /// The connection task ended for good: its reconnect attempts ran out.
    async fn on_transport_lost(&mut self) {
        let err = CallError::ConnectionLost;
        log::error!("call: {err}");
        if self.call_active() {
            self.release_media().await;
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.inbound = None;
        self.connection = None;

        {
            let mut st = lock_status(&self.status);
            st.connection = ConnectionState::Disconnected;
            st.remote_peer = None;
            st.last_error = Some(err.to_string());
            st.alert = Some(Alert {
                kind: AlertKind::Connection,
                message: err.to_string(),
            });
        }
        self.set_state(CallState::Idle);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub async fn handle_inbound(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Audio(payload) => {
                self.playback.handle_frame(&payload);
            }
            InboundFrame::Control(message) => {
                let kind = message.kind();
                if let Err(e) = self.handle_control(message).await {
                    log::warn!("call: dropped {kind} message: {e}");
                    lock_status(&self.status).last_error = Some(e.to_string());
                }
            }
        }
    }

    async fn handle_control(&mut self, message: SignalingMessage) -> Result<(), CallError> {
        match message {
            SignalingMessage::Answer {
                peer_id,
                target_peer,
                answer,
            } => {
                self.check_addressed(&target_peer)?;
                self.check_sender(&peer_id, ProtocolError::NoOutstandingOffer)?;
                self.negotiator.accept_answer(answer).await?;
                self.enter_in_call();
            }
            SignalingMessage::Offer {
                peer_id,
                target_peer,
                offer,
            } => {
                self.check_addressed(&target_peer)?;
                self.accept_incoming(peer_id, offer)?;
            }
            SignalingMessage::IceCandidate {
                peer_id,
                target_peer,
                candidate,
            } => {
                self.check_addressed(&target_peer)?;
                self.check_sender(&peer_id, ProtocolError::NoSession)?;
                match self.setup.as_mut() {
                    Some(setup) => setup.early_candidates.push(candidate),
                    None => self.negotiator.add_remote_candidate(candidate).await?,
                }
            }
            SignalingMessage::Disconnect { peer_id } => {
                if let Some(peer) = peer_id {
                    self.check_sender(&peer, ProtocolError::NoSession)?;
                }
                if self.state != CallState::Idle {
                    log::info!("call: remote side hung up");
                    self.end_call().await;
                }
            }
            SignalingMessage::StartConversation { user_id }
            | SignalingMessage::EndConversation { user_id } => {
                log::debug!("call: conversation notice for {user_id}");
            }
            SignalingMessage::Auth { .. } => return Err(ProtocolError::Unsupported("auth").into()),
        }
        Ok(())
    }

    /// Answer an offer while idle.  The call reaches `InCall` once the
    /// answer is sent.
    fn accept_incoming(&mut self, peer: String, offer: SessionDescription) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            return Err(ProtocolError::Busy.into());
        }
        self.open_transport()?;

        log::info!("call: incoming call from {peer}");
        self.remote_peer = Some(peer.clone());
        lock_status(&self.status).remote_peer = Some(peer.clone());
        self.set_state(CallState::Starting);
        self.spawn_setup(peer, Some(offer));
        Ok(())
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let (Some(message), Some(transport)) =
                    (self.negotiator.candidate_message(candidate), &self.transport)
                else {
                    return;
                };
                transport.send(message);
            }
            PeerEvent::RemoteTrack(track) => {
                log::info!("call: playing remote track {}", track.id);
                self.playback.attach_remote_track(track);
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        log::debug!("call: connection {}", state.label());
        lock_status(&self.status).connection = state;
        if !state.is_open() && self.state != CallState::Idle {
            log::warn!("call: signaling {} during a call", state.label());
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn open_transport(&self) -> Result<Arc<dyn Transport>, CallError> {
        match &self.transport {
            Some(t) if t.state().is_open() => Ok(Arc::clone(t)),
            Some(t) => Err(CallError::NotConnected(t.state().label())),
            None => Err(CallError::NotConnected(ConnectionState::Disconnected.label())),
        }
    }

    fn check_addressed(&self, target: &str) -> Result<(), ProtocolError> {
        if target == self.local_peer.as_str() {
            Ok(())
        } else {
            Err(ProtocolError::NotAddressedToUs(target.to_string()))
        }
    }

    /// `sender` must be the peer of the current session; `missing` is the
    /// error when there is none.
    fn check_sender(&self, sender: &str, missing: ProtocolError) -> Result<(), ProtocolError> {
        let current = match &self.setup {
            Some(setup) => Some(setup.remote.as_str()),
            None => self.negotiator.remote_peer(),
        };
        match current {
            None => Err(missing),
            Some(expected) if expected == sender => Ok(()),
            Some(expected) => Err(ProtocolError::UnexpectedSender {
                expected: expected.to_string(),
                got: sender.to_string(),
            }),
        }
    }

    fn enter_in_call(&mut self) {
        self.reached_in_call = true;
        self.set_state(CallState::InCall);
        if let Some(transport) = &self.transport {
            transport.send(SignalingMessage::StartConversation {
                user_id: self.local_peer.to_string(),
            });
        }
    }

    /// End the call but keep the signaling connection.
    async fn end_call(&mut self) {
        let reached_in_call = self.reached_in_call;
        self.abort_call().await;
        if reached_in_call {
            if let Some(transport) = &self.transport {
                transport.send(SignalingMessage::EndConversation {
                    user_id: self.local_peer.to_string(),
                });
            }
        }
    }

    async fn abort_call(&mut self) {
        self.release_media().await;
        lock_status(&self.status).remote_peer = None;
        self.set_state(CallState::Idle);
    }

    fn call_active(&self) -> bool {
        self.state != CallState::Idle
            || self.setup.is_some()
            || self.negotiator.has_session()
            || self.capture.is_running()
    }

    async fn release_media(&mut self) {
        self.cancel_setup();
        self.negotiator.teardown().await;
        self.capture.stop().await;
        self.playback.detach_remote_track();
        self.remote_peer = None;
        self.reached_in_call = false;
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            log::debug!("call: {} → {}", self.state.label(), state.label());
        }
        self.state = state;
        lock_status(&self.status).call = state;
    }

    fn publish_counters(&self) {
        let capture = self.capture.stats();
        let playback = self.playback.stats();
        lock_status(&self.status).counters = Counters {
            frames_produced: capture.produced(),
            frames_sent: capture.forwarded(),
            frames_muted: capture.muted(),
            frames_decoded: playback.decoded(),
            frames_dropped: playback.dropped(),
            track_frames: playback.track_frames(),
        };
    }

    fn report(&self, err: &CallError) {
        let mut st = lock_status(&self.status);
        match err {
            CallError::Auth(_) => {
                log::error!("call: {err}");
                st.alert = Some(Alert {
                    kind: AlertKind::Auth,
                    message: err.to_string(),
                });
            }
            CallError::Device(_) => {
                log::error!("call: {err}");
                st.alert = Some(Alert {
                    kind: AlertKind::Device,
                    message: err.to_string(),
                });
            }
            _ => log::warn!("call: {err}"),
        }
        st.last_error = Some(err.to_string());
    }
}

/// The next inbound frame, or `None` once the transport task has ended.
/// Pending forever without a transport.
async fn next_inbound(slot: &mut Option<mpsc::Receiver<InboundFrame>>) -> Option<InboundFrame> {
    let Some(rx) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let frame = rx.recv().await;
    if frame.is_none() {
        *slot = None;
    }
    frame
}

/// The outcome of the setup in `slot`, which is cleared.  Pending forever
/// without one.
async fn next_setup(
    slot: &mut Option<MediaSetup>,
) -> (Vec<IceCandidate>, Result<PreparedMedia, CallError>) {
    let Some(setup) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let joined = (&mut setup.task).await;
    let early = slot
        .take()
        .map(|setup| setup.early_candidates)
        .unwrap_or_default();
    let prepared = joined.unwrap_or_else(|e| Err(CallError::Setup(e.to_string())));
    (early, prepared)
}

async fn next_connection_state(
    slot: &mut Option<watch::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    let Some(rx) = slot.as_mut() else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(*rx.borrow_and_update()),
        Err(_) => {
            *slot = None;
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
