//! WebSocket implementation of [`Transport`].
//!
//! [`TransportConnection::open`] reads the credential, spawns one connection
//! task and returns immediately.  The task owns the socket: it connects,
//! sends the `auth` frame before anything else, then pumps the outbound queue
//! and the inbound stream until the socket dies or [`Transport::close`] is
//! called.
//!
//! An unexpected close schedules exactly one reconnection attempt after
//! `reconnect_delay`; a failed attempt schedules the next one the same way.
//! Attempts are unbounded unless `max_reconnect_attempts` is set.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{AuthToken, CredentialSource, ServerConfig};
use crate::signaling::{InboundFrame, PeerId, SignalingMessage};

use super::{AuthError, ConnectionState, Transport, TransportError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

/// Parameters reused by every (re)connection attempt.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: Option<u32>,
    pub outbound_queue: usize,
    pub inbound_queue: usize,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_server(&ServerConfig {
            url: url.into(),
            ..ServerConfig::default()
        })
    }

    pub fn from_server(server: &ServerConfig) -> Self {
        Self {
            url: server.url.clone(),
            reconnect_delay: server.reconnect_delay(),
            max_reconnect_attempts: server.max_reconnect_attempts,
            outbound_queue: server.outbound_queue,
            inbound_queue: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

enum Outbound {
    Control(SignalingMessage),
    Binary(Vec<u8>),
}

impl Outbound {
    fn describe(&self) -> String {
        match self {
            Outbound::Control(message) => format!("{} message", message.kind()),
            Outbound::Binary(frame) => format!("audio frame ({} bytes)", frame.len()),
        }
    }

    fn into_message(self) -> Result<Message, TransportError> {
        match self {
            Outbound::Control(message) => message
                .to_json()
                .map(Message::Text)
                .map_err(TransportError::Encode),
            Outbound::Binary(frame) => Ok(Message::Binary(frame)),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportConnection
// ---------------------------------------------------------------------------

/// Handle to one authenticated, auto-reconnecting signaling connection.
pub struct TransportConnection {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound_tx: mpsc::Sender<Outbound>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportConnection {
    /// Start connecting to `config.url` as `local_peer`.
    ///
    /// Returns the handle and the receiver every inbound frame is delivered
    /// to.  Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`AuthError::MissingCredential`] when `credentials` has no token.  No
    /// network I/O is attempted in that case.
    pub fn open(
        config: TransportConfig,
        credentials: &dyn CredentialSource,
        local_peer: &PeerId,
    ) -> Result<(Self, mpsc::Receiver<InboundFrame>), AuthError> {
        let token = credentials.token().ok_or_else(|| {
            log::error!("transport: no session token available, not connecting");
            AuthError::MissingCredential
        })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            config,
            token,
            peer_id: local_peer.clone(),
            state: Arc::clone(&state_tx),
            outbound: outbound_rx,
            inbound: inbound_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(driver.run());

        Ok((
            Self {
                state_tx,
                state_rx,
                outbound_tx,
                shutdown_tx,
                task: Mutex::new(Some(task)),
            },
            inbound_rx,
        ))
    }

    fn enqueue(&self, outbound: Outbound) {
        let state = *self.state_rx.borrow();
        if !state.is_open() {
            match outbound {
                Outbound::Control(_) => log::warn!(
                    "transport: {} while {}, dropping",
                    outbound.describe(),
                    state.label()
                ),
                Outbound::Binary(_) => log::debug!(
                    "transport: {} while {}, dropping",
                    outbound.describe(),
                    state.label()
                ),
            }
            return;
        }

        match self.outbound_tx.try_send(outbound) {
            Ok(()) => {}
            Err(TrySendError::Full(outbound)) => {
                log::warn!("transport: outbound queue full, dropping {}", outbound.describe());
            }
            Err(TrySendError::Closed(outbound)) => {
                log::warn!("transport: connection task gone, dropping {}", outbound.describe());
            }
        }
    }
}

#[async_trait]
impl Transport for TransportConnection {
    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn send(&self, message: SignalingMessage) {
        self.enqueue(Outbound::Control(message));
    }

    fn send_binary(&self, frame: Vec<u8>) {
        self.enqueue(Outbound::Binary(frame));
    }

    async fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(task) = task else {
            return;
        };

        self.state_tx.send_replace(ConnectionState::Closing);
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = task.await {
            log::warn!("transport: connection task ended abnormally: {e}");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        log::info!("transport: closed");
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Driver: the connection task
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// `close()` was called.
    Local,
    /// The socket died underneath us.
    Lost(TransportError),
    /// Nobody is listening for inbound frames any more.
    ReceiverGone,
}

enum Delivery {
    Delivered,
    Abandoned,
    ReceiverGone,
}

struct Driver {
    config: TransportConfig,
    token: AuthToken,
    peer_id: PeerId,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<InboundFrame>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            log::info!("transport: connecting to {}", self.config.url);

            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                result = connect_async(self.config.url.as_str()) => result,
            };

            match connected {
                Ok((socket, _response)) => {
                    failures = 0;
                    match self.serve(socket).await {
                        SessionEnd::Local => break,
                        SessionEnd::ReceiverGone => {
                            log::info!("transport: inbound receiver dropped, stopping");
                            break;
                        }
                        SessionEnd::Lost(err) => log::warn!("transport: connection lost: {err}"),
                    }
                }
                Err(err) => log::warn!("transport: {}", TransportError::Connect(err)),
            }

            self.set_state(ConnectionState::Disconnected);
            self.discard_queued();

            failures += 1;
            if let Some(max) = self.config.max_reconnect_attempts {
                if failures > max {
                    log::error!("transport: giving up after {max} reconnection attempts");
                    return;
                }
            }

            log::info!(
                "transport: reconnecting in {:?} (attempt {failures})",
                self.config.reconnect_delay
            );
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Authenticate on a fresh socket, then pump frames both ways.
    async fn serve(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        self.set_state(ConnectionState::Authenticating);
        let auth = SignalingMessage::Auth {
            token: self.token.as_str().to_string(),
            peer_id: self.peer_id.to_string(),
        };
        if let Err(err) = send_outbound(&mut sink, Outbound::Control(auth)).await {
            return SessionEnd::Lost(err);
        }
        self.set_state(ConnectionState::Open);
        log::info!("transport: authenticated as {}", self.peer_id);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    self.set_state(ConnectionState::Closing);
                    self.flush(&mut sink).await;
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Local;
                }
                Some(outbound) = self.outbound.recv() => {
                    if let Err(err) = send_outbound(&mut sink, outbound).await {
                        return SessionEnd::Lost(err);
                    }
                }
                incoming = stream.next() => {
                    if let Some(end) = self.on_incoming(incoming).await {
                        return end;
                    }
                }
            }
        }
    }

    async fn on_incoming(
        &mut self,
        incoming: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<SessionEnd> {
        let frame = match incoming {
            Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                Ok(message) => InboundFrame::Control(message),
                Err(err) => {
                    log::warn!("transport: dropping control frame: {err}");
                    return None;
                }
            },
            Some(Ok(Message::Binary(data))) => InboundFrame::Audio(data),
            Some(Ok(Message::Close(frame))) => {
                log::debug!("transport: close frame received: {frame:?}");
                return Some(SessionEnd::Lost(TransportError::ClosedByPeer));
            }
            Some(Ok(_)) => return None,
            Some(Err(err)) => return Some(SessionEnd::Lost(TransportError::Receive(err))),
            None => return Some(SessionEnd::Lost(TransportError::ClosedByPeer)),
        };

        match self.deliver(frame).await {
            Delivery::Delivered | Delivery::Abandoned => None,
            Delivery::ReceiverGone => Some(SessionEnd::ReceiverGone),
        }
    }

    /// Hand a frame to the receiver without blocking a pending shutdown.
    async fn deliver(&mut self, frame: InboundFrame) -> Delivery {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => Delivery::Abandoned,
            sent = self.inbound.send(frame) => match sent {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::ReceiverGone,
            },
        }
    }

    /// Write everything queued before `close()` was requested.
    async fn flush(&mut self, sink: &mut SocketSink) {
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Err(err) = send_outbound(sink, outbound).await {
                log::warn!("transport: flush on close failed: {err}");
                break;
            }
        }
    }

    /// Frames queued for a socket that died are never replayed on the next one.
    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("transport: discarded {dropped} queued frames after disconnect");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("transport: {} → {}", previous.label(), state.label());
        }
    }
}

async fn send_outbound(sink: &mut SocketSink, outbound: Outbound) -> Result<(), TransportError> {
    let message = outbound.into_message()?;
    sink.send(message).await.map_err(TransportError::Send)
}

/// Resolves once shutdown is requested or the handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
