//! Authenticated, auto-reconnecting signaling transport.
//!
//! # Architecture
//!
//! ```text
//! send / send_binary ──try_send──▶ outbound queue ──▶ ┌──────────────────┐ ──▶ WebSocket
//!                                                     │  connection task │
//! InboundFrame ◀──────── inbound channel ◀─────────── └──────────────────┘ ◀── WebSocket
//!                                                          │
//!                                   watch<ConnectionState> ┘
//! ```
//!
//! [`Transport`] is the seam the rest of the crate talks to;
//! [`TransportConnection`] is the WebSocket implementation and
//! [`Connector`] opens a fresh one per connect request.

pub mod connection;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::CredentialSource;
use crate::signaling::{InboundFrame, PeerId, SignalingMessage};

pub use connection::{TransportConfig, TransportConnection};
pub use state::ConnectionState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// No credential was available when the connection was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("not signed in: no session token is available")]
    MissingCredential,
}

/// A socket-level failure.  Recovered by the reconnection policy.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("websocket send failed: {0}")]
    Send(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("websocket receive failed: {0}")]
    Receive(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("server closed the connection")]
    ClosedByPeer,

    #[error("could not encode control frame: {0}")]
    Encode(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Outbound side of a signaling connection.
///
/// Both send methods are non-blocking: when the connection is not `Open`
/// the frame is logged and dropped.
#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Receiver that observes every state change.
    fn subscribe(&self) -> watch::Receiver<ConnectionState>;

    fn send(&self, message: SignalingMessage);

    fn send_binary(&self, frame: Vec<u8>);

    /// Locally initiated close: flush what is queued, close the socket and
    /// cancel any pending reconnection.  Never triggers a reconnect.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// A freshly opened transport plus the receiver its inbound frames arrive on.
pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Opens transports on behalf of the call controller.
pub trait Connector: Send + Sync {
    fn open(&self, local_peer: &PeerId) -> Result<OpenedTransport, AuthError>;
}

/// Opens [`TransportConnection`]s against one server with one credential
/// source.
pub struct WebSocketConnector {
    config: TransportConfig,
    credentials: Arc<dyn CredentialSource>,
}

impl WebSocketConnector {
    pub fn new(config: TransportConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            config,
            credentials,
        }
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, local_peer: &PeerId) -> Result<OpenedTransport, AuthError> {
        let (connection, inbound) =
            TransportConnection::open(self.config.clone(), self.credentials.as_ref(), local_peer)?;
        Ok(OpenedTransport {
            transport: Arc::new(connection),
            inbound,
        })
    }
}
