//! The media-session capability the negotiator drives.
//!
//! A [`PeerBackend`] is one peer connection: it produces and consumes
//! session descriptions, accepts remote ICE candidates and reports what it
//! discovers on its own (local candidates, the remote audio track) as
//! [`PeerEvent`]s on the channel it was created with.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::{LocalStream, RemoteTrack};
use crate::signaling::{IceCandidate, SessionDescription};

/// Something the peer connection discovered by itself.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
}

/// A failure inside the media stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer connection: {0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

#[async_trait]
pub trait PeerBackend: Send {
    /// Add the microphone as the outbound audio track.
    async fn attach_local_stream(&mut self, stream: &LocalStream) -> Result<(), BackendError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription, BackendError>;

    /// Create an answer to the installed remote offer and install it as the
    /// local description.
    async fn create_answer(&mut self) -> Result<SessionDescription, BackendError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), BackendError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), BackendError>;

    async fn close(&mut self);
}

/// Creates one [`PeerBackend`] per call attempt.
#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerBackend>, BackendError>;
}
