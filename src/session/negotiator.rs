//! Offer/answer/ICE negotiation over one [`PeerBackend`].
//!
//! ```text
//! offerer:   Idle ──create_offer──▶ Offering ──▶ AwaitingAnswer ──accept_answer──▶ Connected
//! answerer:  Idle ──accept_offer──▶ AnsweringOffer ──answer sent──▶ Connected
//! any ──teardown──▶ (no session)
//! ```
//!
//! Remote candidates that arrive before the remote description are queued and
//! applied, in arrival order, as soon as it is set.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::LocalStream;
use crate::signaling::{IceCandidate, PeerId, ProtocolError, SdpKind, SessionDescription, SignalingMessage};

use super::backend::{BackendError, PeerBackend, PeerBackendFactory, PeerEvent};

// ---------------------------------------------------------------------------
// State / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AnsweringOffer,
    Connected,
}

impl NegotiationState {
    pub fn label(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting answer",
            NegotiationState::AnsweringOffer => "answering offer",
            NegotiationState::Connected => "connected",
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no local audio stream is attached")]
    NoLocalStream,

    #[error("cannot {operation} while {}", .state.label())]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

// ---------------------------------------------------------------------------
// PeerSession
// ---------------------------------------------------------------------------

/// One call attempt's media session.  Never reused.
struct PeerSession {
    backend: Box<dyn PeerBackend>,
    events: mpsc::Receiver<PeerEvent>,
    state: NegotiationState,
    remote_peer: String,
    has_local_stream: bool,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    applied_candidates: usize,
}

impl PeerSession {
    async fn apply_pending_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        match self.backend.add_ice_candidate(candidate).await {
            Ok(()) => self.applied_candidates += 1,
            Err(e) => log::warn!("session: remote candidate rejected: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionNegotiator
// ---------------------------------------------------------------------------

pub struct SessionNegotiator {
    local_peer: PeerId,
    factory: Arc<dyn PeerBackendFactory>,
    session: Option<PeerSession>,
}

impl SessionNegotiator {
    pub fn new(local_peer: PeerId, factory: Arc<dyn PeerBackendFactory>) -> Self {
        Self {
            local_peer,
            factory,
            session: None,
        }
    }

    /// `Idle` when no session exists.
    pub fn state(&self) -> NegotiationState {
        self.session
            .as_ref()
            .map_or(NegotiationState::Idle, |s| s.state)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.remote_peer.as_str())
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.session.as_ref()?.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.session.as_ref()?.remote_description.as_ref()
    }

    /// Remote candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |s| s.pending_candidates.len())
    }

    pub fn applied_candidates(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.applied_candidates)
    }

    /// Tear down any previous session and create a fresh one for `remote_peer`.
    pub async fn open_session(&mut self, remote_peer: &str) -> Result<(), NegotiationError> {
        self.teardown().await;

        let (events_tx, events) = mpsc::channel(64);
        let backend = self.factory.create(events_tx).await?;
        self.session = Some(PeerSession {
            backend,
            events,
            state: NegotiationState::Idle,
            remote_peer: remote_peer.to_string(),
            has_local_stream: false,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            applied_candidates: 0,
        });
        log::info!("session: new peer session with {remote_peer}");
        Ok(())
    }

    pub async fn attach_local_stream(&mut self, stream: &LocalStream) -> Result<(), NegotiationError> {
        let session = self.session.as_mut().ok_or(ProtocolError::NoSession)?;
        session.backend.attach_local_stream(stream).await?;
        session.has_local_stream = true;
        log::debug!("session: attached local stream {}", stream.id());
        Ok(())
    }

    /// Create the local offer and return the message that carries it.
    ///
    /// Requires an attached local stream.
    pub async fn create_offer(&mut self) -> Result<SignalingMessage, NegotiationError> {
        let session = self.session.as_mut().ok_or(ProtocolError::NoSession)?;
        if !session.has_local_stream {
            return Err(NegotiationError::NoLocalStream);
        }
        if session.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                operation: "create an offer",
                state: session.state,
            });
        }

        session.state = NegotiationState::Offering;
        let offer = match session.backend.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                session.state = NegotiationState::Idle;
                return Err(e.into());
            }
        };
        session.local_description = Some(offer.clone());
        session.state = NegotiationState::AwaitingAnswer;
        log::info!("session: offer ready for {}", session.remote_peer);

        Ok(SignalingMessage::Offer {
            peer_id: self.local_peer.to_string(),
            target_peer: session.remote_peer.clone(),
            offer,
        })
    }

    /// Apply a remote offer and return the answer message.
    ///
    /// A second offer on the same session is a protocol error.  When the
    /// backend fails the session is left `Idle` with nothing committed.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SignalingMessage, NegotiationError> {
        let session = self.session.as_mut().ok_or(ProtocolError::NoSession)?;
        if offer.kind != SdpKind::Offer {
            return Err(ProtocolError::WrongDescriptionKind {
                expected: SdpKind::Offer,
                got: offer.kind,
            }
            .into());
        }
        if session.state != NegotiationState::Idle {
            return Err(ProtocolError::UnexpectedOffer(session.state.label()).into());
        }

        session.state = NegotiationState::AnsweringOffer;
        let answered = match session.backend.set_remote_description(offer.clone()).await {
            Ok(()) => session.backend.create_answer().await,
            Err(e) => Err(e),
        };
        let answer = match answered {
            Ok(answer) => answer,
            Err(e) => {
                // Queued candidates stay queued for a retried offer.
                session.state = NegotiationState::Idle;
                return Err(e.into());
            }
        };
        session.remote_description = Some(offer);
        session.local_description = Some(answer.clone());
        session.apply_pending_candidates().await;
        session.state = NegotiationState::Connected;
        log::info!("session: answered offer from {}", session.remote_peer);

        Ok(SignalingMessage::Answer {
            peer_id: self.local_peer.to_string(),
            target_peer: session.remote_peer.clone(),
            answer,
        })
    }

    /// Apply the remote answer to our outstanding offer.
    ///
    /// Without an outstanding offer this fails and nothing changes.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let session = match self.session.as_mut() {
            Some(s) if s.state == NegotiationState::AwaitingAnswer => s,
            _ => return Err(ProtocolError::NoOutstandingOffer.into()),
        };
        if answer.kind != SdpKind::Answer {
            return Err(ProtocolError::WrongDescriptionKind {
                expected: SdpKind::Answer,
                got: answer.kind,
            }
            .into());
        }

        session.backend.set_remote_description(answer.clone()).await?;
        session.remote_description = Some(answer);
        session.apply_pending_candidates().await;
        session.state = NegotiationState::Connected;
        log::info!(
            "session: connected to {} ({} candidates applied)",
            session.remote_peer,
            session.applied_candidates
        );
        Ok(())
    }

    /// Apply `candidate` now, or queue it until the remote description is set.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let session = self.session.as_mut().ok_or(ProtocolError::NoSession)?;
        if session.remote_description.is_none() {
            session.pending_candidates.push_back(candidate);
            log::debug!(
                "session: buffered remote candidate ({} pending)",
                session.pending_candidates.len()
            );
        } else {
            session.apply_candidate(candidate).await;
        }
        Ok(())
    }

    /// Wrap a locally gathered candidate for the current remote peer.
    pub fn candidate_message(&self, candidate: IceCandidate) -> Option<SignalingMessage> {
        let session = self.session.as_ref()?;
        Some(SignalingMessage::IceCandidate {
            peer_id: self.local_peer.to_string(),
            target_peer: session.remote_peer.clone(),
            candidate,
        })
    }

    /// The next event from the current session.  Never resolves without one.
    pub async fn next_event(&mut self) -> PeerEvent {
        if let Some(session) = self.session.as_mut() {
            if let Some(event) = session.events.recv().await {
                return event;
            }
        }
        std::future::pending().await
    }

    /// Close and discard the session.  No-op without one.
    pub async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.backend.close().await;
            log::info!(
                "session: closed session with {} ({})",
                session.remote_peer,
                session.state.label()
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
