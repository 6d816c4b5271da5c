//! Peer media session: negotiation state machine and its WebRTC backend.
//!
//! [`SessionNegotiator`] owns at most one peer session at a time and turns
//! offers, answers and ICE candidates into [`SignalingMessage`]s for the
//! transport.  The media stack itself sits behind [`PeerBackend`], created
//! per call by a [`PeerBackendFactory`]; [`RtcPeerFactory`] is the `webrtc`
//! implementation.
//!
//! [`SignalingMessage`]: crate::signaling::SignalingMessage

pub mod backend;
pub mod codec;
pub mod negotiator;
pub mod rtc;

pub use backend::{BackendError, PeerBackend, PeerBackendFactory, PeerEvent};
pub use codec::TrackCodec;
pub use negotiator::{NegotiationError, NegotiationState, SessionNegotiator};
pub use rtc::RtcPeerFactory;
