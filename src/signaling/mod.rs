//! Signaling vocabulary shared by the transport, the session negotiator and
//! the call controller.
//!
//! * [`SignalingMessage`]: the JSON control frames on the wire.
//! * [`InboundFrame`]: a frame as delivered by the transport (control or audio).
//! * [`PeerId`]: this client's identity, generated once per process.
//! * [`ProtocolError`]: malformed or out-of-order signaling.

pub mod message;

use std::fmt;

use thiserror::Error;

pub use message::{IceCandidate, InboundFrame, SdpKind, SessionDescription, SignalingMessage};

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Identity stamped on every signaling message this client sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// A fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// A signaling message that cannot be applied.  Always recovered by logging
/// and dropping the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(String),

    #[error("server reported an error: {0}")]
    ServerReported(String),

    #[error("answer received with no outstanding offer")]
    NoOutstandingOffer,

    #[error("offer received while the session is {0}")]
    UnexpectedOffer(&'static str),

    #[error("no peer session is active")]
    NoSession,

    #[error("expected a {expected:?} description, got {got:?}")]
    WrongDescriptionKind { expected: SdpKind, got: SdpKind },

    #[error("message from {got} does not belong to the call with {expected}")]
    UnexpectedSender { expected: String, got: String },

    #[error("message addressed to {0}, not to this peer")]
    NotAddressedToUs(String),

    #[error("{0} message is not accepted from the server")]
    Unsupported(&'static str),

    #[error("a call is already in progress")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
