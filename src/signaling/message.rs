//! JSON control frames exchanged with the signaling server.
//!
//! One JSON object per WebSocket text message, discriminated by `type`:
//!
//! ```text
//! { "type": "auth", "token": "…", "peer_id": "…" }
//! { "type": "offer" | "answer", "peer_id": "…", "target_peer": "…", "offer|answer": { "type": "…", "sdp": "…" } }
//! { "type": "ice-candidate", "peer_id": "…", "target_peer": "…", "candidate": { "candidate": "…", "sdpMid": "…", "sdpMLineIndex": 0 } }
//! { "type": "start_conversation" | "end_conversation", "user_id": "…" }
//! { "type": "disconnect", "peer_id": "…" }
//! ```
//!
//! Audio never travels as a control frame; it is carried by binary WebSocket
//! messages and surfaces as [`InboundFrame::Audio`].

use serde::{Deserialize, Serialize};

use super::ProtocolError;

// ---------------------------------------------------------------------------
// Session / ICE descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as browsers serialise it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate in `RTCIceCandidateInit` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SignalingMessage
// ---------------------------------------------------------------------------

/// A control message on the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "auth")]
    Auth { token: String, peer_id: String },

    #[serde(rename = "offer")]
    Offer {
        peer_id: String,
        target_peer: String,
        offer: SessionDescription,
    },

    #[serde(rename = "answer")]
    Answer {
        peer_id: String,
        target_peer: String,
        answer: SessionDescription,
    },

    #[serde(rename = "ice-candidate")]
    IceCandidate {
        peer_id: String,
        target_peer: String,
        candidate: IceCandidate,
    },

    #[serde(rename = "start_conversation")]
    StartConversation { user_id: String },

    #[serde(rename = "end_conversation")]
    EndConversation { user_id: String },

    /// Sent by a client leaving; the server sends it without `peer_id` when it
    /// drops the client.
    #[serde(rename = "disconnect")]
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
}

impl SignalingMessage {
    /// Wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Auth { .. } => "auth",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::StartConversation { .. } => "start_conversation",
            SignalingMessage::EndConversation { .. } => "end_conversation",
            SignalingMessage::Disconnect { .. } => "disconnect",
        }
    }

    /// `target_peer` for the peer-routed messages.
    pub fn target_peer(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { target_peer, .. }
            | SignalingMessage::Answer { target_peer, .. }
            | SignalingMessage::IceCandidate { target_peer, .. } => Some(target_peer),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one text frame.
    ///
    /// A server error reply (`{"error": "…"}`) becomes
    /// [`ProtocolError::ServerReported`]; anything else that does not parse is
    /// [`ProtocolError::Malformed`].
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct ErrorReply {
            error: String,
        }

        match serde_json::from_str::<SignalingMessage>(text) {
            Ok(message) => Ok(message),
            Err(parse_err) => match serde_json::from_str::<ErrorReply>(text) {
                Ok(reply) => Err(ProtocolError::ServerReported(reply.error)),
                Err(_) => Err(ProtocolError::Malformed(parse_err.to_string())),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// InboundFrame
// ---------------------------------------------------------------------------

/// A frame delivered by the transport, classified by WebSocket message type.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(SignalingMessage),
    Audio(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn to_value(message: &SignalingMessage) -> Value {
        serde_json::from_str(&message.to_json().unwrap()).unwrap()
    }

    #[test]
    fn auth_wire_shape() {
        let msg = SignalingMessage::Auth {
            token: "tok".into(),
            peer_id: "me".into(),
        };
        assert_eq!(
            to_value(&msg),
            json!({ "type": "auth", "token": "tok", "peer_id": "me" })
        );
    }

    #[test]
    fn offer_wire_shape() {
        let msg = SignalingMessage::Offer {
            peer_id: "me".into(),
            target_peer: "you".into(),
            offer: SessionDescription::offer("v=0"),
        };
        assert_eq!(
            to_value(&msg),
            json!({
                "type": "offer",
                "peer_id": "me",
                "target_peer": "you",
                "offer": { "type": "offer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let text = r#"{
            "type": "ice-candidate",
            "peer_id": "you",
            "target_peer": "me",
            "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0 }
        }"#;
        let msg = SignalingMessage::from_json(text).unwrap();
        match msg {
            SignalingMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn conversation_messages_use_underscores() {
        let msg = SignalingMessage::StartConversation {
            user_id: "me".into(),
        };
        assert_eq!(
            to_value(&msg),
            json!({ "type": "start_conversation", "user_id": "me" })
        );
        assert_eq!(msg.kind(), "start_conversation");
    }

    #[test]
    fn server_disconnect_without_peer_id_parses() {
        let msg = SignalingMessage::from_json(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(msg, SignalingMessage::Disconnect { peer_id: None });
    }

    #[test]
    fn server_error_reply_is_reported() {
        let err = SignalingMessage::from_json(r#"{"error":"Invalid message type"}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ServerReported("Invalid message type".into())
        );
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = SignalingMessage::from_json(r#"{"type":"register","peer_id":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = SignalingMessage::from_json("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn target_peer_only_for_routed_messages() {
        let answer = SignalingMessage::Answer {
            peer_id: "a".into(),
            target_peer: "b".into(),
            answer: SessionDescription::answer("v=0"),
        };
        assert_eq!(answer.target_peer(), Some("b"));
        assert_eq!(
            SignalingMessage::EndConversation { user_id: "a".into() }.target_peer(),
            None
        );
    }
}
