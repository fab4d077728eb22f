//! Signaling wire format: JSON frames exchanged with the session room socket.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Backend user identity.
pub type UserId = u64;

/// Frames the client sends to the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Always the first frame on a fresh connection.
    Auth { token: String },
    WebrtcSignal {
        target_user_id: UserId,
        signal: PeerSignal,
    },
    ChatMessage { message: String },
    HandRaise { hand_raised: bool },
    ParticipantState {
        audio_enabled: bool,
        video_enabled: bool,
    },
    ScreenShare { screen_sharing: bool },
}

/// Frames the room delivers to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    UserJoined {
        user_id: UserId,
        #[serde(default)]
        user_name: String,
    },
    UserLeft { user_id: UserId },
    WebrtcSignal {
        from_user_id: UserId,
        signal: PeerSignal,
    },
    ChatMessage {
        user_id: UserId,
        #[serde(default)]
        user_name: String,
        message: String,
    },
    ParticipantStateUpdate {
        user_id: UserId,
        audio_enabled: bool,
        video_enabled: bool,
    },
    HandRaiseUpdate { user_id: UserId, hand_raised: bool },
    ScreenShareUpdate { user_id: UserId, screen_sharing: bool },
    /// Any frame type this client does not know yet.
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// The user the frame is about, if any.
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            InboundFrame::UserJoined { user_id, .. }
            | InboundFrame::UserLeft { user_id }
            | InboundFrame::ChatMessage { user_id, .. }
            | InboundFrame::ParticipantStateUpdate { user_id, .. }
            | InboundFrame::HandRaiseUpdate { user_id, .. }
            | InboundFrame::ScreenShareUpdate { user_id, .. } => Some(*user_id),
            InboundFrame::WebrtcSignal { from_user_id, .. } => Some(*from_user_id),
            InboundFrame::Unknown => None,
        }
    }
}

/// SDP description type carried in a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE candidate in browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Negotiation payload relayed between two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerSignal {
    Description {
        #[serde(rename = "type")]
        kind: SdpKind,
        sdp: String,
    },
    Candidate { candidate: IceCandidate },
    /// Asks the initiating side to send a fresh offer.
    Renegotiate { renegotiate: bool },
}

impl PeerSignal {
    pub fn offer(sdp: impl Into<String>) -> Self {
        PeerSignal::Description {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        PeerSignal::Description {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn renegotiate() -> Self {
        PeerSignal::Renegotiate { renegotiate: true }
    }
}

/// Parse one inbound text frame.
///
/// Malformed JSON and known frame types with bad fields are logged and dropped
/// (`None`). Unknown frame types are ignored at debug level.
pub fn parse_inbound(text: &str) -> Option<InboundFrame> {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(InboundFrame::Unknown) => {
            debug!("Ignoring unknown signaling frame: {}", text);
            None
        }
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Dropping malformed signaling frame: {}", e);
            None
        }
    }
}

/// Serialize one outbound frame to its wire text.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
