//! Signaling message types
//!
//! One JSON object shape carries the offer, the answer and every trickled
//! candidate batch:
//!
//! ```json
//! {
//!   "id": "0b6c...",
//!   "description": { "type": "offer", "sdp": "v=0..." },
//!   "candidates": [ { "candidate": "candidate:...", "sdpMid": "0", "sdpMLineIndex": 0 } ],
//!   "configuration": { "iceServers": [ { "urls": ["stun:stun.l.google.com:19302"] } ] }
//! }
//! ```

use crate::config::IceServerConfig;
use serde::{Deserialize, Serialize};

/// Session identifier (UUID v4, hyphenated)
pub type SessionId = String;

/// Generate a new session id
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description, as exchanged by browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in `RTCIceCandidateInit` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    /// Media line index (`sdpMlineIndex` accepted on input)
    #[serde(rename = "sdpMLineIndex", alias = "sdpMlineIndex", default)]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_m_line_index,
            username_fragment: None,
        }
    }
}

/// Transport configuration carried alongside an offer or answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

impl RtcConfiguration {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

/// Signaling message
///
/// `description` and `configuration` always serialize (as `null` when
/// absent); `candidates` is omitted only when the sender has no list at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Session id; absent on an inbound offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,

    #[serde(default)]
    pub description: Option<SessionDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<IceCandidate>>,

    #[serde(default)]
    pub configuration: Option<RtcConfiguration>,
}

impl SignalingMessage {
    /// Outgoing offer: description and configuration, empty candidate list
    pub fn offer(id: SessionId, description: SessionDescription, configuration: RtcConfiguration) -> Self {
        Self {
            id: Some(id),
            description: Some(description),
            candidates: Some(Vec::new()),
            configuration: Some(configuration),
        }
    }

    /// Outgoing answer: the final local description, candidates embedded in its SDP
    pub fn answer(id: SessionId, description: SessionDescription, configuration: RtcConfiguration) -> Self {
        Self {
            id: Some(id),
            description: Some(description),
            candidates: None,
            configuration: Some(configuration),
        }
    }

    /// Candidate batch with no description or configuration
    pub fn trickle(id: SessionId, candidates: Vec<IceCandidate>) -> Self {
        Self {
            id: Some(id),
            description: None,
            candidates: Some(candidates),
            configuration: None,
        }
    }

    /// Candidates carried by the message, empty when absent
    pub fn candidate_list(&self) -> &[IceCandidate] {
        self.candidates.as_deref().unwrap_or(&[])
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }
}
