//! Shared types for the meshlink protocol stack

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version advertised in negotiation offers
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shortened peer id for log lines
pub fn short_id(peer_id: &str) -> &str {
    peer_id.get(..8).unwrap_or(peer_id)
}

/// Lifecycle stage of a single peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStage {
    Negotiating,
    Connecting,
    Connected,
    Pinging,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStage::Negotiating => "negotiating",
            ConnectionStage::Connecting => "connecting",
            ConnectionStage::Connected => "connected",
            ConnectionStage::Pinging => "pinging",
            ConnectionStage::Reconnecting => "reconnecting",
            ConnectionStage::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// Who initiated a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// The three negotiated data channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    /// Ordered, retransmitting: control, text and handshakes
    Reliable,
    /// Unordered, retransmitting: bulk binary
    Unordered,
    /// Unordered, no retransmits: ephemeral signals
    Unreliable,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Reliable,
        ChannelKind::Unordered,
        ChannelKind::Unreliable,
    ];

    /// Out-of-band negotiated channel id
    pub fn id(self) -> u16 {
        match self {
            ChannelKind::Reliable => 1,
            ChannelKind::Unordered => 2,
            ChannelKind::Unreliable => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Reliable => "reliable",
            ChannelKind::Unordered => "unordered",
            ChannelKind::Unreliable => "unreliable",
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One data channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Text frame wire format: `{"type": string, "data": any}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Application-level offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDescription {
    pub session_id: String,
    pub app_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerDescription {
    pub confirmed: bool,
}

/// `{"offer":{"sessionId","appVersion"}}` or `{"answer":{"confirmed"}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationPackage {
    Offer(OfferDescription),
    Answer(AnswerDescription),
}

impl NegotiationPackage {
    pub fn answer(confirmed: bool) -> Self {
        NegotiationPackage::Answer(AnswerDescription { confirmed })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP blob exchanged through the signaler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// ICE candidate in its browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// SDP/ICE relay payload: `{"description":{..}}` or `{"candidate":{..}|null}`
///
/// A `null` candidate marks end-of-gathering and is forwarded like any other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(Option<IceCandidate>),
}

/// Type of the local candidate in the selected ICE pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
    #[default]
    Unknown,
}

impl CandidateType {
    pub fn is_relayed(self) -> bool {
        self == CandidateType::Relay
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_package_wire_format() {
        let offer = NegotiationPackage::Offer(OfferDescription {
            session_id: "abc".to_string(),
            app_version: "1.2.3".to_string(),
        });
        let json = serde_json::to_string(&offer).unwrap();
        assert_eq!(json, r#"{"offer":{"sessionId":"abc","appVersion":"1.2.3"}}"#);

        let answer = NegotiationPackage::answer(false);
        let json = serde_json::to_string(&answer).unwrap();
        assert_eq!(json, r#"{"answer":{"confirmed":false}}"#);

        let parsed: NegotiationPackage =
            serde_json::from_str(r#"{"answer":{"confirmed":true}}"#).unwrap();
        assert_eq!(parsed, NegotiationPackage::answer(true));
    }

    #[test]
    fn test_null_candidate_is_kept_on_the_wire() {
        let end = SignalPayload::Candidate(None);
        let json = serde_json::to_string(&end).unwrap();
        assert_eq!(json, r#"{"candidate":null}"#);

        let parsed: SignalPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SignalPayload::Candidate(None));
    }

    #[test]
    fn test_envelope_without_data() {
        let env: Envelope = serde_json::from_str(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(env.kind, "disconnect");
        assert!(env.data.is_null());
    }

    #[test]
    fn test_channel_ids() {
        assert_eq!(ChannelKind::Reliable.id(), 1);
        assert_eq!(ChannelKind::Unordered.id(), 2);
        assert_eq!(ChannelKind::Unreliable.id(), 3);
        assert_eq!(ChannelKind::from_id(2), Some(ChannelKind::Unordered));
        assert_eq!(ChannelKind::from_id(7), None);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
