//! RTC engine abstraction
//!
//! Defines traits for the underlying WebRTC engine and its data channels so
//! the perfect-negotiation logic can run over both the real `webrtc` stack
//! and the in-memory mock.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::SignalError;
use crate::types::{CandidateType, ChannelKind, Frame, IceCandidate, SessionDescription};

/// Errors from transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),
    #[error("Channel {0} is not open")]
    ChannelNotOpen(ChannelKind),
    #[error("Disconnected")]
    Disconnected,
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// RTCSignalingState subset used by perfect negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// RTCPeerConnectionState
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl RtcState {
    /// States after which the connection never recovers
    pub fn is_final_failure(self) -> bool {
        matches!(self, RtcState::Failed | RtcState::Closed)
    }
}

/// Parameters of one negotiated data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub kind: ChannelKind,
    pub id: u16,
    pub label: &'static str,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub buffered_amount_low_threshold: usize,
}

impl ChannelSpec {
    pub fn for_kind(kind: ChannelKind, unordered_low_threshold: usize) -> Self {
        let (ordered, max_retransmits, threshold) = match kind {
            ChannelKind::Reliable => (true, None, 0),
            ChannelKind::Unordered => (false, None, unordered_low_threshold),
            ChannelKind::Unreliable => (false, Some(0), 0),
        };
        Self {
            kind,
            id: kind.id(),
            label: kind.label(),
            ordered,
            max_retransmits,
            buffered_amount_low_threshold: threshold,
        }
    }
}

/// Events emitted by an engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    NegotiationNeeded,
    /// `None` marks end of gathering
    IceCandidate(Option<IceCandidate>),
    StateChanged(RtcState),
    ChannelOpen(ChannelKind),
    ChannelClosed(ChannelKind),
    Message(ChannelKind, Frame),
}

/// Data channel for peer-to-peer communication
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Send one frame to the peer
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Bytes queued but not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    fn buffered_amount_low_threshold(&self) -> usize;

    /// Resolve once `buffered_amount <= buffered_amount_low_threshold`
    async fn wait_buffered_amount_low(&self) {
        while self.is_open() && self.buffered_amount().await > self.buffered_amount_low_threshold()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Underlying ICE/SDP engine of one peer connection
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// createOffer + setLocalDescription
    async fn create_and_set_offer(&self) -> Result<SessionDescription, TransportError>;

    /// createAnswer + setLocalDescription
    async fn create_and_set_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Roll back a local offer
    async fn rollback(&self) -> Result<(), TransportError>;

    /// `None` signals end-of-candidates
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>)
        -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    /// Create a negotiated (`negotiated: true`, fixed id) data channel
    async fn open_channel(&self, spec: ChannelSpec) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn selected_candidate_type(&self) -> CandidateType;

    async fn close(&self);
}

/// Creates engines, one per peer connection
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        local_peer_id: &str,
        target_peer_id: &str,
    ) -> Result<(Arc<dyn RtcEngine>, mpsc::UnboundedReceiver<EngineEvent>), TransportError>;
}
