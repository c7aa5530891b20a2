//! `webrtc` crate backed engine
//!
//! Wraps an `RTCPeerConnection` so it can drive [`WebRTCPeerConnection`].
//! All callbacks translate into [`EngineEvent`]s; work happens inside the
//! returned futures.
//!
//! [`WebRTCPeerConnection`]: crate::webrtc_peer::WebRTCPeerConnection

use async_trait::async_trait;
use meshlink_config::RtcConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::transport::{
    ChannelSpec, DataChannel, EngineEvent, EngineFactory, RtcEngine, RtcState, SignalingState,
    TransportError,
};
use crate::types::{
    short_id, CandidateType, ChannelKind, Frame, IceCandidate, SdpKind, SessionDescription,
};

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

/// Creates `webrtc` engines from the node's RTC settings
pub struct WebRtcEngineFactory {
    config: RtcConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        if let Some(turn) = &self.config.turn {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        _local_peer_id: &str,
        target_peer_id: &str,
    ) -> Result<(Arc<dyn RtcEngine>, mpsc::UnboundedReceiver<EngineEvent>), TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(failed)?);

        let (events, rx) = mpsc::unbounded_channel();
        let engine = WebRtcEngine {
            pc,
            target_peer_id: target_peer_id.to_string(),
            events,
        };
        engine.install_handlers();
        Ok((Arc::new(engine), rx))
    }
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    target_peer_id: String,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl WebRtcEngine {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::NegotiationNeeded);
            })
        }));

        let events = self.events.clone();
        let peer = short_id(&self.target_peer_id).to_string();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let candidate = match candidate.map(|c| c.to_json()) {
                        Some(Ok(init)) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Some(Err(e)) => {
                            warn!("Peer {} bad local candidate: {}", peer, e);
                            return;
                        }
                        None => None,
                    };
                    let _ = events.send(EngineEvent::IceCandidate(candidate));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                            RtcState::New
                        }
                        RTCPeerConnectionState::Connecting => RtcState::Connecting,
                        RTCPeerConnectionState::Connected => RtcState::Connected,
                        RTCPeerConnectionState::Disconnected => RtcState::Disconnected,
                        RTCPeerConnectionState::Failed => RtcState::Failed,
                        RTCPeerConnectionState::Closed => RtcState::Closed,
                    };
                    let _ = events.send(EngineEvent::StateChanged(state));
                })
            }));
    }

    async fn set_local(&self, desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        self.pc.set_local_description(desc).await.map_err(failed)?;
        // the stored description reflects any munging done while applying it
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::InvalidState("no local description".to_string()))?;
        to_session_description(local)
    }
}

fn to_session_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::InvalidState(format!(
                "unexpected local description {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

/// Type of the local candidate, read from the pair's `(local) proto type addr`
/// rendering
fn parse_local_candidate_type(pair: &str) -> CandidateType {
    let local = pair
        .trim_start_matches("(local)")
        .split("<->")
        .next()
        .unwrap_or_default();
    match local.split_whitespace().nth(1) {
        Some("host") => CandidateType::Host,
        Some("srflx") => CandidateType::Srflx,
        Some("prflx") => CandidateType::Prflx,
        Some("relay") => CandidateType::Relay,
        _ => CandidateType::Unknown,
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_and_set_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(failed)?;
        self.set_local(offer).await
    }

    async fn create_and_set_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(failed)?;
        self.set_local(answer).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(failed)?;
        self.pc.set_remote_description(desc).await.map_err(failed)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await.map_err(failed)
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), TransportError> {
        // an empty candidate string marks end-of-candidates
        let init = match candidate {
            Some(candidate) => RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            },
            None => RTCIceCandidateInit::default(),
        };
        self.pc.add_ice_candidate(init).await.map_err(failed)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(spec.ordered),
            max_retransmits: spec.max_retransmits,
            negotiated: Some(spec.id),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(spec.label, Some(init))
            .await
            .map_err(failed)?;

        let kind = spec.kind;
        let low = Arc::new(Notify::new());
        dc.set_buffered_amount_low_threshold(spec.buffered_amount_low_threshold)
            .await;
        let notify = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notify_waiters();
            })
        }))
        .await;

        let events = self.events.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::ChannelOpen(kind));
            })
        }));

        let events = self.events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::ChannelClosed(kind));
            })
        }));

        let events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => Frame::Text(text),
                        Err(_) => {
                            warn!("Invalid UTF-8 text frame on channel {}", kind);
                            return;
                        }
                    }
                } else {
                    Frame::Binary(msg.data)
                };
                let _ = events.send(EngineEvent::Message(kind, frame));
            })
        }));

        Ok(Arc::new(WebRtcDataChannel {
            dc,
            kind,
            threshold: spec.buffered_amount_low_threshold,
            low,
        }))
    }

    async fn selected_candidate_type(&self) -> CandidateType {
        let pair = self
            .pc
            .sctp()
            .transport()
            .ice_transport()
            .get_selected_candidate_pair()
            .await;
        match pair {
            Some(pair) => parse_local_candidate_type(&pair.to_string()),
            None => CandidateType::Unknown,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(
                "Closing connection to {} failed: {}",
                short_id(&self.target_peer_id),
                e
            );
        }
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    kind: ChannelKind,
    threshold: usize,
    low: Arc<Notify>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let sent = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        sent.map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.threshold
    }

    async fn wait_buffered_amount_low(&self) {
        while self.is_open() && self.buffered_amount().await > self.threshold {
            // the notification can race the check, so re-check periodically
            let _ = tokio::time::timeout(Duration::from_millis(100), self.low.notified()).await;
        }
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

impl std::fmt::Debug for WebRtcDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcDataChannel")
            .field("kind", &self.kind)
            .field("label", &self.dc.label())
            .finish()
    }
}
