//! Perfect negotiation over an [`RtcEngine`]
//!
//! Roles are fixed by peer id ordering. The impolite peer originates offers
//! and drops colliding incoming offers; the polite peer rolls back its own
//! offer and answers. Both sides open the same three negotiated channels, so
//! no channel announcement ever crosses the signaler.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::signaling::Signaler;
use crate::transport::{
    ChannelSpec, DataChannel, EngineEvent, EngineFactory, RtcEngine, RtcState, SignalingState,
    TransportError,
};
use crate::types::{
    short_id, CandidateType, ChannelKind, Frame, IceCandidate, SdpKind, SessionDescription,
    SignalPayload,
};

/// Events surfaced to the owning peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(RtcState),
    ChannelOpen(ChannelKind),
    ChannelClosed(ChannelKind),
    Message(ChannelKind, Frame),
}

#[derive(Default)]
struct NegotiationFlags {
    ignore_offer: bool,
    has_remote_description: bool,
    /// At least one offer/answer exchange completed
    negotiated: bool,
    pending_candidates: Vec<Option<IceCandidate>>,
}

pub struct WebRTCPeerConnection {
    target_peer_id: String,
    polite: bool,
    engine: Arc<dyn RtcEngine>,
    signaler: Arc<dyn Signaler>,
    channels: HashMap<ChannelKind, Arc<dyn DataChannel>>,
    // Offer creation and remote descriptions run under this lock, so a local
    // offer in flight is always visible as have-local-offer.
    flags: Mutex<NegotiationFlags>,
    shutdown: watch::Sender<bool>,
}

impl WebRTCPeerConnection {
    /// Create the engine and the three negotiated channels, then start
    /// processing engine events.
    pub async fn open(
        local_peer_id: &str,
        target_peer_id: &str,
        polite: bool,
        factory: &dyn EngineFactory,
        signaler: Arc<dyn Signaler>,
        unordered_low_threshold: usize,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (engine, engine_events) = factory.create(local_peer_id, target_peer_id).await?;

        let mut channels = HashMap::new();
        for kind in ChannelKind::ALL {
            let spec = ChannelSpec::for_kind(kind, unordered_low_threshold);
            match engine.open_channel(spec).await {
                Ok(channel) => {
                    channels.insert(kind, channel);
                }
                Err(e) => {
                    engine.close().await;
                    return Err(e);
                }
            }
        }

        let (shutdown, _) = watch::channel(false);
        let connection = Arc::new(Self {
            target_peer_id: target_peer_id.to_string(),
            polite,
            engine,
            signaler,
            channels,
            flags: Mutex::new(NegotiationFlags::default()),
            shutdown,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.clone().run(engine_events, tx));
        Ok((connection, rx))
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn channels(&self) -> &HashMap<ChannelKind, Arc<dyn DataChannel>> {
        &self.channels
    }

    pub async fn selected_candidate_type(&self) -> CandidateType {
        self.engine.selected_candidate_type().await
    }

    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        for channel in self.channels.values() {
            channel.close().await;
        }
        self.engine.close().await;
    }

    async fn run(
        self: Arc<Self>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        out: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = engine_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let forwarded = match event {
                EngineEvent::NegotiationNeeded => {
                    if let Err(e) = self.on_negotiation_needed().await {
                        warn!("Peer {} offer failed: {}", short_id(&self.target_peer_id), e);
                    }
                    None
                }
                EngineEvent::IceCandidate(candidate) => {
                    self.forward_candidate(candidate).await;
                    None
                }
                EngineEvent::StateChanged(state) => {
                    debug!(
                        "Peer {} transport state: {:?}",
                        short_id(&self.target_peer_id),
                        state
                    );
                    Some(TransportEvent::StateChanged(state))
                }
                EngineEvent::ChannelOpen(kind) => Some(TransportEvent::ChannelOpen(kind)),
                EngineEvent::ChannelClosed(kind) => Some(TransportEvent::ChannelClosed(kind)),
                EngineEvent::Message(kind, frame) => Some(TransportEvent::Message(kind, frame)),
            };

            if let Some(event) = forwarded {
                if out.send(event).is_err() {
                    break;
                }
            }
        }
    }

    async fn on_negotiation_needed(&self) -> Result<(), TransportError> {
        let flags = self.flags.lock().await;

        if self.polite && !flags.negotiated {
            debug!(
                "Peer {} negotiation needed, waiting for impolite offer",
                short_id(&self.target_peer_id)
            );
            return Ok(());
        }
        if self.engine.signaling_state() != SignalingState::Stable {
            debug!(
                "Peer {} negotiation needed while outstanding, skipping",
                short_id(&self.target_peer_id)
            );
            return Ok(());
        }

        let offer = self.engine.create_and_set_offer().await?;
        self.signaler
            .send(&self.target_peer_id, SignalPayload::Description(offer))
            .await?;
        Ok(())
    }

    async fn forward_candidate(&self, candidate: Option<IceCandidate>) {
        if candidate.is_none() {
            debug!("Peer {} end of candidates", short_id(&self.target_peer_id));
        }
        if let Err(e) = self
            .signaler
            .send(&self.target_peer_id, SignalPayload::Candidate(candidate))
            .await
        {
            warn!(
                "Failed to send ICE candidate to {}: {}",
                short_id(&self.target_peer_id),
                e
            );
        }
    }

    /// Handle a relayed description or candidate from the remote peer
    pub async fn handle_signal(&self, payload: SignalPayload) -> Result<(), TransportError> {
        match payload {
            SignalPayload::Description(desc) => self.handle_description(desc).await,
            SignalPayload::Candidate(candidate) => self.handle_candidate(candidate).await,
        }
    }

    async fn handle_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut flags = self.flags.lock().await;

        let offer_collision = desc.kind == SdpKind::Offer
            && self.engine.signaling_state() != SignalingState::Stable;
        flags.ignore_offer = !self.polite && offer_collision;
        if flags.ignore_offer {
            debug!(
                "Peer {} offer collision, keeping our own offer",
                short_id(&self.target_peer_id)
            );
            return Ok(());
        }

        if offer_collision {
            debug!(
                "Peer {} offer collision, rolling back",
                short_id(&self.target_peer_id)
            );
            self.engine.rollback().await?;
        }

        let kind = desc.kind;
        self.engine.set_remote_description(desc).await?;
        flags.has_remote_description = true;

        if kind == SdpKind::Offer {
            let answer = self.engine.create_and_set_answer().await?;
            self.signaler
                .send(&self.target_peer_id, SignalPayload::Description(answer))
                .await?;
        }
        flags.negotiated = true;

        let pending: Vec<_> = flags.pending_candidates.drain(..).collect();
        if !pending.is_empty() {
            info!(
                "Peer {} applying {} queued candidates",
                short_id(&self.target_peer_id),
                pending.len()
            );
        }
        for candidate in pending {
            if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                warn!(
                    "Peer {} queued candidate rejected: {}",
                    short_id(&self.target_peer_id),
                    e
                );
            }
        }
        Ok(())
    }

    async fn handle_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), TransportError> {
        let mut flags = self.flags.lock().await;
        if !flags.has_remote_description {
            flags.pending_candidates.push(candidate);
            return Ok(());
        }

        match self.engine.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            // candidates of an offer we ignored are expected to fail
            Err(_) if flags.ignore_offer => Ok(()),
            Err(e) => Err(e),
        }
    }
}
