//! One logical connection to a remote peer
//!
//! Owns the application handshake, the transport and the middleware
//! pipeline, and walks the stage machine:
//!
//! negotiating -> connecting -> connected <-> pinging -> reconnecting | disconnected
//!
//! A disconnected connection is never reused; the connector creates a fresh
//! one instead.

use meshlink_config::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::discovery::{GossipMessage, PeerInfo};
use crate::error::MeshError;
use crate::events::MeshEvent;
use crate::identity::{is_polite, Identity};
use crate::middleware::{ContextDeps, OutgoingFile, PeerContext, PeerControl, Pipeline};
use crate::negotiation::{NegotiationManager, ReconnectHook};
use crate::signaling::Signaler;
use crate::transport::{EngineFactory, RtcState};
use crate::types::{
    short_id, CandidateType, ConnectionStage, Direction, NegotiationPackage, SignalPayload,
    APP_VERSION,
};
use crate::webrtc_peer::{TransportEvent, WebRTCPeerConnection};

/// Collaborators shared by every connection of a node
#[derive(Clone)]
pub struct ConnectionDeps {
    pub identity: Arc<Identity>,
    pub config: Arc<Config>,
    pub signaler: Arc<dyn Signaler>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub events: broadcast::Sender<MeshEvent>,
    pub gossip: mpsc::UnboundedSender<GossipMessage>,
    pub nickname: watch::Receiver<Option<String>>,
}

impl ConnectionDeps {
    fn context_deps(&self) -> ContextDeps {
        ContextDeps {
            identity: self.identity.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            gossip: self.gossip.clone(),
            nickname: self.nickname.clone(),
        }
    }
}

/// Notifications from a connection to its connector
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionReport {
    StageChanged {
        peer_id: String,
        connection_id: u64,
        stage: ConnectionStage,
        block: bool,
        error: bool,
    },
    /// The remote started a new session; this connection should be replaced
    Reconnect {
        peer_id: String,
        connection_id: u64,
        package: NegotiationPackage,
    },
}

pub struct PeerConnection {
    id: u64,
    target_peer_id: String,
    direction: Direction,
    polite: bool,
    deps: ConnectionDeps,
    negotiation: NegotiationManager,
    stage: watch::Sender<ConnectionStage>,
    reports: mpsc::UnboundedSender<ConnectionReport>,
    transport: OnceLock<Arc<WebRTCPeerConnection>>,
    pipeline: OnceLock<Arc<Pipeline>>,
    negotiation_tx: mpsc::UnboundedSender<NegotiationPackage>,
    negotiation_rx: Mutex<Option<mpsc::UnboundedReceiver<NegotiationPackage>>>,
    // signals arriving before the transport exists wait here
    signal_tx: mpsc::UnboundedSender<SignalPayload>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalPayload>>>,
    candidate_type: OnceLock<CandidateType>,
    disconnected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl PeerConnection {
    pub fn new(
        id: u64,
        target_peer_id: &str,
        direction: Direction,
        deps: ConnectionDeps,
        reports: mpsc::UnboundedSender<ConnectionReport>,
    ) -> Arc<Self> {
        let polite = is_polite(deps.identity.peer_id(), target_peer_id);
        let negotiation = NegotiationManager::new(
            target_peer_id,
            polite,
            APP_VERSION,
            deps.signaler.clone(),
            Some(reconnect_hook(id, target_peer_id, reports.clone())),
        );
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (stage, _) = watch::channel(ConnectionStage::Negotiating);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            id,
            target_peer_id: target_peer_id.to_string(),
            direction,
            polite,
            deps,
            negotiation,
            stage,
            reports,
            transport: OnceLock::new(),
            pipeline: OnceLock::new(),
            negotiation_tx,
            negotiation_rx: Mutex::new(Some(negotiation_rx)),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            candidate_type: OnceLock::new(),
            disconnected: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.target_peer_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn stage(&self) -> ConnectionStage {
        *self.stage.borrow()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<ConnectionStage> {
        self.stage.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.stage(),
            ConnectionStage::Connected | ConnectionStage::Pinging
        )
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Winning ICE candidate type, known once connected
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type.get().copied().unwrap_or_default()
    }

    pub fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.pipeline.get()
    }

    /// Queue a negotiation package from the signaler
    pub fn deliver_negotiation(&self, package: NegotiationPackage) {
        let _ = self.negotiation_tx.send(package);
    }

    /// Queue an SDP/ICE payload from the signaler
    pub fn deliver_signal(&self, payload: SignalPayload) {
        let _ = self.signal_tx.send(payload);
    }

    /// Run the handshake and bring up the transport.
    ///
    /// Returns `Ok(false)` when the handshake was rejected or the connection
    /// was torn down meanwhile; the caller is expected to disconnect.
    pub async fn connect(
        self: &Arc<Self>,
        incoming: Option<NegotiationPackage>,
    ) -> Result<bool, MeshError> {
        self.arm_connecting_timeout();
        self.spawn_negotiation_pump().await;
        self.announce(ConnectionStage::Negotiating, false, false);

        let Some(offer) = self.negotiation.start(incoming).await else {
            debug!(
                "Negotiation with {} did not succeed",
                short_id(&self.target_peer_id)
            );
            return Ok(false);
        };
        if self.is_disconnected() {
            return Ok(false);
        }
        debug!(
            "Session {} agreed with {}",
            offer.session_id,
            short_id(&self.target_peer_id)
        );
        self.transition(ConnectionStage::Negotiating, ConnectionStage::Connecting);

        let opened = WebRTCPeerConnection::open(
            self.deps.identity.peer_id(),
            &self.target_peer_id,
            self.polite,
            self.deps.engine_factory.as_ref(),
            self.deps.signaler.clone(),
            self.deps.config.chunk.unordered_low_threshold,
        )
        .await;
        let (transport, transport_events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.teardown(false, true, false).await;
                return Err(e.into());
            }
        };
        let _ = self.transport.set(transport.clone());

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let ctx = PeerContext::new(
            &self.target_peer_id,
            self.deps.context_deps(),
            transport.channels().clone(),
            control_tx,
        );
        let pipeline = Arc::new(Pipeline::new(Arc::new(ctx)));
        let _ = self.pipeline.set(pipeline.clone());

        // torn down while the transport was being created
        if self.is_disconnected() {
            transport.close().await;
            return Ok(false);
        }

        self.spawn_signal_pump(transport.clone()).await;
        tokio::spawn(self.clone().control_loop(control_rx));
        tokio::spawn(self.clone().event_loop(transport_events, pipeline));
        Ok(true)
    }

    /// Ping for liveness. Only valid while connected.
    pub async fn ping(&self) -> Option<Duration> {
        let pipeline = self.pipeline.get()?;
        if !self.transition(ConnectionStage::Connected, ConnectionStage::Pinging) {
            return None;
        }
        let rtt = pipeline.ping().ping().await;
        self.transition(ConnectionStage::Pinging, ConnectionStage::Connected);
        rtt
    }

    /// Liveness check that waits out a ping already in flight
    pub async fn check_alive(&self) -> Option<Duration> {
        let mut stage = self.stage.subscribe();
        let settled = {
            let settled = stage.wait_for(|s| *s != ConnectionStage::Pinging).await;
            settled.map(|s| *s)
        };
        match settled {
            Ok(ConnectionStage::Connected) => self.ping().await,
            _ => None,
        }
    }

    /// Close the connection and report it once. A plain disconnect notifies
    /// the remote so it does not try to reconnect.
    pub async fn disconnect(&self, block: bool, error: bool) {
        self.teardown(block, error, !block && !error).await;
    }

    /// Close this connection in favour of a new session with the same peer
    pub async fn begin_reconnect(&self) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Peer {} started a new session", short_id(&self.target_peer_id));
        self.shutdown.send_replace(true);
        self.negotiation.cancel().await;
        if let Some(transport) = self.transport.get() {
            transport.close().await;
        }
        self.force_stage(ConnectionStage::Reconnecting, false, false);
        true
    }

    pub async fn send_text(&self, text: &str) -> Result<(), MeshError> {
        Ok(self.usable_pipeline()?.text().send(text).await?)
    }

    /// Queue a file; returns its id
    pub async fn send_file(&self, file: OutgoingFile) -> Result<String, MeshError> {
        Ok(self.usable_pipeline()?.file_transfer().send_file(file).await)
    }

    pub async fn set_typing(&self, typing: bool) -> Result<(), MeshError> {
        Ok(self.usable_pipeline()?.typing().send(typing).await?)
    }

    pub async fn send_nickname(&self, nickname: &str) -> Result<(), MeshError> {
        Ok(self.usable_pipeline()?.nickname().send(nickname).await?)
    }

    pub async fn send_peer_map(&self, records: &[PeerInfo]) -> Result<(), MeshError> {
        Ok(self.usable_pipeline()?.discovery().send_peer_map(records).await?)
    }

    /// Pipeline of a connected, verified peer
    fn usable_pipeline(&self) -> Result<&Arc<Pipeline>, MeshError> {
        let pipeline = match self.pipeline.get() {
            Some(pipeline) if self.is_connected() => pipeline,
            _ => return Err(MeshError::NotConnected(self.target_peer_id.clone())),
        };
        if pipeline.is_blocked() {
            return Err(MeshError::Blocked(self.target_peer_id.clone()));
        }
        Ok(pipeline)
    }

    async fn teardown(&self, block: bool, error: bool, notify_remote: bool) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "Disconnecting {} (block: {}, error: {})",
            short_id(&self.target_peer_id),
            block,
            error
        );
        self.shutdown.send_replace(true);
        self.negotiation.cancel().await;

        if notify_remote {
            if let Some(pipeline) = self.pipeline.get() {
                if let Err(e) = pipeline.disconnect().notify().await {
                    debug!(
                        "Could not notify {} of disconnect: {}",
                        short_id(&self.target_peer_id),
                        e
                    );
                }
            }
        }
        if let Some(transport) = self.transport.get() {
            transport.close().await;
        }
        self.force_stage(ConnectionStage::Disconnected, block, error);
    }

    fn arm_connecting_timeout(self: &Arc<Self>) {
        let timeout = self.deps.config.timeouts.connecting_timeout();
        let mut stage = self.stage.subscribe();
        let connection = self.clone();
        tokio::spawn(async move {
            let settled = async {
                stage
                    .wait_for(|s| *s != ConnectionStage::Negotiating && *s != ConnectionStage::Connecting)
                    .await
                    .is_ok()
            };
            if tokio::time::timeout(timeout, settled).await.is_err() {
                warn!(
                    "Connection to {} timed out",
                    short_id(&connection.target_peer_id)
                );
                connection.teardown(false, true, false).await;
            }
        });
    }

    async fn spawn_negotiation_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.negotiation_rx.lock().await.take() else {
            return;
        };
        let connection = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let package = tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => break,
                    package = rx.recv() => match package {
                        Some(package) => package,
                        None => break,
                    },
                };
                connection.negotiation.handle_package(package).await;
            }
        });
    }

    async fn spawn_signal_pump(&self, transport: Arc<WebRTCPeerConnection>) {
        let Some(mut rx) = self.signal_rx.lock().await.take() else {
            return;
        };
        let target = self.target_peer_id.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => break,
                    payload = rx.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                };
                if let Err(e) = transport.handle_signal(payload).await {
                    warn!("Signal from {} failed: {}", short_id(&target), e);
                }
            }
        });
    }

    async fn control_loop(self: Arc<Self>, mut control: mpsc::UnboundedReceiver<PeerControl>) {
        let mut shutdown = self.shutdown.subscribe();
        let request = tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return,
            request = control.recv() => request,
        };
        if let Some(PeerControl::Disconnect {
            block,
            error,
            notify_remote,
        }) = request
        {
            self.teardown(block, error, notify_remote).await;
        }
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        pipeline: Arc<Pipeline>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::StateChanged(RtcState::Connected) => {
                    tokio::spawn(self.clone().on_transport_connected(pipeline.clone()));
                }
                TransportEvent::StateChanged(state) if state.is_final_failure() => {
                    warn!(
                        "Transport to {} ended: {:?}",
                        short_id(&self.target_peer_id),
                        state
                    );
                    self.teardown(false, true, false).await;
                    break;
                }
                TransportEvent::StateChanged(state) => {
                    debug!(
                        "Transport to {} is {:?}",
                        short_id(&self.target_peer_id),
                        state
                    );
                }
                TransportEvent::ChannelOpen(kind) => {
                    debug!("Channel {} to {} open", kind, short_id(&self.target_peer_id));
                    pipeline.on_channel_open(kind).await;
                }
                TransportEvent::ChannelClosed(kind) => {
                    debug!(
                        "Channel {} to {} closed",
                        kind,
                        short_id(&self.target_peer_id)
                    );
                }
                TransportEvent::Message(kind, frame) => pipeline.on_frame(kind, frame).await,
            }
        }
    }

    /// Transport is up; the peer counts as connected once every handler
    /// finished initializing.
    async fn on_transport_connected(self: Arc<Self>, pipeline: Arc<Pipeline>) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return,
            _ = pipeline.wait_initialized() => {}
        }

        if let Some(transport) = self.transport.get() {
            let candidate_type = transport.selected_candidate_type().await;
            let _ = self.candidate_type.set(candidate_type);
        }
        if self.transition(ConnectionStage::Connecting, ConnectionStage::Connected) {
            info!(
                "Connected to {} ({})",
                short_id(&self.target_peer_id),
                self.candidate_type()
            );
        }
    }

    /// Move `from` -> `to`; false if the connection was elsewhere
    fn transition(&self, from: ConnectionStage, to: ConnectionStage) -> bool {
        let moved = self.stage.send_if_modified(|stage| {
            if *stage == from {
                *stage = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.announce(to, false, false);
        }
        moved
    }

    fn force_stage(&self, stage: ConnectionStage, block: bool, error: bool) {
        self.stage.send_replace(stage);
        self.announce(stage, block, error);
    }

    fn announce(&self, stage: ConnectionStage, block: bool, error: bool) {
        debug!("Peer {} is {}", short_id(&self.target_peer_id), stage);
        let _ = self.deps.events.send(MeshEvent::PeerConnectionChanged {
            peer_id: self.target_peer_id.clone(),
            stage,
        });
        let _ = self.reports.send(ConnectionReport::StageChanged {
            peer_id: self.target_peer_id.clone(),
            connection_id: self.id,
            stage,
            block,
            error,
        });
    }
}

/// Late fresh offers (a session other than the confirmed one) ask the
/// connector to replace the connection.
fn reconnect_hook(
    connection_id: u64,
    target_peer_id: &str,
    reports: mpsc::UnboundedSender<ConnectionReport>,
) -> ReconnectHook {
    let peer_id = target_peer_id.to_string();
    Box::new(move |package, confirmed| {
        let NegotiationPackage::Offer(offer) = &package else {
            return;
        };
        let fresh = confirmed.map_or(true, |c| c.session_id != offer.session_id);
        if fresh {
            let _ = reports.send(ConnectionReport::Reconnect {
                peer_id: peer_id.clone(),
                connection_id,
                package,
            });
        }
    })
}
