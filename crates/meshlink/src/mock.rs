//! Mock implementations for testing and simulation
//!
//! Provides an in-memory rendezvous hub and an in-memory RTC engine network
//! that stand in for a signaling server and real WebRTC.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::signaling::{PeerRegistration, SignalError, Signaler, SignalerEvent};
use crate::transport::{
    ChannelSpec, DataChannel, EngineEvent, EngineFactory, RtcEngine, RtcState, SignalingState,
    TransportError,
};
use crate::types::{
    CandidateType, ChannelKind, Frame, IceCandidate, NegotiationPackage, SdpKind,
    SessionDescription, SignalPayload,
};

// ============================================================================
// Mock Signaling
// ============================================================================

/// In-memory rendezvous: peer listing plus directed delivery
#[derive(Default)]
pub struct MockSignalingHub {
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<SignalerEvent>>>,
    registered: RwLock<Vec<String>>,
}

impl MockSignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a peer; it becomes visible to others once it registers
    pub async fn join(
        self: &Arc<Self>,
        peer_id: &str,
    ) -> (Arc<MockSignaler>, mpsc::UnboundedReceiver<SignalerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(peer_id.to_string(), tx);
        let signaler = Arc::new(MockSignaler {
            peer_id: peer_id.to_string(),
            hub: self.clone(),
            packages: Mutex::new(Vec::new()),
        });
        (signaler, rx)
    }

    /// Peer leaves the rendezvous and becomes unreachable through it
    pub async fn leave(&self, peer_id: &str) {
        self.unlist(peer_id).await;
        self.inboxes.write().await.remove(peer_id);
    }

    /// Peer drops out of the listing but can still receive relayed traffic
    pub async fn unlist(&self, peer_id: &str) {
        let removed = {
            let mut registered = self.registered.write().await;
            let before = registered.len();
            registered.retain(|p| p != peer_id);
            registered.len() != before
        };
        if removed {
            self.broadcast(peer_id, SignalerEvent::RemovedPeer(peer_id.to_string()))
                .await;
        }
    }

    /// Push the full listing to every registered peer
    pub async fn broadcast_peer_list(&self) {
        let registered = self.registered.read().await.clone();
        let inboxes = self.inboxes.read().await;
        for peer in &registered {
            if let Some(tx) = inboxes.get(peer) {
                let others = registered.iter().filter(|p| *p != peer).cloned().collect();
                let _ = tx.send(SignalerEvent::PeerList(others));
            }
        }
    }

    pub async fn registered_peers(&self) -> Vec<String> {
        self.registered.read().await.clone()
    }

    async fn register(&self, peer_id: &str) {
        let others = {
            let mut registered = self.registered.write().await;
            if registered.iter().any(|p| p == peer_id) {
                return;
            }
            let others: Vec<String> = registered.clone();
            registered.push(peer_id.to_string());
            others
        };

        if let Some(tx) = self.inboxes.read().await.get(peer_id) {
            let _ = tx.send(SignalerEvent::PeerList(others));
        }
        self.broadcast(peer_id, SignalerEvent::AddedPeer(peer_id.to_string()))
            .await;
    }

    async fn broadcast(&self, except: &str, event: SignalerEvent) {
        let registered = self.registered.read().await.clone();
        let inboxes = self.inboxes.read().await;
        for peer in registered.iter().filter(|p| *p != except) {
            if let Some(tx) = inboxes.get(peer) {
                let _ = tx.send(event.clone());
            }
        }
    }

    async fn deliver(&self, target: &str, event: SignalerEvent) -> Result<(), SignalError> {
        let inboxes = self.inboxes.read().await;
        let tx = inboxes
            .get(target)
            .ok_or_else(|| SignalError::PeerNotFound(target.to_string()))?;
        tx.send(event)
            .map_err(|e| SignalError::SendFailed(e.to_string()))
    }
}

/// Signaler handle of one peer on a [`MockSignalingHub`]
pub struct MockSignaler {
    peer_id: String,
    hub: Arc<MockSignalingHub>,
    packages: Mutex<Vec<(String, NegotiationPackage)>>,
}

impl MockSignaler {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Negotiation packages sent so far, with their targets
    pub async fn sent_packages(&self) -> Vec<(String, NegotiationPackage)> {
        self.packages.lock().await.clone()
    }
}

#[async_trait]
impl Signaler for MockSignaler {
    async fn register_peer(&self, registration: PeerRegistration) -> Result<(), SignalError> {
        self.hub.register(&registration.peer_id).await;
        Ok(())
    }

    async fn send_negotiation_package(
        &self,
        target_peer_id: &str,
        package: NegotiationPackage,
    ) -> Result<(), SignalError> {
        self.packages
            .lock()
            .await
            .push((target_peer_id.to_string(), package.clone()));
        self.hub
            .deliver(
                target_peer_id,
                SignalerEvent::Negotiation {
                    from: self.peer_id.clone(),
                    package,
                },
            )
            .await
    }

    async fn send(&self, target_peer_id: &str, payload: SignalPayload) -> Result<(), SignalError> {
        self.hub
            .deliver(
                target_peer_id,
                SignalerEvent::Signal {
                    from: self.peer_id.clone(),
                    payload,
                },
            )
            .await
    }
}

// ============================================================================
// Mock RTC Network
// ============================================================================

/// Links mock engines by `(local, remote)` and carries their channel traffic
pub struct MockNetwork {
    engines: RwLock<HashMap<(String, String), Arc<MockEngine>>>,
    unreachable: RwLock<HashSet<String>>,
    buffered_amount: AtomicUsize,
    candidate_type: AtomicU8,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            buffered_amount: AtomicUsize::new(0),
            candidate_type: AtomicU8::new(candidate_to_u8(CandidateType::Host)),
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<MockEngineFactory> {
        Arc::new(MockEngineFactory {
            network: self.clone(),
        })
    }

    /// Silently drop all channel traffic to and from `peer_id`
    pub async fn set_unreachable(&self, peer_id: &str, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(peer_id.to_string());
        } else {
            set.remove(peer_id);
        }
    }

    /// Report a failed ICE connection on both ends of a link
    pub async fn fail_link(&self, a: &str, b: &str) {
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(engine) = self.engine(local, remote).await {
                engine.emit(EngineEvent::StateChanged(RtcState::Failed));
            }
        }
    }

    /// Buffered amount reported by every mock channel
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered_amount.store(amount, Ordering::SeqCst);
    }

    pub fn set_candidate_type(&self, candidate_type: CandidateType) {
        self.candidate_type
            .store(candidate_to_u8(candidate_type), Ordering::SeqCst);
    }

    /// Whether `local` currently holds an open engine towards `remote`
    pub async fn has_engine(&self, local: &str, remote: &str) -> bool {
        self.engine(local, remote).await.is_some()
    }

    async fn engine(&self, local: &str, remote: &str) -> Option<Arc<MockEngine>> {
        self.engines
            .read()
            .await
            .get(&(local.to_string(), remote.to_string()))
            .cloned()
    }

    async fn is_unreachable(&self, a: &str, b: &str) -> bool {
        let set = self.unreachable.read().await;
        set.contains(a) || set.contains(b)
    }

    async fn establish(&self, local: &str, remote: &str) {
        let (Some(ours), Some(theirs)) = (
            self.engine(local, remote).await,
            self.engine(remote, local).await,
        ) else {
            return;
        };
        // open both ends before announcing either, so no message can overtake
        // a local ChannelOpen
        let theirs_channels = theirs.mark_connected().await;
        let ours_channels = ours.mark_connected().await;
        if let Some(channels) = ours_channels {
            ours.announce_open(channels);
        }
        if let Some(channels) = theirs_channels {
            theirs.announce_open(channels);
        }
    }

    async fn remove(&self, local: &str, remote: &str, engine: &MockEngine) {
        let mut engines = self.engines.write().await;
        let key = (local.to_string(), remote.to_string());
        if engines
            .get(&key)
            .map(|e| std::ptr::eq(e.as_ref(), engine))
            .unwrap_or(false)
        {
            engines.remove(&key);
        }
    }
}

fn candidate_to_u8(candidate_type: CandidateType) -> u8 {
    match candidate_type {
        CandidateType::Host => 0,
        CandidateType::Srflx => 1,
        CandidateType::Prflx => 2,
        CandidateType::Relay => 3,
        CandidateType::Unknown => 4,
    }
}

fn candidate_from_u8(value: u8) -> CandidateType {
    match value {
        0 => CandidateType::Host,
        1 => CandidateType::Srflx,
        2 => CandidateType::Prflx,
        3 => CandidateType::Relay,
        _ => CandidateType::Unknown,
    }
}

/// Engine factory bound to a [`MockNetwork`]
pub struct MockEngineFactory {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        local_peer_id: &str,
        target_peer_id: &str,
    ) -> Result<(Arc<dyn RtcEngine>, mpsc::UnboundedReceiver<EngineEvent>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MockEngine {
            local: local_peer_id.to_string(),
            remote: target_peer_id.to_string(),
            network: Arc::downgrade(&self.network),
            signaling: AtomicU8::new(signaling_to_u8(SignalingState::Stable)),
            state: Mutex::new(MockEngineState::default()),
            events: tx,
        });
        self.network.engines.write().await.insert(
            (local_peer_id.to_string(), target_peer_id.to_string()),
            engine.clone(),
        );
        Ok((engine, rx))
    }
}

#[derive(Default)]
struct MockEngineState {
    remote_description: Option<SessionDescription>,
    channels: Vec<Arc<MockDataChannel>>,
    negotiation_needed_fired: bool,
    gathered: bool,
    connected: bool,
    closed: bool,
}

fn signaling_to_u8(state: SignalingState) -> u8 {
    match state {
        SignalingState::Stable => 0,
        SignalingState::HaveLocalOffer => 1,
        SignalingState::HaveRemoteOffer => 2,
        SignalingState::Closed => 3,
    }
}

fn signaling_from_u8(value: u8) -> SignalingState {
    match value {
        0 => SignalingState::Stable,
        1 => SignalingState::HaveLocalOffer,
        2 => SignalingState::HaveRemoteOffer,
        _ => SignalingState::Closed,
    }
}

/// In-memory engine honoring the signaling state machine
pub struct MockEngine {
    local: String,
    remote: String,
    network: Weak<MockNetwork>,
    signaling: AtomicU8,
    state: Mutex<MockEngineState>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl MockEngine {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn set_signaling(&self, state: SignalingState) {
        self.signaling
            .store(signaling_to_u8(state), Ordering::SeqCst);
    }

    fn expect_signaling(&self, expected: SignalingState) -> Result<(), TransportError> {
        let current = self.signaling_state();
        if current != expected {
            return Err(TransportError::InvalidState(format!(
                "expected {:?}, in {:?}",
                expected, current
            )));
        }
        Ok(())
    }

    fn gather(&self, state: &mut MockEngineState) {
        if state.gathered {
            return;
        }
        state.gathered = true;
        self.emit(EngineEvent::IceCandidate(Some(IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host ({})", self.local),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        })));
        self.emit(EngineEvent::IceCandidate(None));
    }

    async fn mark_connected(&self) -> Option<Vec<Arc<MockDataChannel>>> {
        let mut state = self.state.lock().await;
        if state.connected || state.closed {
            return None;
        }
        state.connected = true;
        for channel in &state.channels {
            channel.open.store(true, Ordering::SeqCst);
        }
        Some(state.channels.clone())
    }

    fn announce_open(&self, channels: Vec<Arc<MockDataChannel>>) {
        self.emit(EngineEvent::StateChanged(RtcState::Connected));
        for channel in channels {
            self.emit(EngineEvent::ChannelOpen(channel.kind));
        }
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_and_set_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock().await;
        self.expect_signaling(SignalingState::Stable)?;
        self.set_signaling(SignalingState::HaveLocalOffer);
        self.gather(&mut state);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("mock-offer {}", self.local),
        })
    }

    async fn create_and_set_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock().await;
        self.expect_signaling(SignalingState::HaveRemoteOffer)?;
        self.set_signaling(SignalingState::Stable);
        self.gather(&mut state);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("mock-answer {}", self.local),
        })
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let kind = desc.kind;
        {
            let mut state = self.state.lock().await;
            match kind {
                SdpKind::Offer => {
                    self.expect_signaling(SignalingState::Stable)?;
                    self.set_signaling(SignalingState::HaveRemoteOffer);
                }
                SdpKind::Answer => {
                    self.expect_signaling(SignalingState::HaveLocalOffer)?;
                    self.set_signaling(SignalingState::Stable);
                }
            }
            state.remote_description = Some(desc);
        }

        if kind == SdpKind::Answer {
            if let Some(network) = self.network.upgrade() {
                network.establish(&self.local, &self.remote).await;
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let _state = self.state.lock().await;
        self.expect_signaling(SignalingState::HaveLocalOffer)?;
        self.set_signaling(SignalingState::Stable);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        _candidate: Option<IceCandidate>,
    ) -> Result<(), TransportError> {
        let state = self.state.lock().await;
        if state.remote_description.is_none() {
            return Err(TransportError::InvalidState(
                "no remote description".to_string(),
            ));
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_from_u8(self.signaling.load(Ordering::SeqCst))
    }

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        let channel = Arc::new(MockDataChannel {
            kind: spec.kind,
            local: self.local.clone(),
            remote: self.remote.clone(),
            network: self.network.clone(),
            open: AtomicBool::new(state.connected),
            threshold: spec.buffered_amount_low_threshold,
        });
        state.channels.push(channel.clone());
        if !state.negotiation_needed_fired {
            state.negotiation_needed_fired = true;
            self.emit(EngineEvent::NegotiationNeeded);
        }
        Ok(channel)
    }

    async fn selected_candidate_type(&self) -> CandidateType {
        match self.network.upgrade() {
            Some(network) => candidate_from_u8(network.candidate_type.load(Ordering::SeqCst)),
            None => CandidateType::Unknown,
        }
    }

    async fn close(&self) {
        let channels = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.channels.clone()
        };
        self.set_signaling(SignalingState::Closed);
        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
        }
        if let Some(network) = self.network.upgrade() {
            network.remove(&self.local, &self.remote, self).await;
        }
        self.emit(EngineEvent::StateChanged(RtcState::Closed));
    }
}

/// Channel of a [`MockEngine`]; frames go to the counterpart engine
pub struct MockDataChannel {
    kind: ChannelKind,
    local: String,
    remote: String,
    network: Weak<MockNetwork>,
    open: AtomicBool,
    threshold: usize,
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.kind));
        }
        let network = self.network.upgrade().ok_or(TransportError::Disconnected)?;
        if network.is_unreachable(&self.local, &self.remote).await {
            return Ok(());
        }
        let counterpart = network
            .engine(&self.remote, &self.local)
            .await
            .ok_or(TransportError::Disconnected)?;
        counterpart.emit(EngineEvent::Message(self.kind, frame));
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.network
            .upgrade()
            .map(|n| n.buffered_amount.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.threshold
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Recording Channel
// ============================================================================

/// Open channel that records every frame sent through it
pub struct RecordingChannel {
    kind: ChannelKind,
    sent: Mutex<Vec<Frame>>,
    buffered: AtomicUsize,
    threshold: usize,
    open: AtomicBool,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Self::with_threshold(kind, 0)
    }

    pub fn with_threshold(kind: ChannelKind, threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            threshold,
            open: AtomicBool::new(true),
        })
    }

    /// Drain recorded frames
    pub async fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock().await)
    }

    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.kind));
        }
        self.sent.lock().await.push(frame);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.threshold
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_announces_peers() {
        let hub = MockSignalingHub::new();
        let (sig_a, mut rx_a) = hub.join("a").await;
        let (sig_b, mut rx_b) = hub.join("b").await;

        sig_a
            .register_peer(PeerRegistration {
                peer_id: "a".to_string(),
                app_version: "1.0.0".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rx_a.recv().await, Some(SignalerEvent::PeerList(vec![])));

        sig_b
            .register_peer(PeerRegistration {
                peer_id: "b".to_string(),
                app_version: "1.0.0".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            rx_b.recv().await,
            Some(SignalerEvent::PeerList(vec!["a".to_string()]))
        );
        assert_eq!(rx_a.recv().await, Some(SignalerEvent::AddedPeer("b".to_string())));

        hub.leave("b").await;
        assert_eq!(
            rx_a.recv().await,
            Some(SignalerEvent::RemovedPeer("b".to_string()))
        );
        assert!(matches!(
            sig_a.send("b", SignalPayload::Candidate(None)).await,
            Err(SignalError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_engine_signaling_states() {
        let network = MockNetwork::new();
        let factory = network.factory();
        let (engine, _events) = factory.create("a", "b").await.unwrap();

        assert_eq!(engine.signaling_state(), SignalingState::Stable);
        assert!(engine.create_and_set_answer().await.is_err());

        engine.create_and_set_offer().await.unwrap();
        assert_eq!(engine.signaling_state(), SignalingState::HaveLocalOffer);
        engine.rollback().await.unwrap();
        assert_eq!(engine.signaling_state(), SignalingState::Stable);
        assert!(engine.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_engines_connect_and_exchange_frames() {
        let network = MockNetwork::new();
        let factory = network.factory();
        let (a, mut a_events) = factory.create("a", "b").await.unwrap();
        let (b, mut b_events) = factory.create("b", "a").await.unwrap();

        let a_reliable = a
            .open_channel(ChannelSpec::for_kind(ChannelKind::Reliable, 0))
            .await
            .unwrap();
        b.open_channel(ChannelSpec::for_kind(ChannelKind::Reliable, 0))
            .await
            .unwrap();
        assert!(!a_reliable.is_open());

        let offer = a.create_and_set_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_and_set_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert!(a_reliable.is_open());

        a_reliable
            .send(Frame::Text("hello".to_string()))
            .await
            .unwrap();

        let mut received = None;
        while let Ok(event) = b_events.try_recv() {
            if let EngineEvent::Message(kind, frame) = event {
                received = Some((kind, frame));
            }
        }
        assert_eq!(
            received,
            Some((ChannelKind::Reliable, Frame::Text("hello".to_string())))
        );

        let mut a_seen = Vec::new();
        while let Ok(event) = a_events.try_recv() {
            a_seen.push(event);
        }
        assert!(a_seen.contains(&EngineEvent::NegotiationNeeded));
        assert!(a_seen.contains(&EngineEvent::IceCandidate(None)));
        assert!(a_seen.contains(&EngineEvent::StateChanged(RtcState::Connected)));
        assert!(a_seen.contains(&EngineEvent::ChannelOpen(ChannelKind::Reliable)));
    }

    #[tokio::test]
    async fn test_unreachable_peer_drops_traffic() {
        let network = MockNetwork::new();
        let factory = network.factory();
        let (a, _a_events) = factory.create("a", "b").await.unwrap();
        let (b, mut b_events) = factory.create("b", "a").await.unwrap();
        let channel = a
            .open_channel(ChannelSpec::for_kind(ChannelKind::Unreliable, 0))
            .await
            .unwrap();
        b.open_channel(ChannelSpec::for_kind(ChannelKind::Unreliable, 0))
            .await
            .unwrap();
        let offer = a.create_and_set_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_and_set_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        while b_events.try_recv().is_ok() {}

        network.set_unreachable("b", true).await;
        channel.send(Frame::Text("lost".to_string())).await.unwrap();
        assert!(b_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recording_channel() {
        let channel = RecordingChannel::with_threshold(ChannelKind::Unordered, 10);
        channel
            .send(Frame::Binary(bytes::Bytes::from_static(b"x")))
            .await
            .unwrap();
        channel.set_buffered_amount(5);
        channel.wait_buffered_amount_low().await;
        assert_eq!(channel.take_sent().await.len(), 1);
        assert!(channel.take_sent().await.is_empty());
    }
}
