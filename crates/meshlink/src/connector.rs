//! Admission and lifecycle authority over all peer connections
//!
//! The connector runs as a single actor task. Every admission decision and
//! every mutation of the connection map, blacklist and listed-peer set happens
//! inside that task, so the caps are always checked against a consistent view.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::events::MeshEvent;
use crate::peer_connection::{ConnectionDeps, ConnectionReport, PeerConnection};
use crate::signaling::SignalerEvent;
use crate::types::{short_id, CandidateType, ConnectionStage, Direction, NegotiationPackage};

/// Outcome of a connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Created,
    /// A connection to this peer already exists
    Exists,
    IsSelf,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Blacklisted,
    AutoconnectDisabled,
    TooManyPeers,
    TooManyOutgoing,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::Blacklisted => "peer is blacklisted",
            RejectReason::AutoconnectDisabled => "autoconnect is disabled",
            RejectReason::TooManyPeers => "peer limit reached",
            RejectReason::TooManyOutgoing => "outgoing connection limit reached",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: String,
    pub stage: ConnectionStage,
    pub direction: Direction,
    pub candidate_type: CandidateType,
}

enum Command {
    Connect {
        peer_id: String,
        manual: bool,
        reply: oneshot::Sender<Admission>,
    },
    Disconnect {
        peer_id: String,
        reply: oneshot::Sender<bool>,
    },
    Connections {
        reply: oneshot::Sender<Vec<Arc<PeerConnection>>>,
    },
    Blacklist {
        reply: oneshot::Sender<Vec<String>>,
    },
    SetAutoconnect(bool),
    SetAutoreconnect(bool),
    LivenessResult {
        peer_id: String,
        connection_id: u64,
        alive: bool,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connector actor
#[derive(Clone)]
pub struct Connector {
    commands: mpsc::UnboundedSender<Command>,
}

impl Connector {
    /// Start the actor. `signal_events` is the signaler's incoming stream.
    pub fn spawn(
        deps: ConnectionDeps,
        signal_events: mpsc::UnboundedReceiver<SignalerEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reports, report_rx) = mpsc::unbounded_channel();
        let state = ConnectorState {
            local_peer_id: deps.identity.peer_id().to_string(),
            autoconnect: deps.config.connector.autoconnect,
            autoreconnect: deps.config.connector.autoreconnect,
            deps,
            connections: HashMap::new(),
            blacklist: HashSet::new(),
            potential_peers: HashSet::new(),
            next_id: 1,
            commands: commands.downgrade(),
            reports,
        };
        tokio::spawn(state.run(command_rx, signal_events, report_rx));
        Self { commands }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }

    /// Request a connection. `manual` bypasses the blacklist and the caps.
    pub async fn create_connection(
        &self,
        peer_id: &str,
        manual: bool,
    ) -> Result<Admission, MeshError> {
        self.request(|reply| Command::Connect {
            peer_id: peer_id.to_string(),
            manual,
            reply,
        })
        .await
    }

    /// Gracefully close the connection to a peer; false if there was none
    pub async fn disconnect(&self, peer_id: &str) -> Result<bool, MeshError> {
        self.request(|reply| Command::Disconnect {
            peer_id: peer_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn connections(&self) -> Result<Vec<Arc<PeerConnection>>, MeshError> {
        self.request(|reply| Command::Connections { reply }).await
    }

    pub async fn connection(&self, peer_id: &str) -> Result<Option<Arc<PeerConnection>>, MeshError> {
        Ok(self
            .connections()
            .await?
            .into_iter()
            .find(|c| c.peer_id() == peer_id))
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, MeshError> {
        let mut peers: Vec<PeerSummary> = self
            .connections()
            .await?
            .iter()
            .map(|c| PeerSummary {
                peer_id: c.peer_id().to_string(),
                stage: c.stage(),
                direction: c.direction(),
                candidate_type: c.candidate_type(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Ok(peers)
    }

    /// Peers whose connection is in the connected stage
    pub async fn connected_peers(&self) -> Result<Vec<String>, MeshError> {
        Ok(self
            .peers()
            .await?
            .into_iter()
            .filter(|p| p.stage == ConnectionStage::Connected)
            .map(|p| p.peer_id)
            .collect())
    }

    pub async fn blacklist(&self) -> Result<Vec<String>, MeshError> {
        self.request(|reply| Command::Blacklist { reply }).await
    }

    pub fn set_autoconnect(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetAutoconnect(enabled));
    }

    pub fn set_autoreconnect(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetAutoreconnect(enabled));
    }

    /// Disconnect every peer and stop the actor
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

struct ConnectorState {
    local_peer_id: String,
    deps: ConnectionDeps,
    autoconnect: bool,
    autoreconnect: bool,
    connections: HashMap<String, Arc<PeerConnection>>,
    blacklist: HashSet<String>,
    /// Peers currently listed by the rendezvous
    potential_peers: HashSet<String>,
    next_id: u64,
    // weak so dropping every handle stops the actor
    commands: mpsc::WeakUnboundedSender<Command>,
    reports: mpsc::UnboundedSender<ConnectionReport>,
}

impl ConnectorState {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signal_events: mpsc::UnboundedReceiver<SignalerEvent>,
        mut reports: mpsc::UnboundedReceiver<ConnectionReport>,
    ) {
        let mut signaler_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = signal_events.recv(), if signaler_open => match event {
                    Some(event) => self.handle_signaler_event(event),
                    None => {
                        warn!("Signaler stream ended");
                        signaler_open = false;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report),
            }
        }
        debug!("Connector stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                peer_id,
                manual,
                reply,
            } => {
                let admission = self.create_connection(&peer_id, manual, None);
                let _ = reply.send(admission);
            }
            Command::Disconnect { peer_id, reply } => {
                let found = match self.connections.get(&peer_id) {
                    Some(connection) => {
                        let connection = connection.clone();
                        tokio::spawn(async move { connection.disconnect(false, false).await });
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.connections.values().cloned().collect());
            }
            Command::Blacklist { reply } => {
                let mut blacklist: Vec<String> = self.blacklist.iter().cloned().collect();
                blacklist.sort();
                let _ = reply.send(blacklist);
            }
            Command::SetAutoconnect(enabled) => self.autoconnect = enabled,
            Command::SetAutoreconnect(enabled) => self.autoreconnect = enabled,
            Command::LivenessResult {
                peer_id,
                connection_id,
                alive,
            } => self.handle_liveness_result(&peer_id, connection_id, alive),
            Command::Shutdown { .. } => {}
        }
    }

    /// Admission check plus creation. Incoming requests carry the offer that
    /// started them and are answered with a rejection when refused.
    fn create_connection(
        &mut self,
        peer_id: &str,
        manual: bool,
        incoming: Option<NegotiationPackage>,
    ) -> Admission {
        if peer_id == self.local_peer_id {
            return Admission::IsSelf;
        }
        if self.connections.contains_key(peer_id) {
            return Admission::Exists;
        }

        if !manual {
            if self.blacklist.contains(peer_id) {
                return self.reject(peer_id, RejectReason::Blacklisted, incoming.is_some());
            }
            if let Err(reason) = self.admit(incoming.is_none()) {
                return self.reject(peer_id, reason, incoming.is_some());
            }
        }

        let direction = if incoming.is_some() {
            Direction::Incoming
        } else {
            Direction::Outgoing
        };
        let id = self.next_id;
        self.next_id += 1;
        let connection = PeerConnection::new(
            id,
            peer_id,
            direction,
            self.deps.clone(),
            self.reports.clone(),
        );
        info!(
            "Connecting to {} ({:?}, connection {})",
            short_id(peer_id),
            direction,
            id
        );
        self.connections
            .insert(peer_id.to_string(), connection.clone());

        tokio::spawn(async move {
            match connection.connect(incoming).await {
                Ok(true) => {}
                Ok(false) => connection.disconnect(false, false).await,
                Err(e) => {
                    warn!("Connection to {} failed: {}", short_id(connection.peer_id()), e);
                    connection.disconnect(false, true).await;
                }
            }
        });
        Admission::Created
    }

    fn admit(&self, outgoing: bool) -> Result<(), RejectReason> {
        let limits = &self.deps.config.limits;
        if !self.autoconnect {
            return Err(RejectReason::AutoconnectDisabled);
        }
        if self.connections.len() >= limits.max_number_of_peers {
            return Err(RejectReason::TooManyPeers);
        }
        let outgoing_count = self
            .connections
            .values()
            .filter(|c| c.direction() == Direction::Outgoing)
            .count();
        if outgoing && outgoing_count >= limits.max_number_of_outgoing_connections {
            return Err(RejectReason::TooManyOutgoing);
        }
        Ok(())
    }

    fn reject(&self, peer_id: &str, reason: RejectReason, incoming: bool) -> Admission {
        info!("Not connecting to {}: {}", short_id(peer_id), reason);
        if incoming {
            let signaler = self.deps.signaler.clone();
            let peer_id = peer_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = signaler
                    .send_negotiation_package(&peer_id, NegotiationPackage::answer(false))
                    .await
                {
                    debug!("Could not reject {}: {}", short_id(&peer_id), e);
                }
            });
        }
        Admission::Rejected(reason)
    }

    fn handle_signaler_event(&mut self, event: SignalerEvent) {
        match event {
            SignalerEvent::AddedPeer(peer_id) => self.on_listed(peer_id),
            SignalerEvent::PeerList(peers) => {
                let listed: HashSet<String> = peers.iter().cloned().collect();
                let gone: Vec<String> = self
                    .potential_peers
                    .iter()
                    .filter(|p| !listed.contains(*p))
                    .cloned()
                    .collect();
                for peer_id in gone {
                    self.on_unlisted(&peer_id);
                }
                for peer_id in peers {
                    self.on_listed(peer_id);
                }
            }
            SignalerEvent::RemovedPeer(peer_id) => self.on_unlisted(&peer_id),
            SignalerEvent::Negotiation { from, package } => {
                if let Some(connection) = self.connections.get(&from) {
                    connection.deliver_negotiation(package);
                } else if matches!(package, NegotiationPackage::Offer(_)) {
                    self.create_connection(&from, false, Some(package));
                } else {
                    debug!("Dropping negotiation answer from unknown {}", short_id(&from));
                }
            }
            SignalerEvent::Signal { from, payload } => match self.connections.get(&from) {
                Some(connection) => connection.deliver_signal(payload),
                None => debug!("Dropping signal from unknown {}", short_id(&from)),
            },
        }
    }

    fn on_listed(&mut self, peer_id: String) {
        if peer_id == self.local_peer_id {
            return;
        }
        let new = self.potential_peers.insert(peer_id.clone());
        if new && self.autoconnect {
            self.create_connection(&peer_id, false, None);
        }
    }

    /// A peer left the listing. Rendezvous churn is common, so a connected
    /// peer is pinged first and only dropped when it does not answer. A peer
    /// mid-ping is checked once that ping settles.
    fn on_unlisted(&mut self, peer_id: &str) {
        self.potential_peers.remove(peer_id);
        let Some(connection) = self.connections.get(peer_id).cloned() else {
            return;
        };
        if !connection.is_connected() {
            // the connecting timeout covers connections still being set up
            debug!(
                "Unlisted {} is {}, not probing",
                short_id(peer_id),
                connection.stage()
            );
            return;
        }

        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let alive = connection.check_alive().await.is_some();
            let _ = commands.send(Command::LivenessResult {
                peer_id,
                connection_id: connection.id(),
                alive,
            });
        });
    }

    fn handle_liveness_result(&mut self, peer_id: &str, connection_id: u64, alive: bool) {
        if alive {
            debug!("Unlisted peer {} is still reachable", short_id(peer_id));
            return;
        }
        // listed again while the check was out
        if self.potential_peers.contains(peer_id) {
            return;
        }
        match self.connections.get(peer_id) {
            Some(connection) if connection.id() == connection_id => {
                info!("Peer {} is gone, disconnecting", short_id(peer_id));
                let connection = connection.clone();
                tokio::spawn(async move { connection.disconnect(false, false).await });
            }
            _ => debug!("Stale liveness result for {}", short_id(peer_id)),
        }
    }

    fn handle_report(&mut self, report: ConnectionReport) {
        match report {
            ConnectionReport::StageChanged {
                peer_id,
                connection_id,
                stage,
                block,
                error,
            } => {
                if !self.is_current(&peer_id, connection_id) {
                    return;
                }
                match stage {
                    ConnectionStage::Disconnected => {
                        self.connections.remove(&peer_id);
                        self.emit_peers_changed();
                        if block {
                            warn!("Blacklisting {}", short_id(&peer_id));
                            self.blacklist.insert(peer_id.clone());
                            let _ = self.deps.events.send(MeshEvent::PeerBlocked { peer_id });
                        } else if error && self.autoreconnect {
                            info!("Reconnecting to {}", short_id(&peer_id));
                            self.create_connection(&peer_id, true, None);
                        }
                    }
                    ConnectionStage::Connected => self.emit_peers_changed(),
                    _ => {}
                }
            }
            ConnectionReport::Reconnect {
                peer_id,
                connection_id,
                package,
            } => {
                if self.is_current(&peer_id, connection_id) {
                    if let Some(old) = self.connections.remove(&peer_id) {
                        tokio::spawn(async move { old.begin_reconnect().await });
                    }
                }
                match self.connections.get(&peer_id) {
                    // the old connection was already replaced, e.g. by an
                    // autoreconnect still negotiating
                    Some(current) if !current.is_connected() => {
                        current.deliver_negotiation(package);
                    }
                    Some(_) => {
                        debug!("Dropping stale offer from {}", short_id(&peer_id));
                    }
                    // the peer was admitted before
                    None => {
                        self.create_connection(&peer_id, true, Some(package));
                    }
                }
                self.emit_peers_changed();
            }
        }
    }

    fn is_current(&self, peer_id: &str, connection_id: u64) -> bool {
        self.connections
            .get(peer_id)
            .map(|c| c.id() == connection_id)
            .unwrap_or(false)
    }

    fn emit_peers_changed(&self) {
        let mut connected: Vec<String> = self
            .connections
            .values()
            .filter(|c| c.stage() == ConnectionStage::Connected)
            .map(|c| c.peer_id().to_string())
            .collect();
        connected.sort();
        let _ = self.deps.events.send(MeshEvent::PeersChanged { connected });
    }

    async fn shutdown(&mut self) {
        info!("Closing {} connections", self.connections.len());
        for (_, connection) in self.connections.drain() {
            connection.disconnect(false, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::mock::{MockNetwork, MockSignalingHub};
    use crate::types::{OfferDescription, APP_VERSION};
    use meshlink_config::Config;
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};

    struct Fixture {
        connector: Connector,
        signals: mpsc::UnboundedSender<SignalerEvent>,
        local_peer_id: String,
        // remote inboxes stay open so offers are delivered and left unanswered
        remotes: HashMap<&'static str, mpsc::UnboundedReceiver<SignalerEvent>>,
    }

    async fn fixture(config: Config) -> Fixture {
        let hub = MockSignalingHub::new();
        let network = MockNetwork::new();
        let identity = Arc::new(Identity::generate());
        let local_peer_id = identity.peer_id().to_string();
        let (signaler, _rx) = hub.join(&local_peer_id).await;
        let mut remotes = HashMap::new();
        for peer in ["peer-x", "peer-y", "peer-z"] {
            let (_signaler, rx) = hub.join(peer).await;
            remotes.insert(peer, rx);
        }
        let (events, _) = broadcast::channel(64);
        let (gossip, _) = mpsc::unbounded_channel();
        let (_nickname, nickname) = watch::channel(None);
        let deps = ConnectionDeps {
            identity,
            config: Arc::new(config),
            signaler,
            engine_factory: network.factory(),
            events,
            gossip,
            nickname,
        };
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Fixture {
            connector: Connector::spawn(deps, signal_rx),
            signals,
            local_peer_id,
            remotes,
        }
    }

    /// Next negotiation answer delivered to `peer`, skipping offers
    async fn next_answer(f: &mut Fixture, peer: &str) -> bool {
        let inbox = f.remotes.get_mut(peer).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match inbox.recv().await {
                    Some(SignalerEvent::Negotiation {
                        package: NegotiationPackage::Answer(answer),
                        ..
                    }) => return answer.confirmed,
                    Some(_) => continue,
                    None => panic!("inbox closed"),
                }
            }
        })
        .await
        .expect("no answer delivered")
    }

    #[tokio::test]
    async fn test_self_and_duplicate_are_noops() {
        let f = fixture(Config::default()).await;
        let connector = &f.connector;
        assert_eq!(
            connector.create_connection(&f.local_peer_id, true).await.unwrap(),
            Admission::IsSelf
        );
        assert_eq!(
            connector.create_connection("peer-x", false).await.unwrap(),
            Admission::Created
        );
        assert_eq!(
            connector.create_connection("peer-x", true).await.unwrap(),
            Admission::Exists
        );
        assert_eq!(connector.peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_cap_applies_only_to_automatic_requests() {
        let mut config = Config::default();
        config.limits.max_number_of_peers = 1;
        let f = fixture(config).await;
        let connector = &f.connector;

        assert_eq!(
            connector.create_connection("peer-x", false).await.unwrap(),
            Admission::Created
        );
        assert_eq!(
            connector.create_connection("peer-y", false).await.unwrap(),
            Admission::Rejected(RejectReason::TooManyPeers)
        );
        assert_eq!(
            connector.create_connection("peer-y", true).await.unwrap(),
            Admission::Created
        );
    }

    #[tokio::test]
    async fn test_outgoing_cap() {
        let mut config = Config::default();
        config.limits.max_number_of_outgoing_connections = 1;
        let f = fixture(config).await;
        let connector = &f.connector;

        connector.create_connection("peer-x", false).await.unwrap();
        assert_eq!(
            connector.create_connection("peer-y", false).await.unwrap(),
            Admission::Rejected(RejectReason::TooManyOutgoing)
        );
    }

    #[tokio::test]
    async fn test_autoconnect_disabled() {
        let f = fixture(Config::default()).await;
        let connector = &f.connector;
        connector.set_autoconnect(false);
        assert_eq!(
            connector.create_connection("peer-x", false).await.unwrap(),
            Admission::Rejected(RejectReason::AutoconnectDisabled)
        );
        assert_eq!(
            connector.create_connection("peer-x", true).await.unwrap(),
            Admission::Created
        );
    }

    #[tokio::test]
    async fn test_listing_creates_connections() {
        let f = fixture(Config::default()).await;
        let (connector, signals) = (&f.connector, &f.signals);
        signals
            .send(SignalerEvent::PeerList(vec!["peer-x".into(), "peer-y".into()]))
            .unwrap();
        signals
            .send(SignalerEvent::AddedPeer("peer-z".into()))
            .unwrap();

        // signaler events and commands are served in no particular order
        let peers = loop {
            let peers: Vec<String> = connector
                .peers()
                .await
                .unwrap()
                .into_iter()
                .map(|p| p.peer_id)
                .collect();
            if peers.len() == 3 {
                break peers;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(peers, vec!["peer-x", "peer-y", "peer-z"]);
        assert!(connector.connected_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_peer_is_blacklisted() {
        let mut f = fixture(Config::default()).await;
        let connector = f.connector.clone();
        assert_eq!(
            connector.create_connection("peer-x", false).await.unwrap(),
            Admission::Created
        );
        let connection = connector.connection("peer-x").await.unwrap().unwrap();
        connection.disconnect(true, false).await;

        let blacklist = loop {
            let blacklist = connector.blacklist().await.unwrap();
            if !blacklist.is_empty() {
                break blacklist;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(blacklist, vec!["peer-x".to_string()]);
        // no retry after a block
        assert!(connector.connection("peer-x").await.unwrap().is_none());

        assert_eq!(
            connector.create_connection("peer-x", false).await.unwrap(),
            Admission::Rejected(RejectReason::Blacklisted)
        );

        f.signals
            .send(SignalerEvent::Negotiation {
                from: "peer-x".to_string(),
                package: NegotiationPackage::Offer(OfferDescription {
                    session_id: "session-1".to_string(),
                    app_version: APP_VERSION.to_string(),
                }),
            })
            .unwrap();
        assert!(!next_answer(&mut f, "peer-x").await);
        assert!(connector.connection("peer-x").await.unwrap().is_none());

        assert_eq!(
            connector.create_connection("peer-x", true).await.unwrap(),
            Admission::Created
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let f = fixture(Config::default()).await;
        let connector = &f.connector;
        connector.create_connection("peer-x", false).await.unwrap();
        connector.shutdown().await;
        assert!(matches!(
            connector.peers().await,
            Err(MeshError::Shutdown)
        ));
    }
}
