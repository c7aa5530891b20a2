//! Gossip-based view of the network graph
//!
//! Every node keeps a map of peer records, each describing one peer's live
//! connections. Records are republished on local changes and exchanged with
//! a random sample of connected peers on a jittered interval. Merging keeps
//! the newest record per peer, so exchanges converge regardless of order.

use futures::future::join_all;
use meshlink_config::Config;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connector::Connector;
use crate::events::MeshEvent;
use crate::types::{short_id, CandidateType, ConnectionStage};

/// One edge of a peer's record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub peer_id: String,
    pub connected: bool,
    #[serde(default)]
    pub connection_type: CandidateType,
}

/// A peer's self-published record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    #[serde(default)]
    pub connections: Vec<ConnectionInfo>,
    /// Milliseconds since the unix epoch
    pub updated_at: u64,
}

/// Peer map received from a neighbour
#[derive(Debug, Clone, PartialEq)]
pub struct GossipMessage {
    pub from: String,
    pub records: Vec<PeerInfo>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Newest known record per peer
#[derive(Debug, Clone)]
pub struct PeerMap {
    local_peer_id: String,
    records: HashMap<String, PeerInfo>,
}

impl PeerMap {
    pub fn new(local_peer_id: &str) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            records: HashMap::new(),
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.records.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge remote records; true if anything changed.
    ///
    /// Records about the local peer are only ever published locally.
    pub fn merge(&mut self, records: impl IntoIterator<Item = PeerInfo>) -> bool {
        let mut changed = false;
        for record in records {
            if record.peer_id == self.local_peer_id {
                continue;
            }
            let newer = self
                .records
                .get(&record.peer_id)
                .map_or(true, |known| record.updated_at > known.updated_at);
            if newer {
                self.records.insert(record.peer_id.clone(), record);
                changed = true;
            }
        }
        changed
    }

    /// Drop records that are `max_age_ms` or older; true if any were dropped
    pub fn sweep(&mut self, now: u64, max_age_ms: u64) -> bool {
        let before = self.records.len();
        let local = &self.local_peer_id;
        self.records.retain(|peer_id, record| {
            peer_id == local || now.saturating_sub(record.updated_at) < max_age_ms
        });
        self.records.len() != before
    }

    /// Replace the local record. The timestamp never goes backwards, so
    /// neighbours always accept the new version.
    ///
    /// Returns true if the set of connections differs from the previous one.
    pub fn publish_self(&mut self, connections: Vec<ConnectionInfo>, now: u64) -> bool {
        let previous = self.records.get(&self.local_peer_id);
        let updated_at = match previous {
            Some(previous) if previous.updated_at >= now => previous.updated_at + 1,
            _ => now,
        };
        let changed = previous.map_or(true, |p| p.connections != connections);
        self.records.insert(
            self.local_peer_id.clone(),
            PeerInfo {
                peer_id: self.local_peer_id.clone(),
                connections,
                updated_at,
            },
        );
        changed
    }

    /// All records ordered by peer id
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut records: Vec<PeerInfo> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }
}

/// Handle to the gossip task
#[derive(Clone)]
pub struct PeerDiscoveryCoordinator {
    map: Arc<RwLock<PeerMap>>,
    trigger: mpsc::UnboundedSender<()>,
    shutdown: watch::Sender<bool>,
}

impl PeerDiscoveryCoordinator {
    pub fn spawn(
        local_peer_id: &str,
        config: Arc<Config>,
        connector: Connector,
        events: broadcast::Sender<MeshEvent>,
        gossip: mpsc::UnboundedReceiver<GossipMessage>,
    ) -> Self {
        let map = Arc::new(RwLock::new(PeerMap::new(local_peer_id)));
        let (trigger, trigger_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = GossipTask {
            config,
            connector,
            map: map.clone(),
            events: events.clone(),
            rng: StdRng::from_entropy(),
        };
        tokio::spawn(task.run(events.subscribe(), gossip, trigger_rx, shutdown_rx));

        Self {
            map,
            trigger,
            shutdown,
        }
    }

    pub async fn peer_map(&self) -> Vec<PeerInfo> {
        self.map.read().await.snapshot()
    }

    /// Run a gossip round now instead of waiting for the timer
    pub fn gossip_now(&self) {
        let _ = self.trigger.send(());
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

struct GossipTask {
    config: Arc<Config>,
    connector: Connector,
    map: Arc<RwLock<PeerMap>>,
    events: broadcast::Sender<MeshEvent>,
    rng: StdRng,
}

impl GossipTask {
    async fn run(
        mut self,
        mut mesh_events: broadcast::Receiver<MeshEvent>,
        mut gossip: mpsc::UnboundedReceiver<GossipMessage>,
        mut trigger: mpsc::UnboundedReceiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.publish_self().await;
        let mut next_round = self.next_round();

        loop {
            tokio::select! {
                // the watch guard must not outlive this arm
                _ = async { let _ = shutdown.wait_for(|s| *s).await; } => break,
                _ = tokio::time::sleep_until(next_round) => {
                    self.round().await;
                    next_round = self.next_round();
                }
                Some(()) = trigger.recv() => self.round().await,
                Some(message) = gossip.recv() => self.on_gossip(message).await,
                event = mesh_events.recv() => match event {
                    Ok(MeshEvent::PeerConnectionChanged { .. }) => self.publish_self().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Discovery lagged {} events", skipped);
                        self.publish_self().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Discovery stopped");
    }

    fn next_round(&mut self) -> Instant {
        let discovery = &self.config.discovery;
        let jitter = if discovery.jitter_ms > 0 {
            self.rng.gen_range(0..=discovery.jitter_ms)
        } else {
            0
        };
        Instant::now() + Duration::from_millis(discovery.interval_ms + jitter)
    }

    /// Sweep, republish, then send the map to a random sample of neighbours
    async fn round(&mut self) {
        let swept = self
            .map
            .write()
            .await
            .sweep(now_ms(), self.config.discovery.max_age_ms);
        if swept {
            self.emit_map().await;
        }
        self.publish_self().await;

        let connections = match self.connector.connections().await {
            Ok(connections) => connections,
            Err(e) => {
                debug!("No connections to gossip with: {}", e);
                return;
            }
        };
        let connected: Vec<_> = connections
            .into_iter()
            .filter(|c| c.stage() == ConnectionStage::Connected)
            .collect();
        let sample: Vec<_> = connected
            .choose_multiple(&mut self.rng, self.config.discovery.sample_size)
            .cloned()
            .collect();
        if sample.is_empty() {
            return;
        }

        let records = self.map.read().await.snapshot();
        let sends = sample.iter().map(|connection| async {
            if let Err(e) = connection.send_peer_map(&records).await {
                warn!(
                    "Failed to gossip with {}: {}",
                    short_id(connection.peer_id()),
                    e
                );
            }
        });
        join_all(sends).await;
    }

    async fn publish_self(&mut self) {
        let peers = match self.connector.peers().await {
            Ok(peers) => peers,
            Err(_) => return,
        };
        let connections = peers
            .into_iter()
            .filter(|p| p.stage != ConnectionStage::Disconnected)
            .map(|p| ConnectionInfo {
                connected: p.stage == ConnectionStage::Connected,
                peer_id: p.peer_id,
                connection_type: p.candidate_type,
            })
            .collect();
        let changed = self.map.write().await.publish_self(connections, now_ms());
        if changed {
            self.emit_map().await;
        }
    }

    async fn on_gossip(&mut self, message: GossipMessage) {
        let changed = self.map.write().await.merge(message.records);
        if changed {
            debug!("Peer map updated from {}", short_id(&message.from));
            self.emit_map().await;
        }
    }

    async fn emit_map(&self) {
        let snapshot = self.map.read().await.snapshot();
        let _ = self.events.send(MeshEvent::PeerMapChanged(snapshot));
    }
}
