//! A running mesh participant
//!
//! [`MeshNode`] ties the local identity, the signaler, the connector and the
//! gossip coordinator together and is the entry point for applications.

use futures::future::join_all;
use meshlink_config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

use crate::connector::{Admission, Connector, PeerSummary};
use crate::discovery::{PeerDiscoveryCoordinator, PeerInfo};
use crate::error::MeshError;
use crate::events::{MeshEvent, EVENT_CHANNEL_CAPACITY};
use crate::identity::Identity;
use crate::middleware::OutgoingFile;
use crate::peer_connection::{ConnectionDeps, PeerConnection};
use crate::signaling::{PeerRegistration, Signaler, SignalerEvent};
use crate::storage::{Profile, SecureStorage};
use crate::transport::EngineFactory;
use crate::types::{short_id, APP_VERSION};

/// Collaborators and settings for [`MeshNode::start`]
pub struct NodeOptions {
    pub config: Config,
    /// Loaded from (or generated into) `storage` when absent
    pub identity: Option<Identity>,
    pub signaler: Arc<dyn Signaler>,
    pub signal_events: mpsc::UnboundedReceiver<SignalerEvent>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub storage: Arc<dyn SecureStorage>,
}

pub struct MeshNode {
    identity: Arc<Identity>,
    config: Arc<Config>,
    storage: Arc<dyn SecureStorage>,
    events: broadcast::Sender<MeshEvent>,
    nickname: watch::Sender<Option<String>>,
    connector: Connector,
    discovery: Option<PeerDiscoveryCoordinator>,
}

impl MeshNode {
    /// Load identity and profile, join the rendezvous and start accepting peers
    pub async fn start(options: NodeOptions) -> Result<Self, MeshError> {
        let NodeOptions {
            config,
            identity,
            signaler,
            signal_events,
            engine_factory,
            storage,
        } = options;

        let identity = match identity {
            Some(identity) => identity,
            None => Identity::load_or_generate(storage.as_ref()).await?,
        };
        let identity = Arc::new(identity);
        let profile = Profile::load(storage.as_ref()).await?;
        let config = Arc::new(config);

        // incoming events queue up in `signal_events` until the connector runs
        signaler
            .register_peer(PeerRegistration {
                peer_id: identity.peer_id().to_string(),
                app_version: APP_VERSION.to_string(),
            })
            .await?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();
        let (nickname, nickname_rx) = watch::channel(profile.nickname);

        let deps = ConnectionDeps {
            identity: identity.clone(),
            config: config.clone(),
            signaler,
            engine_factory,
            events: events.clone(),
            gossip: gossip_tx,
            nickname: nickname_rx,
        };
        let connector = Connector::spawn(deps, signal_events);

        let discovery = if config.discovery.enabled {
            Some(PeerDiscoveryCoordinator::spawn(
                identity.peer_id(),
                config.clone(),
                connector.clone(),
                events.clone(),
                gossip_rx,
            ))
        } else {
            None
        };

        info!("Mesh node {} started", short_id(identity.peer_id()));
        Ok(Self {
            identity,
            config,
            storage,
            events,
            nickname,
            connector,
            discovery,
        })
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Manually connect; bypasses the blacklist and the peer caps
    pub async fn connect(&self, peer_id: &str) -> Result<Admission, MeshError> {
        self.connector.create_connection(peer_id, true).await
    }

    pub async fn disconnect(&self, peer_id: &str) -> Result<bool, MeshError> {
        self.connector.disconnect(peer_id).await
    }

    pub async fn send_text(&self, peer_id: &str, text: &str) -> Result<(), MeshError> {
        self.connection(peer_id).await?.send_text(text).await
    }

    /// Queue a file for a peer; returns the transfer id
    pub async fn send_file(&self, peer_id: &str, file: OutgoingFile) -> Result<String, MeshError> {
        self.connection(peer_id).await?.send_file(file).await
    }

    pub async fn set_typing(&self, peer_id: &str, typing: bool) -> Result<(), MeshError> {
        self.connection(peer_id).await?.set_typing(typing).await
    }

    pub fn nickname(&self) -> Option<String> {
        self.nickname.borrow().clone()
    }

    /// Persist a new nickname and announce it to connected peers
    pub async fn set_nickname(&self, nickname: &str) -> Result<(), MeshError> {
        let nickname: String = nickname
            .chars()
            .take(self.config.limits.max_name_length)
            .collect();
        let profile = Profile {
            nickname: Some(nickname.clone()),
        };
        profile.save(self.storage.as_ref()).await?;
        self.nickname.send_replace(Some(nickname.clone()));

        let connections = self.connector.connections().await?;
        let sends = connections
            .iter()
            .filter(|c| c.is_connected())
            .map(|connection| async {
                if let Err(e) = connection.send_nickname(&nickname).await {
                    debug!(
                        "Nickname not sent to {}: {}",
                        short_id(connection.peer_id()),
                        e
                    );
                }
            });
        join_all(sends).await;
        Ok(())
    }

    /// Round-trip time, `None` if the peer did not answer in time
    pub async fn ping(&self, peer_id: &str) -> Result<Option<Duration>, MeshError> {
        Ok(self.connection(peer_id).await?.ping().await)
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>, MeshError> {
        self.connector.peers().await
    }

    pub async fn connected_peers(&self) -> Result<Vec<String>, MeshError> {
        self.connector.connected_peers().await
    }

    pub async fn blacklist(&self) -> Result<Vec<String>, MeshError> {
        self.connector.blacklist().await
    }

    pub fn set_autoconnect(&self, enabled: bool) {
        self.connector.set_autoconnect(enabled);
    }

    pub fn set_autoreconnect(&self, enabled: bool) {
        self.connector.set_autoreconnect(enabled);
    }

    /// Gossip view of the network; empty when discovery is disabled
    pub async fn peer_map(&self) -> Vec<PeerInfo> {
        match &self.discovery {
            Some(discovery) => discovery.peer_map().await,
            None => Vec::new(),
        }
    }

    /// Run a gossip round without waiting for the timer
    pub fn gossip_now(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.gossip_now();
        }
    }

    /// Disconnect everyone and stop background tasks
    pub async fn shutdown(&self) {
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        self.connector.shutdown().await;
        info!("Mesh node {} stopped", short_id(self.identity.peer_id()));
    }

    async fn connection(&self, peer_id: &str) -> Result<Arc<PeerConnection>, MeshError> {
        self.connector
            .connection(peer_id)
            .await?
            .ok_or_else(|| MeshError::NotConnected(peer_id.to_string()))
    }
}

impl Drop for MeshNode {
    // the gossip task holds a connector handle; releasing it lets the
    // connector wind down once the node is gone
    fn drop(&mut self) {
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
    }
}
