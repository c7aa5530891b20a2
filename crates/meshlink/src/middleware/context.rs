//! Per-peer state shared by every handler of a pipeline

use meshlink_config::Config;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use super::HandlerKind;
use crate::discovery::GossipMessage;
use crate::events::MeshEvent;
use crate::identity::Identity;
use crate::transport::{DataChannel, TransportError};
use crate::types::{short_id, ChannelKind, Envelope, Frame};

/// Requests a handler makes of its owning connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerControl {
    Disconnect {
        block: bool,
        error: bool,
        /// Send a disconnect notice before closing
        notify_remote: bool,
    },
}

pub struct PeerContext {
    pub target_peer_id: String,
    pub identity: Arc<Identity>,
    pub config: Arc<Config>,
    channels: HashMap<ChannelKind, Arc<dyn DataChannel>>,
    events: broadcast::Sender<MeshEvent>,
    gossip: mpsc::UnboundedSender<GossipMessage>,
    control: mpsc::UnboundedSender<PeerControl>,
    nickname: watch::Receiver<Option<String>>,
    ready: watch::Sender<u16>,
    proved: watch::Sender<bool>,
}

/// Everything a pipeline needs from its node
#[derive(Clone)]
pub struct ContextDeps {
    pub identity: Arc<Identity>,
    pub config: Arc<Config>,
    pub events: broadcast::Sender<MeshEvent>,
    pub gossip: mpsc::UnboundedSender<GossipMessage>,
    pub nickname: watch::Receiver<Option<String>>,
}

impl PeerContext {
    pub fn new(
        target_peer_id: &str,
        deps: ContextDeps,
        channels: HashMap<ChannelKind, Arc<dyn DataChannel>>,
        control: mpsc::UnboundedSender<PeerControl>,
    ) -> Self {
        let (ready, _) = watch::channel(0);
        let (proved, _) = watch::channel(false);
        Self {
            target_peer_id: target_peer_id.to_string(),
            identity: deps.identity,
            config: deps.config,
            channels,
            events: deps.events,
            gossip: deps.gossip,
            control,
            nickname: deps.nickname,
            ready,
            proved,
        }
    }

    pub fn channel(&self, kind: ChannelKind) -> Result<&Arc<dyn DataChannel>, TransportError> {
        self.channels
            .get(&kind)
            .ok_or(TransportError::ChannelNotOpen(kind))
    }

    /// Send a `{type, data}` text frame
    pub async fn send_message(
        &self,
        channel: ChannelKind,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<(), TransportError> {
        let text = serde_json::to_string(&Envelope::new(kind, data))
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.channel(channel)?.send(Frame::Text(text)).await
    }

    pub fn emit(&self, event: MeshEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn forward_gossip(&self, message: GossipMessage) {
        if self.gossip.send(message).is_err() {
            debug!("Discovery is not running, dropping gossip from {}", short_id(&self.target_peer_id));
        }
    }

    pub fn request_disconnect(&self, block: bool, error: bool, notify_remote: bool) {
        let _ = self.control.send(PeerControl::Disconnect {
            block,
            error,
            notify_remote,
        });
    }

    /// Current local nickname, if one is set
    pub fn local_nickname(&self) -> Option<String> {
        self.nickname.borrow().clone()
    }

    pub fn mark_ready(&self, kind: HandlerKind) {
        self.ready.send_modify(|mask| *mask |= kind.bit());
    }

    pub fn is_ready(&self, kind: HandlerKind) -> bool {
        *self.ready.borrow() & kind.bit() != 0
    }

    /// Our proof went out; ordered traffic sent after this is accepted remotely
    pub fn mark_proved(&self) {
        self.proved.send_replace(true);
    }

    /// Wait until [`mark_proved`](Self::mark_proved), false on timeout
    pub async fn wait_proved(&self, timeout: std::time::Duration) -> bool {
        let mut proved = self.proved.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            proved.wait_for(|p| *p).await.is_ok()
        })
        .await;
        matches!(waited, Ok(true))
    }

    pub(crate) fn subscribe_ready(&self) -> watch::Receiver<u16> {
        self.ready.subscribe()
    }
}
