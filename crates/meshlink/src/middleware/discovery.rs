use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::discovery::{GossipMessage, PeerInfo};
use crate::transport::TransportError;
use crate::types::{short_id, ChannelKind};

pub const DISCOVERY: &str = "discovery";

/// Carries gossip peer maps on the unreliable channel
pub struct DiscoveryMiddleware {
    ctx: Arc<PeerContext>,
}

impl DiscoveryMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self { ctx }
    }

    /// Send the full known peer map, keyed by peer id
    pub async fn send_peer_map(&self, records: &[PeerInfo]) -> Result<(), TransportError> {
        let map: BTreeMap<&str, &PeerInfo> = records
            .iter()
            .map(|record| (record.peer_id.as_str(), record))
            .collect();
        let data =
            serde_json::to_value(&map).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.ctx
            .send_message(ChannelKind::Unreliable, DISCOVERY, data)
            .await
    }
}

/// Keep only entries filed under their own peer id
fn consistent_records(map: BTreeMap<String, PeerInfo>) -> Vec<PeerInfo> {
    map.into_iter()
        .filter_map(|(peer_id, record)| {
            if record.peer_id == peer_id {
                Some(record)
            } else {
                debug!("Dropping record for {} filed under {}", record.peer_id, peer_id);
                None
            }
        })
        .collect()
}

#[async_trait]
impl Middleware for DiscoveryMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Discovery
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        let Incoming::Message { envelope, .. } = incoming else {
            return true;
        };
        if envelope.kind != DISCOVERY {
            return true;
        }

        match serde_json::from_value::<BTreeMap<String, PeerInfo>>(envelope.data.clone()) {
            Ok(map) => self.ctx.forward_gossip(GossipMessage {
                from: self.ctx.target_peer_id.clone(),
                records: consistent_records(map),
            }),
            Err(e) => warn!(
                "Malformed peer map from {}: {}",
                short_id(&self.ctx.target_peer_id),
                e
            ),
        }
        false
    }
}
