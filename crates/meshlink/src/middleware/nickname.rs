//! Display names
//!
//! The local nickname is sent once the reliable channel is open and our
//! signature proof has gone out, and again whenever it changes. Incoming names
//! are truncated to the configured limit.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::events::MeshEvent;
use crate::transport::TransportError;
use crate::types::{short_id, ChannelKind};

pub const NICKNAME: &str = "nickname";

pub struct NicknameMiddleware {
    ctx: Arc<PeerContext>,
    remote: RwLock<Option<String>>,
}

impl NicknameMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self {
            ctx,
            remote: RwLock::new(None),
        }
    }

    pub async fn send(&self, nickname: &str) -> Result<(), TransportError> {
        self.ctx
            .send_message(ChannelKind::Reliable, NICKNAME, json!(nickname))
            .await
    }

    /// Last nickname announced by the peer
    pub async fn remote_nickname(&self) -> Option<String> {
        self.remote.read().await.clone()
    }
}

fn truncate_chars(name: &str, max: usize) -> String {
    name.chars().take(max).collect()
}

#[async_trait]
impl Middleware for NicknameMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Nickname
    }

    async fn init(&self, channel: ChannelKind) -> bool {
        if channel != ChannelKind::Reliable {
            return false;
        }
        if self.ctx.local_nickname().is_some() {
            // the remote drops anything that arrives ahead of our proof
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if !ctx.wait_proved(ctx.config.timeouts.connecting_timeout()).await {
                    return;
                }
                let Some(nickname) = ctx.local_nickname() else {
                    return;
                };
                if let Err(e) = ctx
                    .send_message(ChannelKind::Reliable, NICKNAME, json!(nickname))
                    .await
                {
                    debug!(
                        "Failed to send nickname to {}: {}",
                        short_id(&ctx.target_peer_id),
                        e
                    );
                }
            });
        }
        true
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        let Incoming::Message { envelope, .. } = incoming else {
            return true;
        };
        if envelope.kind != NICKNAME {
            return true;
        }
        let Some(name) = envelope.data.as_str() else {
            warn!(
                "Non-string nickname from {}",
                short_id(&self.ctx.target_peer_id)
            );
            return false;
        };

        let nickname = truncate_chars(name, self.ctx.config.limits.max_name_length);
        *self.remote.write().await = Some(nickname.clone());
        self.ctx.emit(MeshEvent::Nickname {
            from: self.ctx.target_peer_id.clone(),
            nickname,
        });
        false
    }
}
