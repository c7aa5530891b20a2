use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::events::MeshEvent;
use crate::transport::TransportError;
use crate::types::ChannelKind;

pub const TYPING: &str = "typing";

/// Ephemeral typing indicator on the unreliable channel
pub struct TypingMiddleware {
    ctx: Arc<PeerContext>,
}

impl TypingMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self { ctx }
    }

    pub async fn send(&self, typing: bool) -> Result<(), TransportError> {
        self.ctx
            .send_message(ChannelKind::Unreliable, TYPING, json!(typing))
            .await
    }
}

#[async_trait]
impl Middleware for TypingMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Typing
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        match incoming {
            Incoming::Message { envelope, .. } if envelope.kind == TYPING => {
                self.ctx.emit(MeshEvent::Typing {
                    from: self.ctx.target_peer_id.clone(),
                    typing: envelope.data.as_bool().unwrap_or(false),
                });
                false
            }
            _ => true,
        }
    }
}
