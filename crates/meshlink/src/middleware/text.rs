use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::events::MeshEvent;
use crate::transport::TransportError;
use crate::types::{short_id, ChannelKind};

pub const TEXT: &str = "text";

/// Chat messages on the reliable channel
pub struct TextMiddleware {
    ctx: Arc<PeerContext>,
}

impl TextMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self { ctx }
    }

    pub async fn send(&self, text: &str) -> Result<(), TransportError> {
        self.ctx
            .send_message(ChannelKind::Reliable, TEXT, json!(text))
            .await
    }
}

#[async_trait]
impl Middleware for TextMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Text
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        let Incoming::Message { envelope, .. } = incoming else {
            return true;
        };
        if envelope.kind != TEXT {
            return true;
        }
        match envelope.data.as_str() {
            Some(text) => self.ctx.emit(MeshEvent::Text {
                from: self.ctx.target_peer_id.clone(),
                text: text.to_string(),
            }),
            None => warn!(
                "Non-string text message from {}",
                short_id(&self.ctx.target_peer_id)
            ),
        }
        false
    }
}
