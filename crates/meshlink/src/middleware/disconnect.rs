use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::transport::TransportError;
use crate::types::{short_id, ChannelKind};

pub const DISCONNECT: &str = "disconnect";

/// Graceful leave notice; the receiver closes without error, so it does not
/// try to reconnect.
pub struct DisconnectMiddleware {
    ctx: Arc<PeerContext>,
}

impl DisconnectMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self { ctx }
    }

    pub async fn notify(&self) -> Result<(), TransportError> {
        self.ctx
            .send_message(ChannelKind::Unreliable, DISCONNECT, Value::Null)
            .await
    }
}

#[async_trait]
impl Middleware for DisconnectMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Disconnect
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        match incoming.message_type() {
            Some(DISCONNECT) => {
                info!("Peer {} is leaving", short_id(&self.ctx.target_peer_id));
                self.ctx.request_disconnect(false, false, false);
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{message, TestContext};
    use crate::middleware::PeerControl;

    #[tokio::test]
    async fn test_notice_requests_quiet_disconnect() {
        let mut t = TestContext::new("peer-b");
        let disconnect = DisconnectMiddleware::new(t.ctx.clone());

        disconnect.notify().await.unwrap();
        assert_eq!(t.sent_messages(ChannelKind::Unreliable).await[0].kind, DISCONNECT);

        assert!(
            !disconnect
                .call(&message(ChannelKind::Unreliable, DISCONNECT, Value::Null))
                .await
        );
        assert_eq!(
            t.control.try_recv().unwrap(),
            PeerControl::Disconnect {
                block: false,
                error: false,
                notify_remote: false
            }
        );
    }
}
