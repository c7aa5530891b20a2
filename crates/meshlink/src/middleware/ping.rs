//! Round-trip latency measurement
//!
//! At most one ping is outstanding per direction. A ping that gets no pong
//! within the ping timeout resolves to `None`.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::types::{short_id, ChannelKind};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

#[derive(Debug, Clone, Copy, Deserialize)]
struct PingData {
    id: u64,
}

pub struct PingMiddleware {
    ctx: Arc<PeerContext>,
    next_id: AtomicU64,
    pending: Mutex<Option<(u64, oneshot::Sender<()>)>>,
}

impl PingMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        Self {
            ctx,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(None),
        }
    }

    /// Round-trip time, or `None` on timeout or while another ping is out
    pub async fn ping(&self) -> Option<Duration> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                debug!(
                    "Ping to {} already outstanding",
                    short_id(&self.ctx.target_peer_id)
                );
                return None;
            }
            *pending = Some((id, tx));
        }

        let started = Instant::now();
        let data = serde_json::json!({ "id": id });
        if let Err(e) = self.ctx.send_message(ChannelKind::Reliable, PING, data).await {
            warn!(
                "Failed to ping {}: {}",
                short_id(&self.ctx.target_peer_id),
                e
            );
            self.clear(id).await;
            return None;
        }

        let result = tokio::time::timeout(self.ctx.config.timeouts.ping_timeout(), rx).await;
        self.clear(id).await;
        match result {
            Ok(Ok(())) => Some(started.elapsed()),
            _ => {
                debug!("Ping to {} timed out", short_id(&self.ctx.target_peer_id));
                None
            }
        }
    }

    async fn clear(&self, id: u64) {
        let mut pending = self.pending.lock().await;
        if matches!(pending.as_ref(), Some((pending_id, _)) if *pending_id == id) {
            *pending = None;
        }
    }

    async fn on_pong(&self, id: u64) {
        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some((pending_id, tx)) if pending_id == id => {
                let _ = tx.send(());
            }
            other => {
                debug!("Stale pong {} from {}", id, short_id(&self.ctx.target_peer_id));
                *pending = other;
            }
        }
    }
}

#[async_trait]
impl Middleware for PingMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Ping
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        let Incoming::Message { envelope, .. } = incoming else {
            return true;
        };
        if envelope.kind != PING && envelope.kind != PONG {
            return true;
        }
        let Ok(data) = serde_json::from_value::<PingData>(envelope.data.clone()) else {
            warn!(
                "Malformed {} from {}",
                envelope.kind,
                short_id(&self.ctx.target_peer_id)
            );
            return false;
        };

        if envelope.kind == PING {
            if let Err(e) = self
                .ctx
                .send_message(ChannelKind::Reliable, PONG, serde_json::json!({ "id": data.id }))
                .await
            {
                warn!(
                    "Failed to answer ping from {}: {}",
                    short_id(&self.ctx.target_peer_id),
                    e
                );
            }
        } else {
            self.on_pong(data.id).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{message, TestContext};
    use crate::types::Envelope;

    async fn wait_for_ping(t: &TestContext) -> Envelope {
        loop {
            if let Some(ping) = t.sent_messages(ChannelKind::Reliable).await.pop() {
                return ping;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_pong_resolves_ping() {
        let t = TestContext::new("peer-b");
        let ping = Arc::new(PingMiddleware::new(t.ctx.clone()));

        let task = tokio::spawn({
            let ping = ping.clone();
            async move { ping.ping().await }
        });
        let sent = wait_for_ping(&t).await;
        assert_eq!(sent.kind, PING);

        ping.call(&message(ChannelKind::Reliable, PONG, sent.data)).await;
        assert!(task.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let t = TestContext::new("peer-b");
        let ping = PingMiddleware::new(t.ctx.clone());
        let consumed = !ping
            .call(&message(ChannelKind::Reliable, PING, serde_json::json!({"id": 7})))
            .await;
        assert!(consumed);
        let sent = t.sent_messages(ChannelKind::Reliable).await;
        assert_eq!(sent[0].kind, PONG);
        assert_eq!(sent[0].data, serde_json::json!({"id": 7}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_none() {
        let t = TestContext::new("peer-b");
        let ping = PingMiddleware::new(t.ctx.clone());
        assert_eq!(ping.ping().await, None);
        // a new ping may go out after the timeout
        assert!(ping.pending.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_second_ping_while_outstanding() {
        let t = TestContext::new("peer-b");
        let ping = Arc::new(PingMiddleware::new(t.ctx.clone()));
        let first = tokio::spawn({
            let ping = ping.clone();
            async move { ping.ping().await }
        });
        let sent = wait_for_ping(&t).await;

        assert_eq!(ping.ping().await, None);

        ping.call(&message(ChannelKind::Reliable, PONG, sent.data)).await;
        assert!(first.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_pong_is_ignored() {
        let t = TestContext::new("peer-b");
        let ping = Arc::new(PingMiddleware::new(t.ctx.clone()));
        let task = tokio::spawn({
            let ping = ping.clone();
            async move { ping.ping().await }
        });
        let sent = wait_for_ping(&t).await;

        ping.call(&message(ChannelKind::Reliable, PONG, serde_json::json!({"id": 999})))
            .await;
        assert!(ping.pending.lock().await.is_some());

        ping.call(&message(ChannelKind::Reliable, PONG, sent.data)).await;
        assert!(task.await.unwrap().is_some());
    }
}
