//! Identity handshake
//!
//! Each side sends a random nonce as a challenge on the reliable channel and
//! proves control of its key by signing the other side's nonce. The proof is
//! checked against the public key decoded from the remote peer id, so a peer
//! cannot claim an id it does not hold the key for.

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{HandlerKind, Incoming, Middleware, PeerContext};
use crate::identity;
use crate::types::{short_id, ChannelKind};

pub const CHALLENGE: &str = "challenge";
pub const PROVE: &str = "prove";

pub struct SignatureMiddleware {
    ctx: Arc<PeerContext>,
    nonce: [u8; 32],
    verified: AtomicBool,
}

impl SignatureMiddleware {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        Self {
            ctx,
            nonce,
            verified: AtomicBool::new(false),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    async fn answer_challenge(&self, data: &serde_json::Value) {
        let Some(challenge) = data.as_str().and_then(|s| hex::decode(s).ok()) else {
            warn!(
                "Invalid challenge from {}",
                short_id(&self.ctx.target_peer_id)
            );
            return;
        };
        let signature = self.ctx.identity.sign(&challenge);
        match self
            .ctx
            .send_message(ChannelKind::Reliable, PROVE, json!(hex::encode(signature)))
            .await
        {
            Ok(()) => self.ctx.mark_proved(),
            Err(e) => warn!(
                "Failed to send proof to {}: {}",
                short_id(&self.ctx.target_peer_id),
                e
            ),
        }
    }

    fn check_proof(&self, data: &serde_json::Value) {
        if self.is_verified() {
            return;
        }
        let valid = data
            .as_str()
            .and_then(|s| hex::decode(s).ok())
            .map(|signature| identity::verify(&self.ctx.target_peer_id, &self.nonce, &signature))
            .unwrap_or(false);

        if valid {
            info!("Peer {} verified", short_id(&self.ctx.target_peer_id));
            self.verified.store(true, Ordering::SeqCst);
            self.ctx.mark_ready(HandlerKind::Signature);
        } else {
            warn!(
                "Peer {} failed signature verification, blocking",
                short_id(&self.ctx.target_peer_id)
            );
            self.ctx.request_disconnect(true, false, false);
        }
    }
}

#[async_trait]
impl Middleware for SignatureMiddleware {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Signature
    }

    async fn init(&self, channel: ChannelKind) -> bool {
        if channel == ChannelKind::Reliable {
            debug!("Sending challenge to {}", short_id(&self.ctx.target_peer_id));
            if let Err(e) = self
                .ctx
                .send_message(ChannelKind::Reliable, CHALLENGE, json!(hex::encode(self.nonce)))
                .await
            {
                warn!(
                    "Failed to send challenge to {}: {}",
                    short_id(&self.ctx.target_peer_id),
                    e
                );
            }
        }
        // ready only once the proof checks out
        false
    }

    async fn call(&self, incoming: &Incoming) -> bool {
        match incoming {
            Incoming::Message { envelope, .. } if envelope.kind == CHALLENGE => {
                self.answer_challenge(&envelope.data).await;
                false
            }
            Incoming::Message { envelope, .. } if envelope.kind == PROVE => {
                self.check_proof(&envelope.data);
                false
            }
            _ if self.is_verified() => true,
            _ => {
                debug!(
                    "Dropping traffic from unverified peer {}",
                    short_id(&self.ctx.target_peer_id)
                );
                false
            }
        }
    }

    fn is_blocked(&self) -> bool {
        !self.is_verified()
    }
}
