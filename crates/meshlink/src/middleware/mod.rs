//! Sub-protocol handlers multiplexed over the three channels
//!
//! Handlers run in fixed priority order. Each one owns a set of message
//! `type` tags; `call` returns `false` to consume a message and `true` to
//! pass it on to the next handler.

pub mod context;
pub mod disconnect;
pub mod discovery;
pub mod file_transfer;
pub mod nickname;
pub mod ping;
pub mod signature;
pub mod text;
pub mod typing;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

use crate::types::{short_id, ChannelKind, Envelope, Frame};
pub use context::{ContextDeps, PeerContext, PeerControl};
pub use disconnect::DisconnectMiddleware;
pub use discovery::DiscoveryMiddleware;
pub use file_transfer::{FileTransferMiddleware, OutgoingFile, ReceivedFile};
pub use nickname::NicknameMiddleware;
pub use ping::PingMiddleware;
pub use signature::SignatureMiddleware;
pub use text::TextMiddleware;
pub use typing::TypingMiddleware;

/// Handler identity, in dispatch order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerKind {
    Signature,
    FileTransfer,
    Text,
    Typing,
    Nickname,
    Disconnect,
    Discovery,
    Ping,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 8] = [
        HandlerKind::Signature,
        HandlerKind::FileTransfer,
        HandlerKind::Text,
        HandlerKind::Typing,
        HandlerKind::Nickname,
        HandlerKind::Disconnect,
        HandlerKind::Discovery,
        HandlerKind::Ping,
    ];

    /// 1 runs first
    pub fn priority(self) -> u8 {
        match self {
            HandlerKind::Signature => 1,
            HandlerKind::FileTransfer => 2,
            HandlerKind::Text => 3,
            HandlerKind::Typing => 4,
            HandlerKind::Nickname => 5,
            HandlerKind::Disconnect => 6,
            HandlerKind::Discovery => 7,
            HandlerKind::Ping => 8,
        }
    }

    pub(crate) fn bit(self) -> u16 {
        1 << (self.priority() - 1)
    }

    fn all_bits() -> u16 {
        Self::ALL.iter().fold(0, |mask, kind| mask | kind.bit())
    }
}

/// Decoded inbound traffic
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message {
        channel: ChannelKind,
        envelope: Envelope,
    },
    Binary {
        channel: ChannelKind,
        data: Bytes,
    },
}

impl Incoming {
    /// `type` tag of a text message
    pub fn message_type(&self) -> Option<&str> {
        match self {
            Incoming::Message { envelope, .. } => Some(&envelope.kind),
            Incoming::Binary { .. } => None,
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Called once per opened channel. Returns `true` once the handler is
    /// initialized; handlers returning `false` mark themselves ready later.
    async fn init(&self, channel: ChannelKind) -> bool {
        channel == ChannelKind::Reliable
    }

    /// `false` consumes the message
    async fn call(&self, incoming: &Incoming) -> bool;

    fn is_blocked(&self) -> bool {
        false
    }
}

/// Priority-ordered handler registry of one peer
pub struct Pipeline {
    ctx: Arc<PeerContext>,
    handlers: Vec<Arc<dyn Middleware>>,
    signature: Arc<SignatureMiddleware>,
    file_transfer: Arc<FileTransferMiddleware>,
    text: Arc<TextMiddleware>,
    typing: Arc<TypingMiddleware>,
    nickname: Arc<NicknameMiddleware>,
    disconnect: Arc<DisconnectMiddleware>,
    discovery: Arc<DiscoveryMiddleware>,
    ping: Arc<PingMiddleware>,
}

impl Pipeline {
    pub fn new(ctx: Arc<PeerContext>) -> Self {
        let signature = Arc::new(SignatureMiddleware::new(ctx.clone()));
        let file_transfer = Arc::new(FileTransferMiddleware::new(ctx.clone()));
        let text = Arc::new(TextMiddleware::new(ctx.clone()));
        let typing = Arc::new(TypingMiddleware::new(ctx.clone()));
        let nickname = Arc::new(NicknameMiddleware::new(ctx.clone()));
        let disconnect = Arc::new(DisconnectMiddleware::new(ctx.clone()));
        let discovery = Arc::new(DiscoveryMiddleware::new(ctx.clone()));
        let ping = Arc::new(PingMiddleware::new(ctx.clone()));

        let mut handlers: Vec<Arc<dyn Middleware>> = vec![
            signature.clone(),
            file_transfer.clone(),
            text.clone(),
            typing.clone(),
            nickname.clone(),
            disconnect.clone(),
            discovery.clone(),
            ping.clone(),
        ];
        handlers.sort_by_key(|h| h.kind().priority());

        Self {
            ctx,
            handlers,
            signature,
            file_transfer,
            text,
            typing,
            nickname,
            disconnect,
            discovery,
            ping,
        }
    }

    pub fn context(&self) -> &Arc<PeerContext> {
        &self.ctx
    }

    /// O(1) lookup by kind
    pub fn get(&self, kind: HandlerKind) -> &Arc<dyn Middleware> {
        &self.handlers[usize::from(kind.priority() - 1)]
    }

    pub fn handlers(&self) -> &[Arc<dyn Middleware>] {
        &self.handlers
    }

    pub fn signature(&self) -> &Arc<SignatureMiddleware> {
        &self.signature
    }

    pub fn file_transfer(&self) -> &Arc<FileTransferMiddleware> {
        &self.file_transfer
    }

    pub fn text(&self) -> &Arc<TextMiddleware> {
        &self.text
    }

    pub fn typing(&self) -> &Arc<TypingMiddleware> {
        &self.typing
    }

    pub fn nickname(&self) -> &Arc<NicknameMiddleware> {
        &self.nickname
    }

    pub fn disconnect(&self) -> &Arc<DisconnectMiddleware> {
        &self.disconnect
    }

    pub fn discovery(&self) -> &Arc<DiscoveryMiddleware> {
        &self.discovery
    }

    pub fn ping(&self) -> &Arc<PingMiddleware> {
        &self.ping
    }

    /// Fan a channel open event out to every handler
    pub async fn on_channel_open(&self, channel: ChannelKind) {
        for handler in &self.handlers {
            if handler.init(channel).await {
                self.ctx.mark_ready(handler.kind());
            }
        }
    }

    /// Decode a raw frame and dispatch it
    pub async fn on_frame(&self, channel: ChannelKind, frame: Frame) {
        let incoming = match frame {
            Frame::Binary(data) => Incoming::Binary { channel, data },
            Frame::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => Incoming::Message { channel, envelope },
                Err(e) => {
                    warn!(
                        "Malformed message from {} on {}: {}",
                        short_id(&self.ctx.target_peer_id),
                        channel,
                        e
                    );
                    return;
                }
            },
        };
        self.dispatch(incoming).await;
    }

    pub async fn dispatch(&self, incoming: Incoming) {
        for handler in &self.handlers {
            if !handler.call(&incoming).await {
                return;
            }
        }
        match incoming.message_type() {
            Some(kind) => warn!(
                "Unhandled message type '{}' from {}",
                kind,
                short_id(&self.ctx.target_peer_id)
            ),
            None => warn!(
                "Unhandled binary frame from {}",
                short_id(&self.ctx.target_peer_id)
            ),
        }
    }

    /// True while any handler vetoes the connection
    pub fn is_blocked(&self) -> bool {
        self.handlers.iter().any(|h| h.is_blocked())
    }

    pub fn is_initialized(&self) -> bool {
        *self.ctx.subscribe_ready().borrow() == HandlerKind::all_bits()
    }

    /// Resolve once every handler reported initialized
    pub async fn wait_initialized(&self) {
        let mut ready = self.ctx.subscribe_ready();
        let all = HandlerKind::all_bits();
        let _ = ready.wait_for(|mask| *mask == all).await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::discovery::GossipMessage;
    use crate::events::MeshEvent;
    use crate::identity::Identity;
    use crate::mock::RecordingChannel;
    use crate::transport::DataChannel;
    use meshlink_config::Config;
    use std::collections::HashMap;
    use tokio::sync::{broadcast, mpsc, watch};

    /// A context wired to recording channels
    pub struct TestContext {
        pub ctx: Arc<PeerContext>,
        pub identity: Arc<Identity>,
        pub reliable: Arc<RecordingChannel>,
        pub unordered: Arc<RecordingChannel>,
        pub unreliable: Arc<RecordingChannel>,
        pub events: broadcast::Receiver<MeshEvent>,
        pub gossip: mpsc::UnboundedReceiver<GossipMessage>,
        pub control: mpsc::UnboundedReceiver<PeerControl>,
        pub nickname: watch::Sender<Option<String>>,
    }

    impl TestContext {
        pub fn new(target_peer_id: &str) -> Self {
            Self::with_config(target_peer_id, Config::default())
        }

        pub fn with_config(target_peer_id: &str, config: Config) -> Self {
            Self::build(Identity::generate(), target_peer_id, config)
        }

        pub fn with_identity(identity: Identity, target_peer_id: &str) -> Self {
            Self::build(identity, target_peer_id, Config::default())
        }

        fn build(identity: Identity, target_peer_id: &str, config: Config) -> Self {
            let identity = Arc::new(identity);
            let reliable = RecordingChannel::new(ChannelKind::Reliable);
            let unordered = RecordingChannel::with_threshold(
                ChannelKind::Unordered,
                config.chunk.unordered_low_threshold,
            );
            let unreliable = RecordingChannel::new(ChannelKind::Unreliable);
            let mut channels: HashMap<ChannelKind, Arc<dyn DataChannel>> = HashMap::new();
            channels.insert(ChannelKind::Reliable, reliable.clone());
            channels.insert(ChannelKind::Unordered, unordered.clone());
            channels.insert(ChannelKind::Unreliable, unreliable.clone());

            let (events_tx, events) = broadcast::channel(64);
            let (gossip_tx, gossip) = mpsc::unbounded_channel();
            let (control_tx, control) = mpsc::unbounded_channel();
            let (nickname, nickname_rx) = watch::channel(None);
            let deps = ContextDeps {
                identity: identity.clone(),
                config: Arc::new(config),
                events: events_tx,
                gossip: gossip_tx,
                nickname: nickname_rx,
            };
            let ctx = Arc::new(PeerContext::new(target_peer_id, deps, channels, control_tx));

            Self {
                ctx,
                identity,
                reliable,
                unordered,
                unreliable,
                events,
                gossip,
                control,
                nickname,
            }
        }

        /// Envelopes sent on `channel` since the last call
        pub async fn sent_messages(&self, channel: ChannelKind) -> Vec<Envelope> {
            let recorder = match channel {
                ChannelKind::Reliable => &self.reliable,
                ChannelKind::Unordered => &self.unordered,
                ChannelKind::Unreliable => &self.unreliable,
            };
            recorder
                .take_sent()
                .await
                .into_iter()
                .filter_map(|frame| match frame {
                    Frame::Text(text) => serde_json::from_str(&text).ok(),
                    Frame::Binary(_) => None,
                })
                .collect()
        }
    }

    pub fn message(channel: ChannelKind, kind: &str, data: serde_json::Value) -> Incoming {
        Incoming::Message {
            channel,
            envelope: Envelope::new(kind, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priorities_are_dense_and_ordered() {
        let priorities: Vec<u8> = HandlerKind::ALL.iter().map(|k| k.priority()).collect();
        assert_eq!(priorities, (1..=8).collect::<Vec<u8>>());
        assert_eq!(HandlerKind::all_bits(), 0xff);
    }

    #[tokio::test]
    async fn test_lookup_by_kind() {
        let t = TestContext::new("peer-b");
        let pipeline = Pipeline::new(t.ctx.clone());
        for kind in HandlerKind::ALL {
            assert_eq!(pipeline.get(kind).kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_blocked_until_verified() {
        let t = TestContext::new("peer-b");
        let pipeline = Pipeline::new(t.ctx.clone());
        assert!(pipeline.is_blocked());
        assert!(!pipeline.is_initialized());

        pipeline.on_channel_open(ChannelKind::Reliable).await;
        // every handler except signature is ready
        assert!(!pipeline.is_initialized());
        for kind in HandlerKind::ALL.into_iter().skip(1) {
            assert!(t.ctx.is_ready(kind), "{:?} not ready", kind);
        }
    }

    #[tokio::test]
    async fn test_unverified_traffic_is_dropped() {
        let mut t = TestContext::new("peer-b");
        let pipeline = Pipeline::new(t.ctx.clone());

        pipeline
            .dispatch(message(ChannelKind::Reliable, "text", json!("hello")))
            .await;
        assert!(t.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let t = TestContext::new("peer-b");
        let pipeline = Pipeline::new(t.ctx.clone());
        pipeline
            .on_frame(ChannelKind::Reliable, Frame::Text("{not json".to_string()))
            .await;
        pipeline
            .on_frame(ChannelKind::Reliable, Frame::Text("{\"data\": 1}".to_string()))
            .await;
        assert!(t.reliable.take_sent().await.is_empty());
    }
}
