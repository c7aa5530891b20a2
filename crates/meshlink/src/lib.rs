//! Peer mesh over negotiated WebRTC data channels
//!
//! This crate connects peers found through a rendezvous signaler, verifies
//! their identities and multiplexes small sub-protocols over three data
//! channels per peer.
//!
//! # Overview
//!
//! - **Connector**: admission (peer caps, blacklist) and connection lifecycle
//! - **Negotiation**: application handshake with version check, then perfect
//!   negotiation of the WebRTC session
//! - **Middleware**: signature challenge, file transfer, text, typing,
//!   nicknames, disconnect notice, gossip and ping
//! - **Discovery**: gossip-based map of who is connected to whom
//!
//! # Example
//!
//! ```rust,no_run
//! use meshlink::mock::{MockNetwork, MockSignalingHub};
//! use meshlink::{MemoryStorage, MeshNode, NodeOptions};
//! use meshlink_config::Config;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MockSignalingHub::new();
//!     let network = MockNetwork::new();
//!     let identity = meshlink::Identity::generate();
//!     let (signaler, signal_events) = hub.join(identity.peer_id()).await;
//!
//!     let node = MeshNode::start(NodeOptions {
//!         config: Config::default(),
//!         identity: Some(identity),
//!         signaler,
//!         signal_events,
//!         engine_factory: network.factory(),
//!         storage: Arc::new(MemoryStorage::new()),
//!     })
//!     .await?;
//!
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod connector;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod middleware;
pub mod mock;
pub mod negotiation;
pub mod node;
pub mod peer_connection;
pub mod rtc_engine;
pub mod signaling;
pub mod storage;
pub mod transport;
pub mod types;
pub mod webrtc_peer;

pub use chunk::{chunk_count, create_chunk, parse_chunk, ChunkError, ParsedChunk};
pub use connector::{Admission, Connector, PeerSummary, RejectReason};
pub use discovery::{ConnectionInfo, GossipMessage, PeerDiscoveryCoordinator, PeerInfo, PeerMap};
pub use error::MeshError;
pub use events::MeshEvent;
pub use identity::{is_polite, verify, Identity, IdentityError};
pub use middleware::{HandlerKind, OutgoingFile, ReceivedFile};
pub use negotiation::{versions_compatible, NegotiationManager};
pub use node::{MeshNode, NodeOptions};
pub use peer_connection::PeerConnection;
pub use rtc_engine::WebRtcEngineFactory;
pub use signaling::{PeerRegistration, SignalError, Signaler, SignalerEvent};
pub use storage::{MemoryStorage, Profile, SecureStorage, StorageError};
pub use transport::{DataChannel, EngineFactory, RtcEngine, TransportError};
pub use types::{
    short_id, CandidateType, ChannelKind, ConnectionStage, Direction, NegotiationPackage,
    APP_VERSION,
};
pub use webrtc_peer::WebRTCPeerConnection;
