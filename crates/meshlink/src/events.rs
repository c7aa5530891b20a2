//! Events published to subscribers of a mesh node

use crate::discovery::PeerInfo;
use crate::middleware::file_transfer::ReceivedFile;
use crate::types::{ConnectionStage, Direction};

/// Capacity of the node-wide broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A connection moved to a new lifecycle stage
    PeerConnectionChanged {
        peer_id: String,
        stage: ConnectionStage,
    },
    /// The set of connected peers changed
    PeersChanged { connected: Vec<String> },
    /// A peer failed verification and was blacklisted
    PeerBlocked { peer_id: String },
    Text { from: String, text: String },
    Typing { from: String, typing: bool },
    Nickname { from: String, nickname: String },
    FileProgress {
        peer_id: String,
        file_id: String,
        direction: Direction,
        /// Whole percent, 0-100
        progress: u8,
        /// Bits per second since the transfer started
        bitrate: f64,
    },
    FileSent { peer_id: String, file_id: String },
    FileReceived { from: String, file: ReceivedFile },
    /// The gossip view of the network changed
    PeerMapChanged(Vec<PeerInfo>),
}
