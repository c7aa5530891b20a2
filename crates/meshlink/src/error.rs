use thiserror::Error;

use crate::chunk::ChunkError;
use crate::identity::IdentityError;
use crate::signaling::SignalError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Errors surfaced by the node and connection APIs
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Peer {0} is not connected")]
    NotConnected(String),
    #[error("Peer {0} has not passed verification")]
    Blocked(String),
    #[error("Connection rejected: {0}")]
    Rejected(String),
    #[error("Node is shut down")]
    Shutdown,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
