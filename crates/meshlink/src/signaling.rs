//! Rendezvous signaling abstraction
//!
//! The signaler announces peers, relays application negotiation packages and
//! relays SDP/ICE payloads. Incoming traffic is delivered as a stream of
//! [`SignalerEvent`]s handed out by the concrete implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::types::{NegotiationPackage, SignalPayload};

#[derive(Debug, Error, Clone)]
pub enum SignalError {
    #[error("Peer {0} is not reachable through the signaler")]
    PeerNotFound(String),
    #[error("Signaler send failed: {0}")]
    SendFailed(String),
    #[error("Not registered with the signaler")]
    NotRegistered,
}

/// Data published when joining the rendezvous
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRegistration {
    pub peer_id: String,
    pub app_version: String,
}

/// Incoming rendezvous traffic
#[derive(Debug, Clone, PartialEq)]
pub enum SignalerEvent {
    AddedPeer(String),
    RemovedPeer(String),
    /// Full current listing; peers missing from it are candidates for removal
    PeerList(Vec<String>),
    Negotiation {
        from: String,
        package: NegotiationPackage,
    },
    Signal {
        from: String,
        payload: SignalPayload,
    },
}

#[async_trait]
pub trait Signaler: Send + Sync {
    async fn register_peer(&self, registration: PeerRegistration) -> Result<(), SignalError>;

    async fn send_negotiation_package(
        &self,
        target_peer_id: &str,
        package: NegotiationPackage,
    ) -> Result<(), SignalError>;

    /// Relay an SDP description or ICE candidate
    async fn send(&self, target_peer_id: &str, payload: SignalPayload) -> Result<(), SignalError>;
}

#[async_trait]
impl<T: Signaler + ?Sized> Signaler for Arc<T> {
    async fn register_peer(&self, registration: PeerRegistration) -> Result<(), SignalError> {
        (**self).register_peer(registration).await
    }

    async fn send_negotiation_package(
        &self,
        target_peer_id: &str,
        package: NegotiationPackage,
    ) -> Result<(), SignalError> {
        (**self)
            .send_negotiation_package(target_peer_id, package)
            .await
    }

    async fn send(&self, target_peer_id: &str, payload: SignalPayload) -> Result<(), SignalError> {
        (**self).send(target_peer_id, payload).await
    }
}
