//! Application-level handshake
//!
//! Decides whether a logical connection may exist at all, before any SDP is
//! exchanged. The outcome resolves exactly once; packages arriving after that
//! go to the reconnect hook.

use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::signaling::Signaler;
use crate::types::{short_id, AnswerDescription, NegotiationPackage, OfferDescription};

/// Receives packages that arrive after the negotiation settled, along with
/// the confirmed offer (if any).
pub type ReconnectHook = Box<dyn Fn(NegotiationPackage, Option<OfferDescription>) + Send + Sync>;

/// Major components must match (`1.4.0` and `1.9.2` are compatible)
pub fn versions_compatible(local: &str, remote: &str) -> bool {
    fn major(version: &str) -> Option<&str> {
        let major = version.trim().trim_start_matches('v').split('.').next()?;
        (!major.is_empty()).then_some(major)
    }
    match (major(local), major(remote)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[derive(Default)]
struct NegotiationState {
    sent_offer: Option<OfferDescription>,
    resolver: Option<oneshot::Sender<Option<OfferDescription>>>,
    outcome: Option<Option<OfferDescription>>,
}

pub struct NegotiationManager {
    target_peer_id: String,
    polite: bool,
    app_version: String,
    signaler: Arc<dyn Signaler>,
    state: Mutex<NegotiationState>,
    reconnect: Option<ReconnectHook>,
}

impl NegotiationManager {
    pub fn new(
        target_peer_id: &str,
        polite: bool,
        app_version: &str,
        signaler: Arc<dyn Signaler>,
        reconnect: Option<ReconnectHook>,
    ) -> Self {
        Self {
            target_peer_id: target_peer_id.to_string(),
            polite,
            app_version: app_version.to_string(),
            signaler,
            state: Mutex::new(NegotiationState::default()),
            reconnect,
        }
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    /// Run the handshake. Resolves to the agreed offer, or `None` when the
    /// connection was rejected or cancelled.
    pub async fn start(&self, incoming: Option<NegotiationPackage>) -> Option<OfferDescription> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            if state.resolver.is_some() {
                warn!(
                    "Negotiation with {} already started",
                    short_id(&self.target_peer_id)
                );
                return None;
            }
            state.resolver = Some(tx);
        }

        match incoming {
            Some(NegotiationPackage::Offer(offer)) => self.handle_offer(offer).await,
            Some(package) => self.handle_package(package).await,
            None => self.send_offer().await,
        }

        rx.await.ok().flatten()
    }

    /// Route a package received from the signaler
    pub async fn handle_package(&self, package: NegotiationPackage) {
        let settled = self.state.lock().await.outcome.clone();
        if let Some(confirmed) = settled {
            self.forward_late(package, confirmed);
            return;
        }

        match package {
            NegotiationPackage::Offer(offer) => self.handle_offer(offer).await,
            NegotiationPackage::Answer(answer) => self.handle_answer(answer).await,
        }
    }

    /// Resolve with `None` unless already settled
    pub async fn cancel(&self) {
        self.resolve(None).await;
    }

    pub async fn is_settled(&self) -> bool {
        self.state.lock().await.outcome.is_some()
    }

    async fn send_offer(&self) {
        let offer = OfferDescription {
            session_id: Uuid::new_v4().to_string(),
            app_version: self.app_version.clone(),
        };
        {
            let mut state = self.state.lock().await;
            // an incoming offer may have been accepted meanwhile
            if state.outcome.is_some() {
                return;
            }
            state.sent_offer = Some(offer.clone());
        }

        debug!(
            "Sending offer {} to {}",
            offer.session_id,
            short_id(&self.target_peer_id)
        );
        if let Err(e) = self
            .signaler
            .send_negotiation_package(&self.target_peer_id, NegotiationPackage::Offer(offer))
            .await
        {
            warn!(
                "Failed to send offer to {}: {}",
                short_id(&self.target_peer_id),
                e
            );
            self.resolve(None).await;
        }
    }

    async fn handle_offer(&self, offer: OfferDescription) {
        let sent_offer = self.state.lock().await.sent_offer.is_some();
        let compatible = versions_compatible(&self.app_version, &offer.app_version);
        let accepted = (self.polite || !sent_offer) && compatible;

        if let Err(e) = self
            .signaler
            .send_negotiation_package(&self.target_peer_id, NegotiationPackage::answer(accepted))
            .await
        {
            warn!(
                "Failed to answer {}: {}",
                short_id(&self.target_peer_id),
                e
            );
        }

        if accepted {
            debug!(
                "Accepted offer {} from {}",
                offer.session_id,
                short_id(&self.target_peer_id)
            );
            self.resolve(Some(offer)).await;
        } else if !compatible {
            info!(
                "Rejected {}: incompatible app version {} (local {})",
                short_id(&self.target_peer_id),
                offer.app_version,
                self.app_version
            );
            self.resolve(None).await;
        } else {
            // glare: our own offer is outstanding and the polite side will accept it
            debug!(
                "Offer collision with {}, waiting for answer to our offer",
                short_id(&self.target_peer_id)
            );
        }
    }

    async fn handle_answer(&self, answer: AnswerDescription) {
        let sent_offer = self.state.lock().await.sent_offer.clone();
        let Some(offer) = sent_offer else {
            debug!(
                "Ignoring unsolicited answer from {}",
                short_id(&self.target_peer_id)
            );
            return;
        };

        if answer.confirmed {
            self.resolve(Some(offer)).await;
        } else {
            info!("Peer {} rejected our offer", short_id(&self.target_peer_id));
            self.resolve(None).await;
        }
    }

    async fn resolve(&self, outcome: Option<OfferDescription>) {
        let mut state = self.state.lock().await;
        if state.outcome.is_some() {
            return;
        }
        state.outcome = Some(outcome.clone());
        if let Some(tx) = state.resolver.take() {
            let _ = tx.send(outcome);
        }
    }

    fn forward_late(&self, package: NegotiationPackage, confirmed: Option<OfferDescription>) {
        match &self.reconnect {
            Some(hook) => hook(package, confirmed),
            None => debug!(
                "Dropping late negotiation package from {}",
                short_id(&self.target_peer_id)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSignalingHub;
    use crate::signaling::SignalerEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn offer(session: &str, version: &str) -> OfferDescription {
        OfferDescription {
            session_id: session.to_string(),
            app_version: version.to_string(),
        }
    }

    async fn next_package(rx: &mut mpsc::UnboundedReceiver<SignalerEvent>) -> NegotiationPackage {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(SignalerEvent::Negotiation { package, .. })) => package,
            other => panic!("expected negotiation package, got {:?}", other),
        }
    }

    #[test]
    fn test_versions_compatible() {
        assert!(versions_compatible("1.2.3", "1.9.0"));
        assert!(versions_compatible("v2.0.0", "2.1"));
        assert!(!versions_compatible("1.2.3", "2.0.0"));
        assert!(!versions_compatible("1.0.0", ""));
    }

    #[tokio::test]
    async fn test_fresh_offer_confirmed() {
        let hub = MockSignalingHub::new();
        let (sig, _rx) = hub.join("a").await;
        let (_remote, mut remote_rx) = hub.join("b").await;
        let manager = Arc::new(NegotiationManager::new("b", true, "1.0.0", sig, None));

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start(None).await }
        });

        let sent = match next_package(&mut remote_rx).await {
            NegotiationPackage::Offer(offer) => offer,
            other => panic!("expected offer, got {:?}", other),
        };
        assert_eq!(sent.app_version, "1.0.0");
        assert!(Uuid::parse_str(&sent.session_id).is_ok());

        manager.handle_package(NegotiationPackage::answer(true)).await;
        assert_eq!(task.await.unwrap(), Some(sent));
    }

    #[tokio::test]
    async fn test_offer_rejected_by_remote() {
        let hub = MockSignalingHub::new();
        let (sig, _rx) = hub.join("a").await;
        let (_remote, mut remote_rx) = hub.join("b").await;
        let manager = Arc::new(NegotiationManager::new("b", false, "1.0.0", sig, None));

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start(None).await }
        });
        next_package(&mut remote_rx).await;

        manager.handle_package(NegotiationPackage::answer(false)).await;
        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incoming_offer_accepted() {
        let hub = MockSignalingHub::new();
        let (sig, _rx) = hub.join("b").await;
        let (_remote, mut remote_rx) = hub.join("a").await;
        // impolite, but it has not sent an offer itself
        let manager = NegotiationManager::new("a", false, "1.0.0", sig, None);

        let incoming = offer("s1", "1.3.0");
        let result = manager
            .start(Some(NegotiationPackage::Offer(incoming.clone())))
            .await;
        assert_eq!(result, Some(incoming));
        assert_eq!(
            next_package(&mut remote_rx).await,
            NegotiationPackage::answer(true)
        );
    }

    #[tokio::test]
    async fn test_incompatible_version_rejected() {
        let hub = MockSignalingHub::new();
        let (sig, _rx) = hub.join("a").await;
        let (_remote, mut remote_rx) = hub.join("b").await;
        let manager = NegotiationManager::new("b", true, "1.0.0", sig, None);

        let result = manager
            .start(Some(NegotiationPackage::Offer(offer("s1", "2.0.0"))))
            .await;
        assert_eq!(result, None);
        assert_eq!(
            next_package(&mut remote_rx).await,
            NegotiationPackage::answer(false)
        );
    }

    #[tokio::test]
    async fn test_glare_resolves_on_both_sides() {
        let hub = MockSignalingHub::new();
        let (sig_a, mut rx_a) = hub.join("a").await;
        let (sig_b, mut rx_b) = hub.join("b").await;
        let polite = Arc::new(NegotiationManager::new("b", true, "1.0.0", sig_a, None));
        let impolite = Arc::new(NegotiationManager::new("a", false, "1.0.0", sig_b, None));

        let polite_task = tokio::spawn({
            let m = polite.clone();
            async move { m.start(None).await }
        });
        let impolite_task = tokio::spawn({
            let m = impolite.clone();
            async move { m.start(None).await }
        });

        // both offers cross
        let to_impolite = next_package(&mut rx_b).await;
        let to_polite = next_package(&mut rx_a).await;
        let impolite_offer = match &to_polite {
            NegotiationPackage::Offer(o) => o.clone(),
            other => panic!("expected offer, got {:?}", other),
        };

        // impolite refuses the colliding offer but keeps waiting
        impolite.handle_package(to_impolite).await;
        assert_eq!(next_package(&mut rx_a).await, NegotiationPackage::answer(false));
        assert!(!impolite.is_settled().await);

        // polite accepts
        polite.handle_package(to_polite).await;
        assert_eq!(next_package(&mut rx_b).await, NegotiationPackage::answer(true));
        impolite.handle_package(NegotiationPackage::answer(true)).await;

        assert_eq!(polite_task.await.unwrap(), Some(impolite_offer.clone()));
        assert_eq!(impolite_task.await.unwrap(), Some(impolite_offer));
    }

    #[tokio::test]
    async fn test_late_packages_go_to_reconnect_hook() {
        let hub = MockSignalingHub::new();
        let (sig, _rx) = hub.join("a").await;
        let (_remote, _remote_rx) = hub.join("b").await;

        let late = Arc::new(AtomicUsize::new(0));
        let hook: ReconnectHook = {
            let late = late.clone();
            Box::new(move |package, confirmed| {
                assert!(matches!(package, NegotiationPackage::Offer(_)));
                assert_eq!(confirmed.map(|c| c.session_id), Some("s1".to_string()));
                late.fetch_add(1, Ordering::SeqCst);
            })
        };
        let manager = NegotiationManager::new("b", true, "1.0.0", sig, Some(hook));

        let first = manager
            .start(Some(NegotiationPackage::Offer(offer("s1", "1.0.0"))))
            .await;
        assert!(first.is_some());

        manager
            .handle_package(NegotiationPackage::Offer(offer("s2", "1.0.0")))
            .await;
        assert_eq!(late.load(Ordering::SeqCst), 1);

        // settled outcome is immutable
        assert_eq!(manager.start(None).await.map(|o| o.session_id), Some("s1".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending() {
        let hub = MockSignalingHub::new();
        let (sig, _rx) = hub.join("a").await;
        let (_remote, _remote_rx) = hub.join("b").await;
        let manager = Arc::new(NegotiationManager::new("b", true, "1.0.0", sig, None));

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start(None).await }
        });
        tokio::task::yield_now().await;
        manager.cancel().await;
        assert_eq!(task.await.unwrap(), None);

        // a confirmation after cancellation does not resurrect it
        manager.handle_package(NegotiationPackage::answer(true)).await;
        assert!(manager.is_settled().await);
    }
}
