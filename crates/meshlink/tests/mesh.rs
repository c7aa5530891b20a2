//! End-to-end tests over the in-memory rendezvous and RTC network

use meshlink::mock::{MockNetwork, MockSignalingHub};
use meshlink::{
    Admission, CandidateType, ConnectionStage, Identity, MemoryStorage, MeshEvent, MeshNode,
    NodeOptions, OutgoingFile,
};
use meshlink_config::Config;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Mesh {
    hub: Arc<MockSignalingHub>,
    network: Arc<MockNetwork>,
}

impl Mesh {
    fn new() -> Self {
        Self {
            hub: MockSignalingHub::new(),
            network: MockNetwork::new(),
        }
    }

    async fn node(&self, config: Config) -> MeshNode {
        init_logging();
        let identity = Identity::generate();
        let (signaler, signal_events) = self.hub.join(identity.peer_id()).await;
        MeshNode::start(NodeOptions {
            config,
            identity: Some(identity),
            signaler,
            signal_events,
            engine_factory: self.network.factory(),
            storage: Arc::new(MemoryStorage::new()),
        })
        .await
        .unwrap()
    }
}

/// `RUST_LOG=meshlink=debug` shows the handshakes
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.timeouts.connecting_timeout_ms = 5_000;
    config.timeouts.ping_timeout_ms = 300;
    config.discovery.interval_ms = 100;
    config.discovery.jitter_ms = 50;
    config
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

async fn next_event<F>(events: &mut broadcast::Receiver<MeshEvent>, mut matches: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

async fn is_connected(node: &MeshNode, peer_id: &str) -> bool {
    node.connected_peers()
        .await
        .map(|peers| peers.iter().any(|p| p == peer_id))
        .unwrap_or(false)
}

async fn connected_pair(mesh: &Mesh, config: Config) -> (MeshNode, MeshNode) {
    let a = mesh.node(config.clone()).await;
    let b = mesh.node(config).await;
    let (a_id, b_id) = (a.peer_id().to_string(), b.peer_id().to_string());
    eventually("pair to connect", || async {
        is_connected(&a, &b_id).await && is_connected(&b, &a_id).await
    })
    .await;
    (a, b)
}

#[tokio::test]
async fn test_listed_peers_connect_and_chat() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let mut a_events = a.subscribe();

    b.send_text(a.peer_id(), "hello").await.unwrap();
    let event = next_event(&mut a_events, |e| matches!(e, MeshEvent::Text { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Text {
            from: b.peer_id().to_string(),
            text: "hello".to_string()
        }
    );

    b.set_typing(a.peer_id(), true).await.unwrap();
    let event = next_event(&mut a_events, |e| matches!(e, MeshEvent::Typing { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Typing {
            from: b.peer_id().to_string(),
            typing: true
        }
    );

    assert!(a.ping(b.peer_id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_one_connection_per_pair() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;

    let peers = a.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, b.peer_id());
    assert_eq!(peers[0].stage, ConnectionStage::Connected);
    assert_eq!(a.connect(b.peer_id()).await.unwrap(), Admission::Exists);
}

#[tokio::test]
async fn test_nickname_reaches_connected_peer() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let mut b_events = b.subscribe();

    a.set_nickname("alice").await.unwrap();
    let event = next_event(&mut b_events, |e| matches!(e, MeshEvent::Nickname { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Nickname {
            from: a.peer_id().to_string(),
            nickname: "alice".to_string()
        }
    );
}

#[tokio::test]
async fn test_stored_nickname_announced_on_connect() {
    let mesh = Mesh::new();
    let a = mesh.node(test_config()).await;
    a.set_nickname("alice").await.unwrap();

    let b = mesh.node(test_config()).await;
    let mut b_events = b.subscribe();
    let event = next_event(&mut b_events, |e| matches!(e, MeshEvent::Nickname { .. })).await;
    assert_eq!(
        event,
        MeshEvent::Nickname {
            from: a.peer_id().to_string(),
            nickname: "alice".to_string()
        }
    );
}

#[tokio::test]
async fn test_file_transfer_reassembles() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let file = OutgoingFile::from_bytes("notes.bin", "application/octet-stream", data.clone());
    let file_id = a.send_file(b.peer_id(), file).await.unwrap();

    let received = match next_event(&mut b_events, |e| matches!(e, MeshEvent::FileReceived { .. })).await
    {
        MeshEvent::FileReceived { from, file } => {
            assert_eq!(from, a.peer_id());
            file
        }
        _ => unreachable!(),
    };
    assert_eq!(received.file_id, file_id);
    assert_eq!(received.name, "notes.bin");
    assert_eq!(received.size, 40_000);
    assert_eq!(received.data.as_ref(), data.as_slice());

    let sent = next_event(&mut a_events, |e| matches!(e, MeshEvent::FileSent { .. })).await;
    assert_eq!(
        sent,
        MeshEvent::FileSent {
            peer_id: b.peer_id().to_string(),
            file_id
        }
    );
}

#[tokio::test]
async fn test_peer_cap_and_manual_override() {
    let mesh = Mesh::new();
    let mut capped = test_config();
    capped.limits.max_number_of_peers = 1;

    let a = mesh.node(capped).await;
    let b = mesh.node(test_config()).await;
    let (a_id, b_id) = (a.peer_id().to_string(), b.peer_id().to_string());
    eventually("a and b to connect", || async { is_connected(&a, &b_id).await }).await;

    let c = mesh.node(test_config()).await;
    let c_id = c.peer_id().to_string();
    eventually("c to connect to b", || async { is_connected(&c, &b_id).await }).await;
    // a is full, so c's attempt is rejected and dropped
    eventually("c to give up on a", || async {
        c.peers()
            .await
            .map(|peers| peers.iter().all(|p| p.peer_id != a_id))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(a.connected_peers().await.unwrap(), vec![b_id.clone()]);

    // manual connections bypass the cap
    assert_eq!(a.connect(&c_id).await.unwrap(), Admission::Created);
    eventually("a and c to connect", || async {
        is_connected(&a, &c_id).await && is_connected(&c, &a_id).await
    })
    .await;
    assert_eq!(a.connected_peers().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_graceful_disconnect_is_not_retried() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let (a_id, b_id) = (a.peer_id().to_string(), b.peer_id().to_string());

    assert!(a.disconnect(&b_id).await.unwrap());
    eventually("both sides to drop", || async {
        a.peers().await.unwrap().is_empty() && b.peers().await.unwrap().is_empty()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_connected(&a, &b_id).await);
    assert!(!is_connected(&b, &a_id).await);
    assert!(a.blacklist().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_link_reconnects() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let (a_id, b_id) = (a.peer_id().to_string(), b.peer_id().to_string());
    let mut a_events = a.subscribe();

    mesh.network.fail_link(&a_id, &b_id).await;
    next_event(&mut a_events, |e| {
        matches!(
            e,
            MeshEvent::PeerConnectionChanged {
                stage: ConnectionStage::Disconnected | ConnectionStage::Reconnecting,
                ..
            }
        )
    })
    .await;

    eventually("pair to reconnect", || async {
        is_connected(&a, &b_id).await && is_connected(&b, &a_id).await
    })
    .await;
    assert!(a.send_text(&b_id, "back").await.is_ok());
}

#[tokio::test]
async fn test_unlisted_reachable_peer_stays_connected() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let b_id = b.peer_id().to_string();

    // rendezvous churn only: the ping is answered
    mesh.hub.unlist(&b_id).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(is_connected(&a, &b_id).await);
    assert!(a.send_text(&b_id, "still here?").await.is_ok());
}

#[tokio::test]
async fn test_unlisted_unreachable_peer_is_dropped() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let b_id = b.peer_id().to_string();

    mesh.network.set_unreachable(&b_id, true).await;
    mesh.hub.unlist(&b_id).await;
    eventually("a to drop b", || async {
        a.peers()
            .await
            .map(|peers| peers.iter().all(|p| p.peer_id != b_id))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_peer_unlisted_mid_ping_is_checked() {
    let mesh = Mesh::new();
    let (a, b) = connected_pair(&mesh, test_config()).await;
    let b_id = b.peer_id().to_string();

    mesh.network.set_unreachable(&b_id, true).await;
    let (rtt, _) = tokio::join!(a.ping(&b_id), async {
        // unlisted while the ping above is still out
        tokio::time::sleep(Duration::from_millis(50)).await;
        mesh.hub.unlist(&b_id).await;
    });
    assert!(rtt.unwrap().is_none());

    eventually("a to drop b", || async {
        a.peers()
            .await
            .map(|peers| peers.iter().all(|p| p.peer_id != b_id))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_candidate_type_is_recorded() {
    let mesh = Mesh::new();
    mesh.network.set_candidate_type(CandidateType::Relay);
    let (a, b) = connected_pair(&mesh, test_config()).await;

    let peers = a.peers().await.unwrap();
    assert_eq!(peers[0].peer_id, b.peer_id());
    assert_eq!(peers[0].candidate_type, CandidateType::Relay);
}

#[tokio::test]
async fn test_gossip_converges_on_peer_map() {
    let mesh = Mesh::new();
    let a = mesh.node(test_config()).await;
    let b = mesh.node(test_config()).await;
    let c = mesh.node(test_config()).await;
    let ids: Vec<String> = [&a, &b, &c].iter().map(|n| n.peer_id().to_string()).collect();

    eventually("full mesh", || async {
        a.connected_peers().await.unwrap().len() == 2
            && b.connected_peers().await.unwrap().len() == 2
            && c.connected_peers().await.unwrap().len() == 2
    })
    .await;

    // a learns b's and c's own view of their connections
    eventually("a's map to cover the mesh", || async {
        let map = a.peer_map().await;
        ids.iter().all(|id| {
            map.iter().any(|record| {
                &record.peer_id == id
                    && record.connections.len() == 2
                    && record.connections.iter().all(|c| c.connected)
            })
        })
    })
    .await;

    let map = a.peer_map().await;
    let b_record = map.iter().find(|r| r.peer_id == ids[1]).unwrap();
    assert!(b_record.connections.iter().any(|c| c.peer_id == ids[0]));
    assert!(b_record.connections.iter().any(|c| c.peer_id == ids[2]));
}
