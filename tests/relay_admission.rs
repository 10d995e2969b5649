//! Integration tests for relay join admission.
//!
//! These tests validate the rendezvous listener against real UDP sockets:
//! admission, reverse-link addressing, name collisions, duplicate-join
//! dedup, and traffic reflection between admitted sites.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test relay_admission -- --nocapture

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use wanlink::messages::{self, Envelope, JoinBody, Message, ResponsePayload};
use wanlink::{
    BundleSink, Distributor, IfaceSelector, Link, LinkAdvert, LinkConfig, LinkError, LinkState,
    NullSink, Reflector, RelayListener, AUTO_ASSIGN,
};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

async fn start_relay() -> (Arc<Reflector>, RelayListener) {
    let reflector = Arc::new(Reflector::new());
    let listener = RelayListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        reflector.clone(),
        reflector.clone(),
    )
    .await
    .expect("listener bind failed");
    (reflector, listener)
}

fn site_config(name: &str, site_name: &str, relay: SocketAddr) -> LinkConfig {
    let mut config = LinkConfig::new(name, site_name, relay.ip().to_string(), relay.port());
    config.interface = IfaceSelector::Loopback;
    config
}

// ============================================================================
// Join Admission
// ============================================================================

#[tokio::test]
async fn join_brings_link_up_and_targets_observed_address() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    let link = Link::new(
        site_config("wan", "alpha", listener.local_addr()),
        Arc::new(NullSink),
    );
    timeout(TEST_TIMEOUT, link.up())
        .await
        .expect("handshake should finish in time")
        .expect("up should succeed");

    assert_eq!(link.state(), LinkState::Up);
    assert!(reflector.contains_link_with_name("alpha").await);

    // The reverse link targets the literal UDP source of the join, not
    // anything the client advertised.
    let reverse = reflector.link("alpha").await.expect("reverse link registered");
    assert_eq!(reverse.state(), LinkState::Up);
    assert!(reverse.is_transient());
    assert_eq!(reverse.target_addr(), link.local_addr());

    link.down().await;
    listener.shutdown().await;
    reflector.down_all().await;
}

#[tokio::test]
async fn name_collision_is_rejected_with_error_response() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    let first = Link::new(
        site_config("wan-1", "alpha", listener.local_addr()),
        Arc::new(NullSink),
    );
    timeout(TEST_TIMEOUT, first.up()).await.unwrap().expect("first join should succeed");

    let second = Link::new(
        site_config("wan-2", "alpha", listener.local_addr()),
        Arc::new(NullSink),
    );
    let err = timeout(TEST_TIMEOUT, second.up())
        .await
        .unwrap()
        .expect_err("second join should be rejected");

    match err {
        LinkError::HandshakeRejected { step, reason } => {
            assert_eq!(step, "join");
            assert!(reason.contains("taken"), "unexpected reason: {}", reason);
        }
        other => panic!("expected HandshakeRejected, got {:?}", other),
    }
    assert_eq!(second.state(), LinkState::Down);

    // Exactly one reverse link exists.
    assert_eq!(reflector.len().await, 1);

    first.down().await;
    listener.shutdown().await;
    reflector.down_all().await;
}

#[tokio::test]
async fn auto_assign_generates_unique_site_name() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    let link = Link::new(
        site_config("wan", AUTO_ASSIGN, listener.local_addr()),
        Arc::new(NullSink),
    );
    timeout(TEST_TIMEOUT, link.up()).await.unwrap().expect("up should succeed");

    assert!(reflector.contains_link_with_name("site-1").await);
    assert!(!reflector.contains_link_with_name(AUTO_ASSIGN).await);

    link.down().await;
    listener.shutdown().await;
    reflector.down_all().await;
}

// ============================================================================
// Duplicate Join Dedup
// ============================================================================

#[tokio::test]
async fn duplicate_joins_from_one_source_create_one_link() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    // Hand-rolled site: a raw socket that retransmits its join and answers
    // the reverse link's connectivity probes.
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let join = Envelope::new(
        77,
        Message::Join(JoinBody { site_name: "dup".to_string(), config: LinkAdvert::default() }),
    );
    let bytes = messages::encode(&join).unwrap();
    raw.send_to(&bytes, listener.local_addr()).await.unwrap();
    raw.send_to(&bytes, listener.local_addr()).await.unwrap();

    let mut ok_responses = 0u32;
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let received = match timeout(deadline - now, raw.recv_from(&mut buf)).await {
            Ok(result) => result.expect("recv failed"),
            Err(_) => break,
        };
        let (len, from) = received;
        let envelope = match messages::decode(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(_) => continue,
        };
        match envelope.message {
            Message::KeepAlive { is_request: true } => {
                let reply = Envelope::new(
                    envelope.correlation_id,
                    Message::Response(ResponsePayload::ok()),
                );
                raw.send_to(&messages::encode(&reply).unwrap(), from).await.unwrap();
            }
            Message::Response(response) if response.ok && envelope.correlation_id == 77 => {
                ok_responses += 1;
            }
            _ => {}
        }
    }

    assert!(ok_responses >= 1, "the join should be acknowledged");
    assert_eq!(reflector.len().await, 1, "at most one reverse link per source");
    assert!(reflector.contains_link_with_name("dup").await);

    listener.shutdown().await;
    reflector.down_all().await;
}

// ============================================================================
// Listener Control Plane
// ============================================================================

#[tokio::test]
async fn keepalive_request_gets_correlated_ok_response() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let probe = Envelope::new(0x0123_4567, Message::KeepAlive { is_request: true });
    raw.send_to(&messages::encode(&probe).unwrap(), listener.local_addr()).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = timeout(Duration::from_secs(2), raw.recv_from(&mut buf))
        .await
        .expect("probe should be answered")
        .unwrap();

    let envelope = messages::decode(&buf[..len]).unwrap();
    assert_eq!(envelope.correlation_id, 0x0123_4567);
    match envelope.message {
        Message::Response(response) => assert!(response.ok),
        other => panic!("expected a response, got {:?}", other),
    }

    listener.shutdown().await;
    reflector.down_all().await;
}

#[tokio::test]
async fn listener_survives_undersized_and_unknown_datagrams() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Below the minimum control-message size.
    raw.send_to(&[0x01, 0x02], listener.local_addr()).await.unwrap();
    // Unknown type tag with a well-formed header.
    raw.send_to(&[0x7f, 0, 0, 0, 1, 9, 9], listener.local_addr()).await.unwrap();

    // The accept loop must still answer probes afterwards.
    let probe = Envelope::new(5, Message::KeepAlive { is_request: true });
    raw.send_to(&messages::encode(&probe).unwrap(), listener.local_addr()).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, _) = timeout(Duration::from_secs(2), raw.recv_from(&mut buf))
        .await
        .expect("listener should keep serving after bad datagrams")
        .unwrap();
    assert_eq!(messages::decode(&buf[..len]).unwrap().correlation_id, 5);

    listener.shutdown().await;
    reflector.down_all().await;
}

// ============================================================================
// Traffic Reflection
// ============================================================================

struct CaptureSink {
    tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
}

#[async_trait]
impl BundleSink for CaptureSink {
    async fn forward(&self, source_link: &str, payload: Vec<u8>) {
        let _ = self.tx.send((source_link.to_string(), payload));
    }
}

#[tokio::test]
async fn bundle_is_reflected_to_the_other_site() {
    init_tracing();
    let (reflector, listener) = start_relay().await;

    let alpha = Link::new(
        site_config("wan-alpha", "alpha", listener.local_addr()),
        Arc::new(NullSink),
    );
    timeout(TEST_TIMEOUT, alpha.up()).await.unwrap().expect("alpha join should succeed");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let beta = Link::new(
        site_config("wan-beta", "beta", listener.local_addr()),
        Arc::new(CaptureSink { tx }),
    );
    timeout(TEST_TIMEOUT, beta.up()).await.unwrap().expect("beta join should succeed");

    alpha.reflect(b"entity state update".to_vec()).await;

    let (source, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bundle should arrive at the other site")
        .expect("capture channel open");
    assert_eq!(source, "wan-beta");
    assert_eq!(payload, b"entity state update");

    alpha.down().await;
    beta.down().await;
    listener.shutdown().await;
    reflector.down_all().await;
}
