//! End-to-end tests: two sessions talking through a real broker server.
//!
//! Each test starts `polychat-broker` on a random local port and connects
//! sessions to it with the WebSocket adapter.
//!
//! Verification command: `cargo test --test broker_end_to_end`

use std::sync::Arc;
use std::time::Duration;

use polychat::broker::ws::WsBroker;
use polychat::fetch::{FetchConfig, FetchLoop};
use polychat::session::{ReceivedMessage, Session, SessionError, SessionParams};
use polychat_broker::server::{BrokerLimits, BrokerState, start_server, start_server_with_state};
use polychat_broker::topics::Topics;
use polychat_proto::OffsetPolicy;

// =============================================================================
// Helpers
// =============================================================================

async fn start_broker() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test broker")
}

async fn connect(
    addr: std::net::SocketAddr,
    nickname: &str,
    policy: OffsetPolicy,
) -> Session<WsBroker> {
    let broker = WsBroker::new("127.0.0.1", addr.port());
    Session::connect(
        broker,
        SessionParams {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            nickname: nickname.to_string(),
            offset_policy: policy,
        },
    )
    .await
    .expect("session should connect")
}

fn quick() -> FetchConfig {
    FetchConfig {
        poll_interval: Duration::from_millis(20),
        idle_backoff: Duration::from_millis(20),
        max_wait: Duration::from_millis(200),
    }
}

/// Polls until at least `count` messages arrived, then drains them.
async fn receive(session: &Session<WsBroker>, count: usize) -> Vec<ReceivedMessage> {
    let fetcher = FetchLoop::new(session.shared(), quick());
    let mut received = Vec::new();
    for _ in 0..50 {
        fetcher.poll_once().await;
        received.extend(session.take_messages().await);
        if received.len() >= count {
            break;
        }
    }
    received
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn targeted_message_crosses_the_broker() {
    let (addr, _server) = start_broker().await;
    let alice = connect(addr, "alice", OffsetPolicy::Latest).await;
    let bob = connect(addr, "bob", OffsetPolicy::Latest).await;

    alice.join("general").await.unwrap();
    bob.join("general").await.unwrap();
    alice.send_to("general", "hi bob").await.unwrap();

    let received = receive(&bob, 1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].to_string(), "[general](alice) hi bob");
}

#[tokio::test]
async fn broadcast_reaches_only_joined_channels() {
    let (addr, _server) = start_broker().await;
    let alice = connect(addr, "alice", OffsetPolicy::Latest).await;
    let bob = connect(addr, "bob", OffsetPolicy::Latest).await;

    alice.join("a").await.unwrap();
    alice.join("b").await.unwrap();
    bob.join("a").await.unwrap();
    bob.join("b").await.unwrap();
    bob.join("c").await.unwrap();

    assert_eq!(alice.broadcast("hello").await.unwrap(), 2);

    let mut channels: Vec<String> = receive(&bob, 2).await.into_iter().map(|m| m.channel).collect();
    channels.sort();
    assert_eq!(channels, vec!["a", "b"]);
}

#[tokio::test]
async fn earliest_session_sees_history_latest_does_not() {
    let (addr, _server) = start_broker().await;
    let alice = connect(addr, "alice", OffsetPolicy::Latest).await;
    alice.join("log").await.unwrap();
    alice.send_to("log", "first").await.unwrap();

    let late_latest = connect(addr, "carol", OffsetPolicy::Latest).await;
    let late_earliest = connect(addr, "dave", OffsetPolicy::Earliest).await;
    late_latest.join("log").await.unwrap();
    late_earliest.join("log").await.unwrap();

    let replayed = receive(&late_earliest, 1).await;
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].text, "(alice) first");

    let fetcher = FetchLoop::new(late_latest.shared(), quick());
    fetcher.poll_once().await;
    assert!(!late_latest.has_messages().await);
}

#[tokio::test]
async fn rename_keeps_channels_working() {
    let (addr, _server) = start_broker().await;
    let alice = connect(addr, "alice", OffsetPolicy::Latest).await;
    let bob = connect(addr, "bob", OffsetPolicy::Latest).await;
    alice.join("general").await.unwrap();
    bob.join("general").await.unwrap();

    alice
        .rotate_identity("alicia")
        .await
        .into_result("alicia")
        .unwrap();
    alice.broadcast("new name").await.unwrap();
    bob.send_to("general", "welcome").await.unwrap();

    // Bob is joined too, so his own message comes back alongside Alice's.
    let at_bob = receive(&bob, 2).await;
    assert!(at_bob.iter().any(|m| m.text == "(alicia) new name"));

    let at_alice = receive(&alice, 2).await;
    assert!(at_alice.iter().any(|m| m.text == "(bob) welcome"));
}

#[tokio::test]
async fn oversized_payload_is_publisher_unavailable() {
    let limits = BrokerLimits {
        max_payload_size: 16,
        ..BrokerLimits::default()
    };
    let state = Arc::new(BrokerState::with_limits(limits, Topics::new()));
    let (addr, _server) = start_server_with_state("127.0.0.1:0", state)
        .await
        .unwrap();
    let alice = connect(addr, "alice", OffsetPolicy::Latest).await;
    alice.join("tiny").await.unwrap();

    let err = alice
        .send_to("tiny", "this message is far too long for the broker")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PublisherUnavailable(_)));

    // The connection survives a rejected publish.
    alice.send_to("tiny", "ok").await.unwrap();
}

#[tokio::test]
async fn shutdown_releases_broker_connections() {
    let state = Arc::new(BrokerState::new());
    let (addr, _server) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let alice = connect(addr, "alice", OffsetPolicy::Latest).await;
    alice.join("a").await.unwrap();
    alice.join("b").await.unwrap();
    assert_eq!(state.active_cursors(), 2);

    let failures = alice.shutdown().await;
    assert!(failures.is_empty());

    for _ in 0..50 {
        if state.active_cursors() == 0 && state.active_publishers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.active_cursors(), 0);
    assert_eq!(state.active_publishers(), 0);
}
