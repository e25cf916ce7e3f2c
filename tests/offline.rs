//! Tests for behavior while the relay is unreachable.

mod common;

use common::{init_logging, TestRelay};
use robofleet_link::{
    ConnectionOptions, ConnectionState, RobofleetLinkClient, SubscriptionAction, TopicPattern,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Reserve an address with nothing listening on it.
async fn free_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_subscriptions_made_while_disconnected_flush_on_connect() {
    init_logging();
    let addr = free_addr().await;
    let client = RobofleetLinkClient::builder()
        .server_url(format!("ws://{}", addr))
        .options(
            ConnectionOptions::new()
                .with_reconnect_delay_ms(100)
                .with_connect_timeout_ms(1000),
        )
        .build()
        .unwrap();

    // No relay yet: the initial attempt fails and the task keeps retrying.
    let conn = client.connect().await.unwrap();
    assert_ne!(conn.state(), ConnectionState::Connected);

    let pattern = TopicPattern::any_topic_under("robot1").unwrap();
    let _guard = conn.listen(pattern.clone(), |_, _| {}).await.unwrap();

    // The entry is recorded but nothing was sent.
    let snapshot = conn.subscriptions().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[0].subscribed);

    // Bring the relay up on the address the client is retrying.
    let relay = TestRelay::start_on(addr).await;
    let mut state_rx = conn.state_changes();
    timeout(
        Duration::from_secs(10),
        state_rx.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("client should connect once the relay exists")
    .unwrap();

    // The deferred subscription is flushed exactly once.
    relay.wait_for_subscriptions(1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let subs = relay.subscription_frames();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0], (pattern.source().to_string(), SubscriptionAction::Subscribe));

    let snapshot = conn.subscriptions().await.unwrap();
    assert!(snapshot[0].subscribed);
}

#[tokio::test]
async fn test_listener_released_while_offline_never_reaches_the_relay() {
    init_logging();
    let addr = free_addr().await;
    let client = RobofleetLinkClient::builder()
        .server_url(format!("ws://{}", addr))
        .options(
            ConnectionOptions::new()
                .with_reconnect_delay_ms(100)
                .with_connect_timeout_ms(1000),
        )
        .build()
        .unwrap();
    let conn = client.connect().await.unwrap();

    let pattern = TopicPattern::exact("robot1/status").unwrap();
    let mut guard = conn.listen(pattern, |_, _| {}).await.unwrap();
    guard.close().await.unwrap();

    // The entry came and went while offline, so connecting now must not
    // produce any subscription traffic for it.
    let relay = TestRelay::start_on(addr).await;
    let mut state_rx = conn.state_changes();
    timeout(
        Duration::from_secs(10),
        state_rx.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(relay.subscription_frames().is_empty());
}
