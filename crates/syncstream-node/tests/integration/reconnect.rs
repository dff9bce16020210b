//! Reconnect tests -- restoring a dropped link and giving up on a dead peer.

use std::time::Duration;

use syncstream_node::reconnect::RECONNECT_TIMEOUT_MESSAGE;
use syncstream_node::LinkState;
use syncstream_transfer::Event;

use crate::harness::{wait_for, TestNodeBuilder};

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_link_restored_after_peer_restart() {
    let mut a = TestNodeBuilder::new("a").start().await.unwrap();
    let port = a.port();
    let mut b = TestNodeBuilder::new("b").reconnect(20, 1, 1).start().await.unwrap();
    b.node.connect(&a.address()).unwrap();
    b.wait_connected().await.unwrap();
    a.wait_connected().await.unwrap();

    a.shutdown().await;
    b.wait_disconnected().await.unwrap();
    b.wait_for("reconnecting", |e| matches!(e, Event::Reconnecting { .. }))
        .await
        .unwrap();

    let mut a2 = TestNodeBuilder::new("a").listen_port(port).start().await.unwrap();
    b.wait_connected().await.unwrap();
    a2.wait_connected().await.unwrap();
    assert_eq!(b.node.state(), LinkState::Connected);
    assert_eq!(b.node.link().reconnect_attempts(), 0);
    assert!(!b.node.link().reconnecting());

    b.node.send_text("back").await.unwrap();
    let event = a2
        .wait_for("text", |e| matches!(e, Event::DataReceived { .. }))
        .await
        .unwrap();
    assert!(matches!(event, Event::DataReceived { text } if text == "back"));

    a2.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_gives_up_after_timeout() {
    let port = closed_port();
    let mut b = TestNodeBuilder::new("b").reconnect(3, 1, 2).start().await.unwrap();
    b.node.connect(&format!("127.0.0.1:{port}")).unwrap();

    let mut attempts = Vec::new();
    let event = wait_for(&mut b.events, "reconnect timeout", Duration::from_secs(15), |e| {
        if let Event::Reconnecting { attempt } = e {
            attempts.push(*attempt);
        }
        matches!(e, Event::ConnectionError { message } if message == RECONNECT_TIMEOUT_MESSAGE)
    })
    .await
    .unwrap();
    assert!(matches!(event, Event::ConnectionError { .. }));

    // attempts at roughly 0s, 1s, 2s; the backoff would overrun the window
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(b.node.state(), LinkState::Disconnected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!b.node.link().reconnecting());

    b.shutdown().await;
}

#[tokio::test]
async fn test_disabled_reconnect_stays_down() {
    let port = closed_port();
    let mut b = TestNodeBuilder::new("b").start().await.unwrap();
    b.node.connect(&format!("127.0.0.1:{port}")).unwrap();
    b.wait_for("dial error", |e| matches!(e, Event::ConnectionError { .. }))
        .await
        .unwrap();

    let names = b.drain_for(Duration::from_millis(1500)).await;
    assert!(!names.contains(&"on_reconnecting"), "events: {names:?}");
    assert!(!b.node.try_reconnect());
    b.shutdown().await;
}

#[tokio::test]
async fn test_manual_reconnect() {
    let mut a = TestNodeBuilder::new("a").start().await.unwrap();
    let mut b = TestNodeBuilder::new("b").start().await.unwrap();
    b.node.connect(&a.address()).unwrap();
    b.wait_connected().await.unwrap();
    a.wait_connected().await.unwrap();

    b.node.disconnect().await;
    a.wait_disconnected().await.unwrap();
    assert!(!b.node.try_reconnect(), "auto-reconnect is off");

    b.node.set_auto_reconnect(true);
    assert!(b.node.try_reconnect());
    b.wait_for("reconnecting", |e| matches!(e, Event::Reconnecting { attempt: 1 }))
        .await
        .unwrap();
    b.wait_connected().await.unwrap();
    a.wait_connected().await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}
