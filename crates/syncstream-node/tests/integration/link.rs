//! Link tests -- control strings, single-peer rule, disconnect handling.

use std::time::Duration;

use syncstream_node::LinkState;
use syncstream_transfer::Event;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::harness::{connected_pair, write_raw, TestNode, TestNodeBuilder};

#[tokio::test]
async fn test_control_strings_both_ways() {
    let (mut a, mut b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();

    b.node.send_text("ping").await.unwrap();
    let event = a
        .wait_for("ping", |e| matches!(e, Event::DataReceived { .. }))
        .await
        .unwrap();
    assert!(matches!(event, Event::DataReceived { text } if text == "ping"));

    a.node.send_text("pong").await.unwrap();
    let event = b
        .wait_for("pong", |e| matches!(e, Event::DataReceived { .. }))
        .await
        .unwrap();
    assert!(matches!(event, Event::DataReceived { text } if text == "pong"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_second_inbound_connection_is_closed() {
    let (mut a, b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();

    let mut intruder = TcpStream::connect(a.address()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), intruder.read(&mut buf))
        .await
        .expect("second connection was left open")
        .unwrap_or(0);
    assert_eq!(n, 0, "second connection should be closed without data");

    // the original peer is untouched
    assert_eq!(a.node.state(), LinkState::Connected);
    b.node.send_text("still here").await.unwrap();
    let event = a
        .wait_for("text after intruder", |e| matches!(e, Event::DataReceived { .. }))
        .await
        .unwrap();
    assert!(matches!(event, Event::DataReceived { text } if text == "still here"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (mut a, mut b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();

    b.node.disconnect().await;
    b.node.disconnect().await;
    assert_eq!(b.node.state(), LinkState::Disconnected);
    assert!(b.node.link().last_disconnect().is_some());

    let names = b.drain_for(Duration::from_millis(500)).await;
    assert_eq!(
        names.iter().filter(|n| **n == "on_disconnected").count(),
        1,
        "events: {names:?}"
    );
    assert!(!names.contains(&"on_reconnecting"));

    // the other side notices the close
    a.wait_disconnected().await.unwrap();
    assert_eq!(a.node.state(), LinkState::Disconnected);
    assert!(a.node.send_text("anyone?").await.is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_connect_while_connected_is_refused() {
    let (a, b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();
    assert!(b.node.connect(&a.address()).is_err());
    assert!(b.node.is_connected());
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let mut a = TestNode::start("a").await.unwrap();
    let mut raw = TcpStream::connect(a.address()).await.unwrap();
    a.wait_connected().await.unwrap();

    // unknown message type
    write_raw(&mut raw, br#"{"type":"file_delete","data":{}}"#).await.unwrap();
    // known type, missing field
    write_raw(&mut raw, br#"{"type":"file_accept","data":{}}"#).await.unwrap();
    // invalid UTF-8
    write_raw(&mut raw, &[0xff, 0xfe, 0x00]).await.unwrap();
    write_raw(&mut raw, b"after the junk").await.unwrap();

    let event = a
        .wait_for("text after junk", |e| matches!(e, Event::DataReceived { .. }))
        .await
        .unwrap();
    assert!(matches!(event, Event::DataReceived { text } if text == "after the junk"));
    assert_eq!(a.node.state(), LinkState::Connected);
    assert!(a.node.transfers().await.is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let mut a = TestNode::start("a").await.unwrap();
    let mut raw = TcpStream::connect(a.address()).await.unwrap();
    a.wait_connected().await.unwrap();

    raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    raw.write_all(b"{}").await.unwrap();

    a.wait_disconnected().await.unwrap();
    assert_eq!(a.node.state(), LinkState::Disconnected);

    // a fresh connection is accepted afterwards
    let _raw2 = TcpStream::connect(a.address()).await.unwrap();
    a.wait_connected().await.unwrap();

    a.shutdown().await;
}
