//! Transfer tests -- whole files across a real link, and peers that vanish.

use std::time::Duration;

use syncstream_node::node::PEER_DISCONNECTED;
use syncstream_protocol::{FileAccept, FileChunk, FileOffer, Message};
use syncstream_transfer::{Direction, Event, MemoryHistory, TransferState};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::harness::{
    connected_pair, pattern, read_message, sha256_hex, wait_for, wait_terminal, write_message,
    TestNode, TestNodeBuilder, EVENT_TIMEOUT,
};

fn completed(direction: Direction) -> impl FnMut(&Event) -> bool {
    move |e| matches!(e, Event::TransferComplete(t) if t.direction == direction)
}

#[tokio::test]
async fn test_file_reaches_peer_intact() {
    let history = MemoryHistory::new();
    let (mut a, mut b) = connected_pair(
        TestNodeBuilder::new("alice").history(history.clone()),
        TestNodeBuilder::new("bob").chunk_size(65536),
    )
    .await
    .unwrap();

    let data = pattern(200_000);
    let path = b.write_file("photo.jpg", &data);
    let queued = b.node.send_file(&path).await.unwrap();
    assert_eq!(queued.chunks_total, 4);
    assert_eq!(queued.sha256, sha256_hex(&data));
    assert_eq!(queued.sender, "bob");

    let mut progress = 0;
    let sent = loop {
        let event = b
            .wait_for("sender events", |e| e.transfer().is_some())
            .await
            .unwrap();
        match event {
            Event::TransferProgress(_) => progress += 1,
            Event::TransferComplete(t) => break t,
            Event::TransferError { message, .. } => panic!("send failed: {message}"),
            _ => {}
        }
    };
    assert_eq!(progress, 4);
    assert_eq!(sent.state, TransferState::Completed);
    assert_eq!(sent.bytes_transferred, 200_000);

    let Event::TransferComplete(received) = a
        .wait_for("receiver complete", completed(Direction::Receiving))
        .await
        .unwrap()
    else {
        unreachable!()
    };
    assert_eq!(received.id, queued.id);
    assert_eq!(received.filename, "photo.jpg");
    assert_eq!(received.chunks_total, 4);
    assert_eq!(received.sender, "bob");

    let stored = a.node.transfer(&queued.id).await.unwrap();
    assert_eq!(stored.state, TransferState::Completed);
    assert_eq!(stored.sha256, sha256_hex(&data));
    let on_disk = std::fs::read(a.save_dir().join("photo.jpg")).unwrap();
    assert_eq!(on_disk, data);

    let entries = history.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].transfer_id, queued.id);
    assert_eq!(entries[0].direction, Direction::Receiving);
    assert_eq!(entries[0].state, TransferState::Completed);
    assert_eq!(entries[0].size, 200_000);
    assert_eq!(entries[0].sender, "bob");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_empty_file_transfer() {
    let (mut a, mut b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();

    let path = b.write_file("empty.bin", b"");
    let queued = b.node.send_file(&path).await.unwrap();
    assert_eq!(queued.chunks_total, 0);

    b.wait_for("sender complete", completed(Direction::Sending))
        .await
        .unwrap();
    a.wait_for("receiver complete", completed(Direction::Receiving))
        .await
        .unwrap();

    let stored = a.node.transfer(&queued.id).await.unwrap();
    assert_eq!(stored.state, TransferState::Completed);
    assert_eq!(stored.progress_percent(), 100.0);
    assert_eq!(stored.sha256, sha256_hex(b""));
    assert_eq!(
        std::fs::metadata(a.save_dir().join("empty.bin")).unwrap().len(),
        0
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_same_name_gets_suffix() {
    let (mut a, b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();

    let path = b.write_file("report.txt", b"first");
    b.node.send_file(&path).await.unwrap();
    a.wait_for("first", completed(Direction::Receiving)).await.unwrap();

    std::fs::write(&path, b"second").unwrap();
    b.node.send_file(&path).await.unwrap();
    a.wait_for("second", completed(Direction::Receiving)).await.unwrap();

    assert_eq!(std::fs::read(a.save_dir().join("report.txt")).unwrap(), b"first");
    assert_eq!(std::fs::read(a.save_dir().join("report_1.txt")).unwrap(), b"second");
    assert_eq!(a.node.transfers().await.len(), 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_missing_file_is_refused() {
    let (a, b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();
    let missing = b.dir().join("nope.txt");
    assert!(b.node.send_file(&missing).await.is_err());
    assert!(b.node.transfers().await.is_empty());
    a.shutdown().await;
    b.shutdown().await;
}

/// The receiving side drops the socket partway through a large file.
#[tokio::test]
async fn test_sender_fails_when_peer_vanishes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap().to_string();
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // refuse the reconnect attempts that follow
        drop(listener);
        let Message::Offer(offer) = read_message(&mut stream).await.unwrap() else {
            panic!("expected an offer first");
        };
        write_message(
            &mut stream,
            &Message::Accept(FileAccept {
                transfer_id: offer.transfer_id,
            }),
        )
        .await
        .unwrap();
        let mut buf = vec![0u8; 256 * 1024];
        let mut read = 0;
        while read < 256 * 1024 {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => read += n,
            }
        }
        // dropping the stream with unread data resets the connection
        drop(stream);
    });

    let mut b = TestNodeBuilder::new("b").reconnect(5, 1, 1).start().await.unwrap();
    b.node.connect(&peer_addr).unwrap();
    b.wait_connected().await.unwrap();

    let path = b.write_file("big.bin", &pattern(16 * 1024 * 1024));
    let queued = b.node.send_file(&path).await.unwrap();

    let mut saw_disconnect = false;
    let event = b
        .wait_for("transfer error", |e| {
            saw_disconnect |= matches!(e, Event::Disconnected);
            matches!(e, Event::TransferError { .. })
        })
        .await
        .unwrap();
    let Event::TransferError { transfer, .. } = event else {
        unreachable!()
    };
    assert_eq!(transfer.id, queued.id);
    assert_eq!(transfer.state, TransferState::Failed);
    assert_eq!(transfer.retry_count, 1);

    if !saw_disconnect {
        b.wait_disconnected().await.unwrap();
    }
    b.wait_for("reconnect attempt", |e| matches!(e, Event::Reconnecting { .. }))
        .await
        .unwrap();

    let stored = b.node.transfer(&queued.id).await.unwrap();
    assert_eq!(stored.state, TransferState::Failed);
    assert!(stored.last_error.is_some());
    assert!(stored.bytes_transferred < stored.size_bytes);

    b.shutdown().await;
    peer.await.unwrap();
}

fn offer_for(id: &str, name: &str, data: &[u8]) -> Message {
    Message::Offer(FileOffer {
        transfer_id: id.into(),
        filename: name.into(),
        file_size: data.len() as u64,
        file_hash: sha256_hex(data),
        sender: "raw".into(),
    })
}

/// A sender's outcome must match what the receiver stored.
async fn assert_delivery(sender: &TestNode, receiver: &TestNode, id: &str, name: &str, data: &[u8]) {
    let sent = wait_terminal(sender, id, Duration::from_secs(30)).await.unwrap();
    match sent.state {
        TransferState::Completed => {
            let received = wait_terminal(receiver, id, EVENT_TIMEOUT).await.unwrap();
            assert_eq!(received.state, TransferState::Completed, "{name}");
            assert_eq!(std::fs::read(&received.local_path).unwrap(), data, "{name}");
        }
        TransferState::Failed => {
            assert_eq!(sent.bytes_transferred, 0, "{name} streamed before a reject");
            tokio::time::sleep(Duration::from_millis(100)).await;
            let received = receiver.node.transfer(id).await;
            assert!(
                received.map_or(true, |t| t.state != TransferState::Completed),
                "{name} stored by a peer whose sender failed"
            );
        }
        state => panic!("{name} ended {state}"),
    }
}

/// Both peers offer a file at the same moment.
#[tokio::test]
async fn test_simultaneous_sends_agree_on_outcome() {
    let (a, b) = connected_pair(TestNodeBuilder::new("a"), TestNodeBuilder::new("b"))
        .await
        .unwrap();

    let a_data = pattern(4 * 1024 * 1024);
    let b_data = pattern(1000);
    let a_path = a.write_file("from_a.bin", &a_data);
    let b_path = b.write_file("from_b.bin", &b_data);

    let (a_sent, b_sent) = tokio::join!(a.node.send_file(&a_path), b.node.send_file(&b_path));
    let (a_sent, b_sent) = (a_sent.unwrap(), b_sent.unwrap());

    assert_delivery(&a, &b, &a_sent.id, "from_a.bin", &a_data).await;
    assert_delivery(&b, &a, &b_sent.id, "from_b.bin", &b_data).await;

    a.shutdown().await;
    b.shutdown().await;
}

/// A dropped link frees the receive slot even while the event bus is
/// flooded faster than any subscriber drains it.
#[tokio::test]
async fn test_disconnect_frees_receiver_under_event_flood() {
    let a = TestNode::start("a").await.unwrap();
    let mut raw = TcpStream::connect(a.address()).await.unwrap();

    let data = pattern(10_000);
    write_message(&mut raw, &offer_for("t-flood", "flood.bin", &data))
        .await
        .unwrap();
    assert!(matches!(read_message(&mut raw).await.unwrap(), Message::Accept(_)));
    drop(raw);

    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    let failed = loop {
        for i in 0..4096 {
            a.node.events().emit(Event::DataReceived {
                text: format!("noise {i}"),
            });
        }
        match a.node.transfer("t-flood").await {
            Some(t) if t.state == TransferState::Failed => break t,
            _ => {}
        }
        assert!(tokio::time::Instant::now() < deadline, "transfer never failed");
        tokio::task::yield_now().await;
    };
    assert_eq!(failed.last_error.as_deref(), Some(PEER_DISCONNECTED));

    let mut raw = TcpStream::connect(a.address()).await.unwrap();
    write_message(&mut raw, &offer_for("t-next", "next.bin", &data))
        .await
        .unwrap();
    assert!(matches!(read_message(&mut raw).await.unwrap(), Message::Accept(_)));

    drop(raw);
    a.shutdown().await;
}

/// The sending side vanishes after one chunk; the receiver gives up on it.
#[tokio::test]
async fn test_receiver_fails_inflight_on_disconnect() {
    let mut a = TestNode::start("a").await.unwrap();
    let mut raw = TcpStream::connect(a.address()).await.unwrap();
    a.wait_connected().await.unwrap();

    let data = pattern(10_000);
    write_message(
        &mut raw,
        &Message::Offer(FileOffer {
            transfer_id: "t-cut".into(),
            filename: "cut.bin".into(),
            file_size: data.len() as u64,
            file_hash: sha256_hex(&data),
            sender: "raw".into(),
        }),
    )
    .await
    .unwrap();
    write_message(
        &mut raw,
        &Message::Chunk(FileChunk {
            transfer_id: "t-cut".into(),
            chunk_num: 0,
            chunk_data: data[..4096].to_vec(),
        }),
    )
    .await
    .unwrap();

    a.wait_for("chunk", |e| matches!(e, Event::TransferProgress(_)))
        .await
        .unwrap();
    drop(raw);

    let event = wait_for(&mut a.events, "receiver failure", EVENT_TIMEOUT, |e| {
        matches!(e, Event::TransferError { .. })
    })
    .await
    .unwrap();
    let Event::TransferError { transfer, message } = event else {
        unreachable!()
    };
    assert_eq!(transfer.id, "t-cut");
    assert_eq!(transfer.direction, Direction::Receiving);
    assert_eq!(message, PEER_DISCONNECTED);
    assert_eq!(transfer.bytes_transferred, 4096);
    assert_eq!(transfer.retry_count, 0);

    // the partial file stays where it was reserved
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.save_dir().join("cut.bin").exists());

    a.shutdown().await;
}
