//! Test harness for in-process syncstream-node integration tests.
//!
//! Provides TestNode (a running node with its own save directory and event
//! subscription), TestNodeBuilder (config) and raw-socket helpers for
//! playing a misbehaving peer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use syncstream_node::config::NodeConfig;
use syncstream_node::{NodeError, SyncNode};
use syncstream_protocol::{encode_frame, Inbound, Message};
use syncstream_transfer::{Event, MemoryHistory, Transfer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestNodeBuilder {
    name: String,
    listen_port: u16,
    chunk_size: Option<usize>,
    reconnect: Option<(u64, u64, u64)>,
    history: Option<MemoryHistory>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            listen_port: 0,
            chunk_size: None,
            reconnect: None,
            history: None,
        }
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Record finished transfers into `history`.
    pub fn history(mut self, history: MemoryHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Enable auto-reconnect with (timeout, retry interval, backoff) in seconds.
    pub fn reconnect(mut self, timeout_secs: u64, interval_secs: u64, backoff_secs: u64) -> Self {
        self.reconnect = Some((timeout_secs, interval_secs, backoff_secs));
        self
    }

    pub async fn start(self) -> anyhow::Result<TestNode> {
        let tempdir = tempfile::tempdir()?;
        let mut config = NodeConfig::default();
        config.node.name = self.name;
        config.node.save_dir = tempdir.path().join("incoming").display().to_string();
        config.network.listen_port = self.listen_port;
        config.network.connect_timeout_secs = 2;
        if let Some(chunk_size) = self.chunk_size {
            config.transfer.chunk_size = chunk_size;
        }
        match self.reconnect {
            Some((timeout, interval, backoff)) => {
                config.reconnect.enabled = true;
                config.reconnect.timeout_secs = timeout;
                config.reconnect.retry_interval_secs = interval;
                config.reconnect.backoff_secs = backoff;
            }
            None => config.reconnect.enabled = false,
        }

        // a listener on the same fixed port may still be winding down
        let mut attempts = 0;
        let node = loop {
            let started = match &self.history {
                Some(history) => {
                    SyncNode::start_with_history(config.clone(), Arc::new(history.clone())).await
                }
                None => SyncNode::start(config.clone()).await,
            };
            match started {
                Ok(node) => break node,
                Err(NodeError::Link(_)) if attempts < 40 && self.listen_port != 0 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let events = node.subscribe();
        Ok(TestNode {
            node,
            events,
            _tempdir: tempdir,
        })
    }
}

/// A running node plus an event subscription taken at startup.
pub struct TestNode {
    pub node: SyncNode,
    pub events: broadcast::Receiver<Event>,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start(name: &str) -> anyhow::Result<Self> {
        TestNodeBuilder::new(name).start().await
    }

    pub fn port(&self) -> u16 {
        self.node.listen_addr().port()
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    pub fn dir(&self) -> &Path {
        self._tempdir.path()
    }

    pub fn save_dir(&self) -> PathBuf {
        self.dir().join("incoming")
    }

    /// Write `data` to a file in this node's directory.
    pub fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir().join(name);
        std::fs::write(&path, data).expect("write test file");
        path
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for<F>(&mut self, what: &str, pred: F) -> anyhow::Result<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        wait_for(&mut self.events, what, EVENT_TIMEOUT, pred).await
    }

    pub async fn wait_connected(&mut self) -> anyhow::Result<()> {
        self.wait_for("connected", |e| matches!(e, Event::Connected { .. }))
            .await
            .map(|_| ())
    }

    pub async fn wait_disconnected(&mut self) -> anyhow::Result<()> {
        self.wait_for("disconnected", |e| matches!(e, Event::Disconnected))
            .await
            .map(|_| ())
    }

    /// Names of every event received within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<&'static str> {
        let deadline = tokio::time::Instant::now() + window;
        let mut names = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            names.push(event.name());
        }
        names
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }
}

pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<Event>,
    what: &str,
    timeout: Duration,
    mut pred: F,
) -> anyhow::Result<Event>
where
    F: FnMut(&Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => anyhow::bail!("timeout waiting for {what}"),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => anyhow::bail!("event bus closed"),
            Ok(Ok(event)) => event,
        };
        if pred(&event) {
            return Ok(event);
        }
    }
}

/// Start two nodes and connect `b` to `a`.
pub async fn connected_pair(a: TestNodeBuilder, b: TestNodeBuilder) -> anyhow::Result<(TestNode, TestNode)> {
    let mut a = a.start().await?;
    let mut b = b.start().await?;
    b.node.connect(&a.address())?;
    b.wait_connected().await?;
    a.wait_connected().await?;
    Ok((a, b))
}

/// Deterministic, non-repeating-looking file contents.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    hex::encode(sha2::Sha256::digest(data))
}

/// Write one framed payload on a raw socket.
#[allow(dead_code)]
pub async fn write_raw(stream: &mut TcpStream, payload: &[u8]) -> anyhow::Result<()> {
    stream.write_all(&encode_frame(payload)?).await?;
    Ok(())
}

#[allow(dead_code)]
pub async fn write_message(stream: &mut TcpStream, message: &Message) -> anyhow::Result<()> {
    stream.write_all(&message.encode()?).await?;
    Ok(())
}

/// Read one framed transfer message from a raw socket.
#[allow(dead_code)]
pub async fn read_message(stream: &mut TcpStream) -> anyhow::Result<Message> {
    let len = stream.read_u32().await? as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    match Inbound::decode(&payload)? {
        Inbound::Message(frame) => Ok(frame.message),
        Inbound::Text(text) => anyhow::bail!("expected a transfer message, got {text:?}"),
    }
}

/// Poll the ledger until transfer `id` reaches a terminal state.
#[allow(dead_code)]
pub async fn wait_terminal(node: &TestNode, id: &str, timeout: Duration) -> anyhow::Result<Transfer> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(t) = node.node.transfer(id).await {
            if t.state.is_terminal() {
                return Ok(t);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("transfer {id} still running after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
