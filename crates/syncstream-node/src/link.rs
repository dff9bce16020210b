//! Peer link -- the single TCP connection to the other device.
//!
//! The link owns the listener, the active peer socket and three kinds of
//! background task: the accept loop (for as long as we listen), one receive
//! loop per connected period, and the reconnect loop while a dropped
//! connection is being restored. At most one peer socket is active; a
//! second inbound connection is closed as soon as it is accepted.
//!
//! State machine:
//! `Disconnected -> Connecting -> Connected` for dials,
//! `Disconnected -> Connected` for accepted connections, and any state
//! back to `Disconnected` on close, error or explicit disconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use syncstream_protocol::{encode_frame, FrameBuffer, Inbound, Message, ProtocolError, DEFAULT_PORT};
use syncstream_transfer::{Event, EventBus, MessageSink, TransferError};

use crate::reconnect::{self, ReconnectPolicy};
use crate::{join_address, split_address};

/// Bytes requested per socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Transfer messages buffered between the receive loop and the engine.
const INBOUND_QUEUE: usize = 64;

/// Pause after a failed `accept()` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("no peer address known")]
    NoPeerAddress,
    #[error("cannot connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {addr} timed out after {secs}s")]
    DialTimeout { addr: String, secs: u64 },
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("link is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Connected => f.write_str("connected"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_timeout: Duration,
    /// Port dialed when a peer address carries none.
    pub default_peer_port: u16,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            default_peer_port: DEFAULT_PORT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Who we are talking to, as last set by `connect` or an accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub host: Option<String>,
    pub port: u16,
    pub name: String,
    pub local_name: String,
}

impl PeerInfo {
    /// `host:port` to dial, if a host is known.
    pub fn address(&self) -> Option<String> {
        self.host.as_deref().map(|h| join_address(h, self.port))
    }
}

struct Session {
    id: u64,
    cancel: CancellationToken,
}

struct Core {
    state: LinkState,
    peer: PeerInfo,
    session: Option<Session>,
    /// Bumped by every dial and close; a dial only installs its socket if
    /// the epoch it started with is still current.
    dial_epoch: u64,
    reconnect: Option<CancellationToken>,
    reconnect_attempts: u32,
    last_disconnect: Option<DateTime<Utc>>,
    listen_addr: Option<SocketAddr>,
}

struct Writer {
    session: u64,
    half: OwnedWriteHalf,
}

enum Origin {
    Dialed(u64),
    Accepted,
}

struct LinkInner {
    config: LinkConfig,
    core: Mutex<Core>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reconnect_enabled: AtomicBool,
    next_session: AtomicU64,
    shutdown: CancellationToken,
    events: EventBus,
    inbound: mpsc::Sender<Message>,
    /// Count of connections closed so far.
    closes: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    /// Create a link. Transfer messages from the peer are delivered on the
    /// returned receiver in arrival order; control strings go to the bus.
    pub fn new(config: LinkConfig, events: EventBus) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let reconnect_enabled = config.reconnect.enabled;
        let default_port = config.default_peer_port;
        let link = Self {
            inner: Arc::new(LinkInner {
                config,
                core: Mutex::new(Core {
                    state: LinkState::Disconnected,
                    peer: PeerInfo {
                        port: default_port,
                        ..PeerInfo::default()
                    },
                    session: None,
                    dial_epoch: 0,
                    reconnect: None,
                    reconnect_attempts: 0,
                    last_disconnect: None,
                    listen_addr: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                reconnect_enabled: AtomicBool::new(reconnect_enabled),
                next_session: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                events,
                inbound: tx,
                closes: watch::Sender::new(0),
            }),
        };
        (link, rx)
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> LinkState {
        self.core().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn peer(&self) -> PeerInfo {
        self.core().peer.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core().listen_addr
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.core().reconnect_attempts
    }

    pub fn last_disconnect(&self) -> Option<DateTime<Utc>> {
        self.core().last_disconnect
    }

    pub fn reconnecting(&self) -> bool {
        self.core()
            .reconnect
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Ticks once per closed connection. Unlike the event bus this never
    /// drops a close on a slow reader; several closes may coalesce.
    pub fn closes(&self) -> watch::Receiver<u64> {
        self.inner.closes.subscribe()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.inner.reconnect_enabled.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }

    /// Turn auto-reconnect on or off. Turning it off stops a running loop.
    pub fn set_reconnect_enabled(&self, enabled: bool) {
        self.inner.reconnect_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cancel_reconnect();
        }
    }

    pub(crate) fn record_reconnect_attempt(&self, attempt: u32) {
        self.core().reconnect_attempts = attempt;
    }

    // ========================================================================
    // Listening
    // ========================================================================

    /// Bind `0.0.0.0:port` and start the accept loop. Calling it again while
    /// listening returns the existing address. Port 0 picks a free port.
    pub async fn start_listening(&self, port: u16) -> Result<SocketAddr, LinkError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LinkError::ShutDown);
        }
        if let Some(addr) = self.local_addr() {
            tracing::debug!(%addr, "link: already listening");
            return Ok(addr);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| LinkError::Bind { port, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| LinkError::Bind { port, source })?;

        {
            let mut core = self.core();
            if let Some(existing) = core.listen_addr {
                return Ok(existing);
            }
            core.listen_addr = Some(addr);
        }

        tracing::info!(%addr, "link: listening");
        tokio::spawn(accept_loop(self.clone(), listener));
        Ok(addr)
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Dial `address` (`host` or `host:port`) in the background.
    ///
    /// Returns as soon as the dial is started; the outcome arrives as
    /// `Connected` or `ConnectionError` events. A failed dial hands over to
    /// the reconnect loop when reconnection is enabled.
    pub fn connect(&self, address: &str, peer_name: &str, local_name: &str) -> Result<(), LinkError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LinkError::ShutDown);
        }
        if self.is_connected() {
            return Err(LinkError::AlreadyConnected);
        }

        let (host, port) = split_address(address, self.inner.config.default_peer_port);
        {
            let mut core = self.core();
            core.peer = PeerInfo {
                host: Some(host),
                port,
                name: peer_name.to_string(),
                local_name: local_name.to_string(),
            };
        }
        self.cancel_reconnect();

        let epoch = self.begin_dial()?;
        let link = self.clone();
        tokio::spawn(async move {
            if link.dial(epoch).await.is_err() {
                link.start_reconnect();
            }
        });
        Ok(())
    }

    /// Move to Connecting and claim a new dial epoch.
    pub(crate) fn begin_dial(&self) -> Result<u64, LinkError> {
        let (epoch, changed) = {
            let mut core = self.core();
            if core.state == LinkState::Connected {
                return Err(LinkError::AlreadyConnected);
            }
            if core.peer.host.is_none() {
                return Err(LinkError::NoPeerAddress);
            }
            core.dial_epoch += 1;
            let changed = core.state != LinkState::Connecting;
            core.state = LinkState::Connecting;
            (core.dial_epoch, changed)
        };
        if changed {
            self.inner.events.emit(Event::Connecting);
        }
        Ok(epoch)
    }

    /// Dial the current peer. A result for a superseded epoch is discarded
    /// and reported as `Ok`.
    pub(crate) async fn dial(&self, epoch: u64) -> Result<(), LinkError> {
        let peer = self.peer();
        let Some(addr) = peer.address() else {
            return Err(LinkError::NoPeerAddress);
        };
        let host = peer.host.clone().unwrap_or_default();
        let timeout = self.inner.config.connect_timeout;

        tracing::info!(peer = %addr, name = %peer.name, "link: dialing");
        let outcome = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(LinkError::ShutDown),
            r = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => r,
        };

        let err = match outcome {
            Ok(Ok(stream)) => {
                if !self.install(stream, Origin::Dialed(epoch), host).await {
                    tracing::debug!(peer = %addr, "link: dial superseded, dropping socket");
                }
                return Ok(());
            }
            Ok(Err(source)) => LinkError::Dial {
                addr: addr.clone(),
                source,
            },
            Err(_) => LinkError::DialTimeout {
                addr: addr.clone(),
                secs: timeout.as_secs(),
            },
        };

        let current = {
            let mut core = self.core();
            let current = core.dial_epoch == epoch && core.state == LinkState::Connecting;
            if current {
                core.state = LinkState::Disconnected;
            }
            current
        };
        if !current {
            tracing::debug!(peer = %addr, error = %err, "link: stale dial failed");
            return Ok(());
        }

        tracing::warn!(peer = %addr, error = %err, "link: dial failed");
        self.inner.events.emit(Event::Disconnected);
        self.inner.events.emit(Event::ConnectionError {
            message: err.to_string(),
        });
        Err(err)
    }

    /// Make `stream` the active peer socket. Returns false (and drops the
    /// stream) if another socket already holds the role.
    async fn install(&self, stream: TcpStream, origin: Origin, peer_host: String) -> bool {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let mut slot = self.inner.writer.lock().await;
        let (session, cancel) = {
            let mut core = self.core();
            if self.inner.shutdown.is_cancelled() || core.session.is_some() {
                return false;
            }
            match origin {
                Origin::Dialed(epoch) => {
                    if core.dial_epoch != epoch || core.state != LinkState::Connecting {
                        return false;
                    }
                }
                // abandon any dial of ours still in flight
                Origin::Accepted => core.dial_epoch += 1,
            }
            let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
            let cancel = self.inner.shutdown.child_token();
            core.session = Some(Session {
                id,
                cancel: cancel.clone(),
            });
            core.state = LinkState::Connected;
            core.peer.host = Some(peer_host.clone());
            core.reconnect_attempts = 0;
            (id, cancel)
        };
        *slot = Some(Writer {
            session,
            half: writer,
        });
        drop(slot);

        self.cancel_reconnect();
        tracing::info!(peer = %peer_host, session, "link: connected");
        self.inner.events.emit(Event::Connected {
            peer_address: peer_host,
        });
        tokio::spawn(receive_loop(self.clone(), session, reader, cancel));
        true
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Frame and send a raw payload.
    pub async fn send(&self, payload: &[u8]) -> Result<(), LinkError> {
        let framed = encode_frame(payload)?;
        self.write_frame(&framed).await
    }

    /// Send a control string; it surfaces as `DataReceived` on the peer.
    pub async fn send_text(&self, text: &str) -> Result<(), LinkError> {
        self.send(text.as_bytes()).await
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), LinkError> {
        let framed = message.encode()?;
        self.write_frame(&framed).await
    }

    async fn write_frame(&self, framed: &[u8]) -> Result<(), LinkError> {
        let mut slot = self.inner.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        if let Err(e) = writer.half.write_all(framed).await {
            let session = writer.session;
            drop(slot);
            tracing::warn!(session, bytes = framed.len(), error = %e, "link: write failed");
            self.close_session(Some(session), "write failed").await;
            return Err(LinkError::Send(e));
        }
        Ok(())
    }

    // ========================================================================
    // Disconnecting
    // ========================================================================

    /// Close the active socket. Safe to call repeatedly; only the first call
    /// after a connection emits `Disconnected`.
    pub async fn disconnect(&self) {
        self.close_session(None, "local disconnect").await;
    }

    /// Tear down `only` (or whatever is active when `None`). Returns whether
    /// the link actually left a connected or connecting state.
    async fn close_session(&self, only: Option<u64>, reason: &str) -> bool {
        let (closed, session) = {
            let mut core = self.core();
            let current = core.session.as_ref().map(|s| s.id);
            if only.is_some() && only != current {
                // a receive loop or writer from an older session
                return false;
            }
            if let Some(s) = core.session.take() {
                s.cancel.cancel();
            }
            core.dial_epoch += 1;
            let was = core.state;
            core.state = LinkState::Disconnected;
            let closed = was != LinkState::Disconnected;
            if closed {
                core.last_disconnect = Some(Utc::now());
            }
            (closed, current)
        };

        if let Some(id) = session {
            let mut slot = self.inner.writer.lock().await;
            if slot.as_ref().is_some_and(|w| w.session == id) {
                if let Some(mut writer) = slot.take() {
                    let _ = writer.half.shutdown().await;
                }
            }
        }

        if !closed {
            return false;
        }
        tracing::info!(reason, "link: disconnected");
        self.inner.closes.send_modify(|n| *n += 1);
        self.inner.events.emit(Event::Disconnected);
        self.start_reconnect();
        true
    }

    // ========================================================================
    // Reconnecting
    // ========================================================================

    /// Start the reconnect loop if it is enabled, a peer address is known and
    /// no loop is already running. Returns whether a loop was started.
    fn start_reconnect(&self) -> bool {
        if !self.reconnect_enabled() {
            return false;
        }
        let token = {
            let mut core = self.core();
            if core.peer.host.is_none() || core.state == LinkState::Connected {
                return false;
            }
            if core.reconnect.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return false;
            }
            let token = self.inner.shutdown.child_token();
            core.reconnect = Some(token.clone());
            core.reconnect_attempts = 0;
            token
        };
        tokio::spawn(reconnect::run(self.clone(), token));
        true
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = self.core().reconnect.take() {
            token.cancel();
        }
    }

    /// Manually kick off reconnection while disconnected.
    pub fn try_reconnect(&self) -> bool {
        if self.state() != LinkState::Disconnected {
            return false;
        }
        self.start_reconnect()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop everything: reconnection, the active socket and the listener.
    /// The link cannot be used afterwards.
    pub async fn shutdown(&self) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.cancel_reconnect();
        self.close_session(None, "shutdown").await;
        self.core().listen_addr = None;
        tracing::info!("link: shut down");
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    async fn dispatch(&self, payload: &[u8]) {
        match Inbound::decode(payload) {
            Ok(Inbound::Text(text)) => {
                tracing::debug!(len = text.len(), "link: control string received");
                self.inner.events.emit(Event::DataReceived { text });
            }
            Ok(Inbound::Message(frame)) => {
                let kind = frame.message.message_type();
                if self.inner.inbound.send(frame.message).await.is_err() {
                    tracing::warn!(message = %kind, "link: no transfer handler, message dropped");
                }
            }
            Err(e) => {
                tracing::warn!(len = payload.len(), error = %e, "link: dropping malformed frame");
            }
        }
    }
}

impl MessageSink for PeerLink {
    async fn send_message(&self, message: &Message) -> Result<(), TransferError> {
        PeerLink::send_message(self, message)
            .await
            .map_err(|e| TransferError::Send(e.to_string()))
    }
}

async fn accept_loop(link: PeerLink, listener: TcpListener) {
    let shutdown = link.inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("link: listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(peer = %remote, "link: inbound connection");
                    if !link.install(stream, Origin::Accepted, remote.ip().to_string()).await {
                        tracing::info!(peer = %remote, "link: already have a peer, closing inbound connection");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "link: accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}

async fn receive_loop(link: PeerLink, session: u64, mut reader: OwnedReadHalf, cancel: CancellationToken) {
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break "peer closed connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read failed: {e}"),
        };

        frames.feed(&buf[..n]);
        let mut fatal = None;
        for frame in frames.frames() {
            match frame {
                Ok(payload) => link.dispatch(&payload).await,
                Err(e) => fatal = Some(e),
            }
        }
        if let Some(e) = fatal {
            break format!("framing error: {e}");
        }
    };

    tracing::info!(session, %reason, "link: receive loop ended");
    link.close_session(Some(session), &reason).await;
}
