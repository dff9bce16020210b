//! SyncNode -- wires the peer link to the transfer engine.
//!
//! The node owns two background tasks besides the link's own: the inbound
//! router, which feeds transfer messages to the engine one at a time and
//! sends back its replies, and the link watcher, which fails transfers
//! left dangling when the peer disappears.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use syncstream_protocol::Message;
use syncstream_transfer::{
    Event, EventBus, Transfer, TransferEngine, TransferError, TransferHistory,
};

use crate::config::NodeConfig;
use crate::link::{LinkError, LinkState, PeerLink};

/// Reason recorded on transfers cut off by a disconnect.
pub const PEER_DISCONNECTED: &str = "peer disconnected";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("no peer configured")]
    NoPeer,
}

pub struct SyncNode {
    config: NodeConfig,
    events: EventBus,
    link: PeerLink,
    engine: Arc<TransferEngine>,
    listen_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncNode {
    /// Start listening and, if `network.peer` is set, dial it.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let events = EventBus::default();
        let engine = TransferEngine::new(config.engine_config(), events.clone());
        Self::launch(config, events, engine).await
    }

    /// Like [`SyncNode::start`], recording finished transfers in `history`.
    pub async fn start_with_history(
        config: NodeConfig,
        history: Arc<dyn TransferHistory>,
    ) -> Result<Self, NodeError> {
        let events = EventBus::default();
        let engine =
            TransferEngine::new(config.engine_config(), events.clone()).with_history(history);
        Self::launch(config, events, engine).await
    }

    async fn launch(
        config: NodeConfig,
        events: EventBus,
        engine: TransferEngine,
    ) -> Result<Self, NodeError> {
        let engine = Arc::new(engine);
        let (link, inbound) = PeerLink::new(config.link_config(), events.clone());

        let listen_addr = link.start_listening(config.network.listen_port).await?;
        tracing::info!(
            name = %config.node.name,
            %listen_addr,
            save_dir = %engine.config().save_dir.display(),
            chunk_size = engine.config().chunk_size,
            "node: started"
        );

        // subscribe before anything can connect so no close is missed
        let watcher = watch_link(engine.clone(), link.closes());
        let router = route_inbound(engine.clone(), link.clone(), inbound);

        let node = Self {
            config,
            events,
            link,
            engine,
            listen_addr,
            tasks: Mutex::new(vec![watcher, router]),
        };

        if let Some(peer) = node.config.network.peer.clone() {
            node.connect(&peer)?;
        }
        Ok(node)
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Dial a peer by profile name or address.
    pub fn connect(&self, peer: &str) -> Result<(), NodeError> {
        let (name, addr) = self.config.resolve_peer(peer);
        tracing::info!(peer = %name, %addr, "node: connecting");
        self.link.connect(&addr, &name, &self.config.node.name)?;
        Ok(())
    }

    /// Dial the peer named in the config.
    pub fn connect_configured(&self) -> Result<(), NodeError> {
        let peer = self.config.network.peer.clone().ok_or(NodeError::NoPeer)?;
        self.connect(&peer)
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await;
    }

    pub fn try_reconnect(&self) -> bool {
        self.link.try_reconnect()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.link.set_reconnect_enabled(enabled);
    }

    /// Send a control string to the peer.
    pub async fn send_text(&self, text: &str) -> Result<(), NodeError> {
        self.link.send_text(text).await?;
        Ok(())
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Queue `path` for sending and start streaming it in the background.
    ///
    /// Returns the queued transfer; progress and the outcome arrive as
    /// transfer events. Only one transfer streams at a time.
    pub async fn send_file(&self, path: &Path) -> Result<Transfer, NodeError> {
        if !self.link.is_connected() {
            return Err(LinkError::NotConnected.into());
        }
        let transfer = self
            .engine
            .create_transfer(path, &self.config.node.name, &self.peer_name())
            .await?;
        self.spawn_send(&transfer.id);
        Ok(transfer)
    }

    /// Queue a new attempt for a failed outgoing transfer and start it.
    pub async fn retry(&self, id: &str) -> Result<Transfer, NodeError> {
        if !self.link.is_connected() {
            return Err(LinkError::NotConnected.into());
        }
        let transfer = self.engine.retry_transfer(id).await?;
        self.spawn_send(&transfer.id);
        Ok(transfer)
    }

    pub async fn cancel(&self, id: &str) -> Result<Transfer, NodeError> {
        Ok(self.engine.cancel(id).await?)
    }

    fn spawn_send(&self, id: &str) {
        let engine = self.engine.clone();
        let link = self.link.clone();
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.send_transfer(&id, &link).await {
                tracing::warn!(transfer_id = %id, error = %e, "node: send failed");
            }
        });
        self.tasks_guard().push(handle);
    }

    fn peer_name(&self) -> String {
        let peer = self.link.peer();
        if !peer.name.is_empty() {
            peer.name
        } else {
            peer.host.unwrap_or_default()
        }
    }

    pub async fn transfer(&self, id: &str) -> Option<Transfer> {
        self.engine.ledger().get(id).await
    }

    /// Every transfer, oldest first.
    pub async fn transfers(&self) -> Vec<Transfer> {
        self.engine.ledger().all().await
    }

    pub async fn active_transfers(&self) -> Vec<Transfer> {
        self.engine.ledger().active().await
    }

    pub async fn queued_transfers(&self) -> Vec<Transfer> {
        self.engine.ledger().queued().await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    fn tasks_guard(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks
    }

    /// Close the link and stop every task the node started.
    pub async fn shutdown(&self) {
        self.link.shutdown().await;
        let tasks: Vec<_> = self.tasks_guard().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!(name = %self.config.node.name, "node: stopped");
    }
}

/// Feed inbound transfer messages to the engine in arrival order and send
/// its replies back over the link.
fn route_inbound(
    engine: Arc<TransferEngine>,
    link: PeerLink,
    mut inbound: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let kind = message.message_type();
            let id = message.transfer_id().to_string();
            match engine.handle_message(message).await {
                Ok(Some(reply)) => {
                    if let Err(e) = link.send_message(&reply).await {
                        tracing::warn!(
                            transfer_id = %id,
                            reply = %reply.message_type(),
                            error = %e,
                            "node: reply not sent"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(transfer_id = %id, message = %kind, error = %e, "node: message dropped");
                }
            }
        }
        tracing::debug!("node: inbound router stopped");
    })
}

/// Fail in-flight transfers whenever the link goes down.
fn watch_link(engine: Arc<TransferEngine>, mut closes: watch::Receiver<u64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while closes.changed().await.is_ok() {
            let closed = *closes.borrow_and_update();
            let aborted = engine.abort_in_flight(PEER_DISCONNECTED).await;
            if aborted > 0 {
                tracing::warn!(aborted, closed, "node: transfers cut off by disconnect");
            }
        }
    })
}
