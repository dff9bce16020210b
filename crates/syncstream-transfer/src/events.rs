//! Event bus shared by the peer link and the transfer engine.
//!
//! Every notification for the application layer is one [`Event`] on a
//! broadcast channel. Consumers either `subscribe()` directly or hand a
//! closure to [`EventBus::spawn_handler`], which drains events on a single
//! task so a handler that triggers another transition never re-enters the
//! code that emitted the event.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::transfer::Transfer;

/// Default channel depth. Slow subscribers past this lag and skip events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    /// A dial has started.
    Connecting,
    /// A peer socket became active (dialed or accepted).
    Connected { peer_address: String },
    Disconnected,
    ConnectionError { message: String },
    /// The reconnect loop is about to dial.
    Reconnecting { attempt: u32 },
    /// A control string arrived from the peer.
    DataReceived { text: String },
    TransferStart(Transfer),
    TransferProgress(Transfer),
    TransferComplete(Transfer),
    TransferError { transfer: Transfer, message: String },
    /// An offer was received; fired before the accept reply is sent.
    FileOffer(Transfer),
}

impl Event {
    /// Callback-style name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connecting => "on_connecting",
            Event::Connected { .. } => "on_connected",
            Event::Disconnected => "on_disconnected",
            Event::ConnectionError { .. } => "on_connection_error",
            Event::Reconnecting { .. } => "on_reconnecting",
            Event::DataReceived { .. } => "on_data_received",
            Event::TransferStart(_) => "on_transfer_start",
            Event::TransferProgress(_) => "on_transfer_progress",
            Event::TransferComplete(_) => "on_transfer_complete",
            Event::TransferError { .. } => "on_transfer_error",
            Event::FileOffer(_) => "on_file_offer",
        }
    }

    /// The transfer this event is about, if any.
    pub fn transfer(&self) -> Option<&Transfer> {
        match self {
            Event::TransferStart(t)
            | Event::TransferProgress(t)
            | Event::TransferComplete(t)
            | Event::FileOffer(t) => Some(t),
            Event::TransferError { transfer, .. } => Some(transfer),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: Event) {
        tracing::trace!(event = event.name(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Run `handler` for every event, in order, on one dedicated task.
    ///
    /// The subscription is taken before this returns, so no event emitted
    /// afterwards is missed. The task ends when every bus handle is dropped
    /// or the returned handle is aborted.
    pub fn spawn_handler<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event handler lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
