//! SyncStream Transfer -- chunked file transfer over a single peer link.
//!
//! The engine streams a file as `file_offer`, one `file_chunk` per block and
//! a closing `file_complete`, and on the receiving side rebuilds the file in
//! the save directory and checks its SHA-256 against the offer. Progress and
//! outcomes are published on the [`events::EventBus`].

pub mod engine;
pub mod events;
pub mod history;
pub mod ledger;
pub mod transfer;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use syncstream_protocol::Message;

pub use engine::{EngineConfig, TransferEngine};
pub use events::{Event, EventBus};
pub use history::{HistoryEntry, MemoryHistory, TransferHistory};
pub use ledger::TransferLedger;
pub use transfer::{Direction, Transfer, TransferState};

/// Default number of attempts allowed for one logical transfer.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long a sender waits for `file_accept` or `file_reject` after its offer.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("unknown transfer: {0}")]
    NotFound(String),
    #[error("transfer {id} is {state}")]
    InvalidState { id: String, state: TransferState },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("transfer {id} already failed {attempts} times (max {max})")]
    RetriesExhausted { id: String, attempts: u32, max: u32 },
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("peer did not answer the offer within {secs}s")]
    AcceptTimeout { secs: u64 },
    #[error("engine closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Outbound half of the peer link, as seen by the engine.
///
/// Implemented by the connection layer; the engine never touches the socket.
pub trait MessageSink: Send + Sync {
    fn send_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send;
}

/// Compute SHA-256 hex digest of data.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stream a file through SHA-256 in `block_size` reads.
pub async fn file_checksum(path: &Path, block_size: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derive a fresh transfer id from the source path, size and current time.
pub fn new_transfer_id(path: &Path, size: u64) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seed = format!("{}:{}:{}:{}", path.display(), size, nanos, seq);
    let mut id = checksum(seed.as_bytes());
    id.truncate(32);
    id
}
