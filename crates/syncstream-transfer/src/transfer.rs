//! The `Transfer` record: one file-copy operation from creation to a
//! terminal state, plus the speed/ETA metrics derived from it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use syncstream_protocol::{FileOffer, TransferId};

use crate::{TransferError, DEFAULT_MAX_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sending,
    Receiving,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Sending => f.write_str("sending"),
            Direction::Receiving => f.write_str("receiving"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Forward-only lifecycle. Terminal states have no successors.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Queued, Transferring)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Transferring, Completed)
                | (Transferring, Failed)
                | (Transferring, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferState::Queued => "queued",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Number of chunks needed to carry `size` bytes.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size.max(1) as u64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub filename: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the source file (sender) or as offered (receiver).
    pub sha256: String,
    pub chunk_size: usize,
    pub chunks_total: u64,
    pub direction: Direction,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub chunks_processed: u64,
    pub sender: String,
    pub receiver: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl Transfer {
    /// Outbound transfer for a local file, in state Queued.
    #[allow(clippy::too_many_arguments)]
    pub fn outgoing(
        id: TransferId,
        local_path: PathBuf,
        filename: String,
        size_bytes: u64,
        sha256: String,
        chunk_size: usize,
        sender: String,
        receiver: String,
    ) -> Self {
        Self {
            id,
            filename,
            local_path,
            size_bytes,
            sha256,
            chunk_size,
            chunks_total: chunk_count(size_bytes, chunk_size),
            direction: Direction::Sending,
            state: TransferState::Queued,
            bytes_transferred: 0,
            chunks_processed: 0,
            sender,
            receiver,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    /// Inbound transfer described by a peer's offer, in state Queued.
    pub fn incoming(offer: &FileOffer, local_path: PathBuf, chunk_size: usize, receiver: String) -> Self {
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| offer.filename.clone());
        Self {
            id: offer.transfer_id.clone(),
            filename,
            local_path,
            size_bytes: offer.file_size,
            sha256: offer.file_hash.clone(),
            chunk_size,
            chunks_total: chunk_count(offer.file_size, chunk_size),
            direction: Direction::Receiving,
            state: TransferState::Queued,
            bytes_transferred: 0,
            chunks_processed: 0,
            sender: offer.sender.clone(),
            receiver,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    /// Name of the other side of this transfer.
    pub fn peer(&self) -> &str {
        match self.direction {
            Direction::Sending => &self.receiver,
            Direction::Receiving => &self.sender,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::InvalidState {
                id: self.id.clone(),
                state: self.state,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Queued -> Transferring, stamping `start_time`.
    pub fn begin(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Transferring)?;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    /// Re-derive `chunks_total` from the block size the sender actually uses.
    ///
    /// Only valid before any chunk has been counted.
    pub fn adopt_chunk_size(&mut self, chunk_size: usize) {
        if self.chunks_processed == 0 && chunk_size > 0 {
            self.chunk_size = chunk_size;
            self.chunks_total = chunk_count(self.size_bytes, chunk_size);
        }
    }

    /// Count one chunk of `len` bytes. Counters never run past the totals.
    pub fn record_chunk(&mut self, len: u64) -> Result<(), TransferError> {
        if self.state != TransferState::Transferring {
            return Err(TransferError::InvalidState {
                id: self.id.clone(),
                state: self.state,
            });
        }
        if self.chunks_processed >= self.chunks_total
            || self.bytes_transferred + len > self.size_bytes
        {
            return Err(TransferError::Protocol(format!(
                "chunk {} ({} bytes) overruns {} bytes in {} chunks",
                self.chunks_processed, len, self.size_bytes, self.chunks_total
            )));
        }
        self.bytes_transferred += len;
        self.chunks_processed += 1;
        Ok(())
    }

    /// Transferring -> Completed. Clears the retry bookkeeping.
    pub fn complete(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Completed)?;
        self.end_time = Some(Utc::now());
        self.retry_count = 0;
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransferError> {
        self.transition(TransferState::Failed)?;
        self.end_time = Some(Utc::now());
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Cancelled)?;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn progress_percent(&self) -> f64 {
        if self.size_bytes == 0 {
            return 100.0;
        }
        self.bytes_transferred as f64 / self.size_bytes as f64 * 100.0
    }

    pub fn elapsed_seconds(&self) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - start).num_microseconds().unwrap_or(0).max(0) as f64 / 1_000_000.0
    }

    pub fn speed_bytes_per_sec(&self) -> f64 {
        let elapsed = self.elapsed_seconds();
        if elapsed <= 0.0 || self.bytes_transferred == 0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / elapsed
    }

    pub fn eta_seconds(&self) -> f64 {
        let speed = self.speed_bytes_per_sec();
        if speed <= 0.0 {
            return 0.0;
        }
        (self.size_bytes - self.bytes_transferred) as f64 / speed
    }
}
