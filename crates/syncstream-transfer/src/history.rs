//! File-history collaborator interface.
//!
//! The engine reports every transfer that reaches Completed or Failed;
//! persisting or displaying the history is the collaborator's business.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::{Direction, Transfer, TransferState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub transfer_id: String,
    pub filename: String,
    pub size: u64,
    pub direction: Direction,
    pub peer: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub state: TransferState,
}

impl HistoryEntry {
    pub fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id.clone(),
            filename: transfer.filename.clone(),
            size: transfer.size_bytes,
            direction: transfer.direction,
            peer: transfer.peer().to_string(),
            sender: transfer.sender.clone(),
            timestamp: transfer.end_time.unwrap_or_else(Utc::now),
            state: transfer.state,
        }
    }
}

pub trait TransferHistory: Send + Sync {
    fn record(&self, entry: HistoryEntry);
}

/// Keeps history in memory, newest last.
#[derive(Clone, Default)]
pub struct MemoryHistory {
    entries: Arc<Mutex<Vec<HistoryEntry>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TransferHistory for MemoryHistory {
    fn record(&self, entry: HistoryEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
