//! Transfer ledger: shared registry of every transfer this process has seen.
//!
//! The lock guards map access only; callers get cloned snapshots, so UI
//! readers never hold the lock while the engine mutates a record.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::transfer::{Direction, Transfer, TransferState};

#[derive(Clone, Default)]
pub struct TransferLedger {
    inner: Arc<RwLock<HashMap<String, Transfer>>>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, transfer: Transfer) {
        tracing::debug!(
            transfer_id = %transfer.id,
            filename = %transfer.filename,
            direction = %transfer.direction,
            "ledger: transfer added"
        );
        self.inner.write().await.insert(transfer.id.clone(), transfer);
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<Transfer> {
        self.inner.read().await.get(id).cloned()
    }

    /// Mutate one record in place. Returns `None` if the id is unknown.
    pub async fn update<R>(&self, id: &str, f: impl FnOnce(&mut Transfer) -> R) -> Option<R> {
        let mut map = self.inner.write().await;
        map.get_mut(id).map(f)
    }

    /// Every transfer, oldest first.
    pub async fn all(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self.inner.read().await.values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    async fn filter(&self, state: TransferState) -> Vec<Transfer> {
        let mut out: Vec<Transfer> = self
            .inner
            .read()
            .await
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Transfers currently moving bytes.
    pub async fn active(&self) -> Vec<Transfer> {
        self.filter(TransferState::Transferring).await
    }

    pub async fn queued(&self) -> Vec<Transfer> {
        self.filter(TransferState::Queued).await
    }

    /// Ids of transfers in `direction` still moving bytes.
    pub async fn in_flight(&self, direction: Direction) -> Vec<String> {
        self.inner
            .read()
            .await
            .values()
            .filter(|t| t.direction == direction && t.state == TransferState::Transferring)
            .map(|t| t.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
