//! Transfer engine -- drives outgoing transfers and applies incoming
//! protocol messages to the ledger and the save directory.
//!
//! Only one transfer moves bytes at a time. Outgoing sends queue on the
//! in-flight permit; an offer that arrives while the permit is taken is
//! rejected. A sender holds its chunks until the peer accepts the offer, so
//! a rejected offer never looks like a delivered file.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};

use syncstream_protocol::{
    FileAccept, FileChunk, FileComplete, FileError, FileOffer, FileReject, Message,
    DEFAULT_CHUNK_SIZE,
};

use crate::events::{Event, EventBus};
use crate::history::{HistoryEntry, TransferHistory};
use crate::ledger::TransferLedger;
use crate::transfer::{Direction, Transfer, TransferState};
use crate::{
    file_checksum, new_transfer_id, MessageSink, Result, TransferError, DEFAULT_ACCEPT_TIMEOUT,
    DEFAULT_MAX_RETRIES,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub max_retries: u32,
    /// Directory received files are written to.
    pub save_dir: PathBuf,
    /// Our display name, recorded as the receiver of inbound transfers.
    pub local_name: String,
    pub accept_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            save_dir: PathBuf::from("downloads"),
            local_name: "syncstream".into(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        }
    }
}

/// An inbound file being written.
struct Receiving {
    file: File,
    _permit: OwnedSemaphorePermit,
}

enum Streamed {
    Completed,
    /// Someone else moved the transfer out of Transferring mid-stream.
    Stopped(TransferState),
}

pub struct TransferEngine {
    config: EngineConfig,
    ledger: TransferLedger,
    events: EventBus,
    history: Option<Arc<dyn TransferHistory>>,
    in_flight: Arc<Semaphore>,
    receiving: Mutex<HashMap<String, Receiving>>,
    /// Offers sent and not yet answered. Dropping an entry withdraws it.
    awaiting_accept: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl TransferEngine {
    pub fn new(config: EngineConfig, events: EventBus) -> Self {
        Self {
            config,
            ledger: TransferLedger::new(),
            events,
            history: None,
            in_flight: Arc::new(Semaphore::new(1)),
            receiving: Mutex::new(HashMap::new()),
            awaiting_accept: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn TransferHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Register a local file for sending. The file is hashed once, in
    /// `chunk_size` reads, and the new transfer is queued.
    pub async fn create_transfer(&self, path: &Path, sender: &str, receiver: &str) -> Result<Transfer> {
        let transfer = self.prepare_outgoing(path, sender, receiver).await?;
        self.ledger.insert(transfer.clone()).await;
        tracing::info!(
            transfer_id = %transfer.id,
            filename = %transfer.filename,
            size = transfer.size_bytes,
            chunks = transfer.chunks_total,
            "transfer: queued"
        );
        Ok(transfer)
    }

    async fn prepare_outgoing(&self, path: &Path, sender: &str, receiver: &str) -> Result<Transfer> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(TransferError::FileNotFound(path.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::InvalidFilename(path.display().to_string()))?;
        let sha256 = file_checksum(path, self.config.chunk_size).await?;

        let mut transfer = Transfer::outgoing(
            new_transfer_id(path, meta.len()),
            path.to_path_buf(),
            filename,
            meta.len(),
            sha256,
            self.config.chunk_size,
            sender.to_string(),
            receiver.to_string(),
        );
        transfer.max_retries = self.config.max_retries;
        Ok(transfer)
    }

    /// Stream a queued transfer to the peer: offer, chunks in order, complete.
    ///
    /// Waits for the in-flight slot first, then for the peer to accept the
    /// offer. A failure marks the transfer
    /// Failed and bumps its retry count; nothing is resent automatically.
    pub async fn send_transfer<S: MessageSink>(&self, id: &str, sink: &S) -> Result<()> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| TransferError::Closed)?;

        let transfer = self
            .ledger
            .get(id)
            .await
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if transfer.direction != Direction::Sending || transfer.state != TransferState::Queued {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                state: transfer.state,
            });
        }

        match self.stream(&transfer, sink).await {
            Ok(Streamed::Completed) => Ok(()),
            Ok(Streamed::Stopped(state)) => {
                tracing::info!(transfer_id = id, %state, "transfer: stopped before completion");
                Ok(())
            }
            Err(e) => {
                if self.mark_failed(id, e.to_string()).await.is_some() {
                    Err(e)
                } else {
                    // already terminal, e.g. cancelled between two chunks
                    Ok(())
                }
            }
        }
    }

    async fn stream<S: MessageSink>(&self, transfer: &Transfer, sink: &S) -> Result<Streamed> {
        let id = transfer.id.as_str();
        let file = File::open(&transfer.local_path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TransferError::FileNotFound(transfer.local_path.clone())
            } else {
                e.into()
            }
        })?;

        // registered first: the answer can beat send_message back
        let (accepted_tx, accepted) = oneshot::channel();
        self.awaiting_accept
            .lock()
            .await
            .insert(id.to_string(), accepted_tx);

        let offered = sink
            .send_message(&Message::Offer(FileOffer {
                transfer_id: transfer.id.clone(),
                filename: transfer.filename.clone(),
                file_size: transfer.size_bytes,
                file_hash: transfer.sha256.clone(),
                sender: transfer.sender.clone(),
            }))
            .await;
        if let Err(e) = offered {
            self.awaiting_accept.lock().await.remove(id);
            return Err(e);
        }

        let started = match self.apply(id, |t| t.begin()).await {
            Ok(started) => started,
            Err(e) => {
                self.awaiting_accept.lock().await.remove(id);
                return Err(e);
            }
        };
        tracing::info!(
            transfer_id = id,
            filename = %transfer.filename,
            size = transfer.size_bytes,
            peer = %transfer.receiver,
            "transfer: offered"
        );
        self.events.emit(Event::TransferStart(started));

        let timeout = self.config.accept_timeout;
        match tokio::time::timeout(timeout, accepted).await {
            Ok(Ok(())) => {
                tracing::info!(transfer_id = id, "transfer: sending");
            }
            // rejected, cancelled or cut off while we waited
            Ok(Err(_)) => {
                return match self.stopped(id).await {
                    Some(state) => Ok(Streamed::Stopped(state)),
                    None => Err(TransferError::Closed),
                };
            }
            Err(_) => {
                self.awaiting_accept.lock().await.remove(id);
                let err = TransferError::AcceptTimeout {
                    secs: timeout.as_secs(),
                };
                // the peer may still accept later; tell it not to wait for data
                let _ = sink
                    .send_message(&Message::Error(FileError {
                        transfer_id: transfer.id.clone(),
                        error: err.to_string(),
                    }))
                    .await;
                return Err(err);
            }
        }

        // never read past the size we hashed and offered
        let mut reader = file.take(transfer.size_bytes);
        let mut buf = vec![0u8; transfer.chunk_size];
        let mut chunk_num = 0u64;
        let mut offset = 0u64;

        loop {
            let n = read_block(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(state) = self.stopped(id).await {
                return Ok(Streamed::Stopped(state));
            }

            let chunk = Message::Chunk(FileChunk {
                transfer_id: transfer.id.clone(),
                chunk_num,
                chunk_data: buf[..n].to_vec(),
            });
            if let Err(e) = sink.send_message(&chunk).await {
                tracing::warn!(
                    transfer_id = id,
                    chunk = chunk_num,
                    offset,
                    error = %e,
                    "transfer: chunk send failed"
                );
                return Err(e);
            }

            let progress = self.apply(id, |t| t.record_chunk(n as u64)).await?;
            self.events.emit(Event::TransferProgress(progress));
            offset += n as u64;
            chunk_num += 1;
        }

        if offset != transfer.size_bytes {
            return Err(TransferError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "source file shrank during transfer: read {offset} of {} bytes",
                    transfer.size_bytes
                ),
            )));
        }
        if let Some(state) = self.stopped(id).await {
            return Ok(Streamed::Stopped(state));
        }

        sink.send_message(&Message::Complete(FileComplete {
            transfer_id: transfer.id.clone(),
            file_hash: transfer.sha256.clone(),
        }))
        .await?;

        let done = self.apply(id, |t| t.complete()).await?;
        tracing::info!(
            transfer_id = id,
            size = done.size_bytes,
            secs = done.elapsed_seconds(),
            "transfer: sent"
        );
        self.record_history(&done);
        self.events.emit(Event::TransferComplete(done));
        Ok(Streamed::Completed)
    }

    /// Queue a fresh attempt for a failed outgoing transfer.
    ///
    /// The new transfer carries the old retry count; once that reaches
    /// `max_retries` further retries are refused.
    pub async fn retry_transfer(&self, id: &str) -> Result<Transfer> {
        let failed = self
            .ledger
            .get(id)
            .await
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if failed.direction != Direction::Sending || failed.state != TransferState::Failed {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                state: failed.state,
            });
        }
        if failed.retry_count >= failed.max_retries {
            return Err(TransferError::RetriesExhausted {
                id: id.to_string(),
                attempts: failed.retry_count,
                max: failed.max_retries,
            });
        }

        let mut fresh = self
            .prepare_outgoing(&failed.local_path, &failed.sender, &failed.receiver)
            .await?;
        fresh.retry_count = failed.retry_count;
        fresh.max_retries = failed.max_retries;
        self.ledger.insert(fresh.clone()).await;
        tracing::info!(
            transfer_id = %fresh.id,
            previous = id,
            retry_count = fresh.retry_count,
            "transfer: retry queued"
        );
        Ok(fresh)
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Apply one message from the peer.
    ///
    /// Returns the reply to send back, if any. An `Err` means the message
    /// referenced nothing we can act on and was dropped.
    pub async fn handle_message(&self, message: Message) -> Result<Option<Message>> {
        match message {
            Message::Offer(offer) => self.on_offer(offer).await,
            Message::Accept(accept) => self.on_accept(accept).await,
            Message::Reject(reject) => self.on_reject(reject).await,
            Message::Chunk(chunk) => self.on_chunk(chunk).await,
            Message::Complete(complete) => self.on_complete(complete).await,
            Message::Error(error) => self.on_error(error).await,
        }
    }

    async fn on_offer(&self, offer: FileOffer) -> Result<Option<Message>> {
        let id = offer.transfer_id.clone();
        let reject = |reason: String| {
            tracing::warn!(transfer_id = %id, filename = %offer.filename, %reason, "transfer: offer rejected");
            Ok(Some(Message::Reject(FileReject {
                transfer_id: id.clone(),
                reason,
            })))
        };

        if self.ledger.contains(&id).await {
            return reject("duplicate transfer id".into());
        }
        let filename = match sanitize_filename(&offer.filename) {
            Ok(name) => name,
            Err(e) => return reject(e.to_string()),
        };
        let permit = match self.in_flight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return reject("another transfer is in progress".into()),
        };
        let (local_path, file) = match reserve_path(&self.config.save_dir, &filename).await {
            Ok(reserved) => reserved,
            Err(e) => return reject(format!("cannot create file: {e}")),
        };

        let mut transfer = Transfer::incoming(
            &offer,
            local_path,
            self.config.chunk_size,
            self.config.local_name.clone(),
        );
        transfer.max_retries = self.config.max_retries;
        transfer.begin()?;

        self.ledger.insert(transfer.clone()).await;
        self.receiving.lock().await.insert(
            id.clone(),
            Receiving {
                file,
                _permit: permit,
            },
        );

        tracing::info!(
            transfer_id = %id,
            filename = %transfer.filename,
            size = transfer.size_bytes,
            peer = %offer.sender,
            path = %transfer.local_path.display(),
            "transfer: receiving"
        );
        self.events.emit(Event::FileOffer(transfer.clone()));
        self.events.emit(Event::TransferStart(transfer));

        Ok(Some(Message::Accept(FileAccept { transfer_id: id })))
    }

    async fn on_chunk(&self, chunk: FileChunk) -> Result<Option<Message>> {
        let id = chunk.transfer_id.clone();
        let Some(transfer) = self.incoming(&id).await? else {
            return Ok(None);
        };
        let len = chunk.chunk_data.len() as u64;

        if chunk.chunk_num != transfer.chunks_processed {
            let reason = format!(
                "out-of-order chunk: expected {}, got {}",
                transfer.chunks_processed, chunk.chunk_num
            );
            return Ok(self.fail_incoming(&id, reason).await);
        }
        if transfer.bytes_transferred + len > transfer.size_bytes {
            let reason = format!(
                "chunk {} overruns offered size {} at offset {}",
                chunk.chunk_num, transfer.size_bytes, transfer.bytes_transferred
            );
            return Ok(self.fail_incoming(&id, reason).await);
        }
        if chunk.chunk_num == 0 {
            let block = chunk.chunk_data.len();
            self.ledger.update(&id, |t| t.adopt_chunk_size(block)).await;
        }

        let written = {
            let mut receiving = self.receiving.lock().await;
            match receiving.get_mut(&id) {
                Some(r) => r.file.write_all(&chunk.chunk_data).await,
                None => Err(std::io::Error::new(ErrorKind::NotFound, "no open file")),
            }
        };
        if let Err(e) = written {
            let reason = format!("write failed at offset {}: {e}", transfer.bytes_transferred);
            return Ok(self.fail_incoming(&id, reason).await);
        }

        match self.apply(&id, |t| t.record_chunk(len)).await {
            Ok(progress) => {
                tracing::debug!(
                    transfer_id = %id,
                    chunk = chunk.chunk_num,
                    offset = progress.bytes_transferred,
                    "transfer: chunk written"
                );
                self.events.emit(Event::TransferProgress(progress));
                Ok(None)
            }
            Err(e) => Ok(self.fail_incoming(&id, e.to_string()).await),
        }
    }

    async fn on_complete(&self, complete: FileComplete) -> Result<Option<Message>> {
        let id = complete.transfer_id.clone();
        let Some(transfer) = self.incoming(&id).await? else {
            return Ok(None);
        };

        // Close the file before hashing; the permit is held until we return.
        let open = self.receiving.lock().await.remove(&id);
        let _permit = match open {
            Some(Receiving { mut file, _permit }) => {
                if let Err(e) = file.flush().await {
                    return Ok(self.fail_incoming(&id, format!("flush failed: {e}")).await);
                }
                Some(_permit)
            }
            None => None,
        };

        if complete.file_hash != transfer.sha256 {
            tracing::warn!(
                transfer_id = %id,
                offered = %transfer.sha256,
                completed = %complete.file_hash,
                "transfer: complete hash differs from offer, verifying against offer"
            );
        }

        let actual = match file_checksum(&transfer.local_path, transfer.chunk_size).await {
            Ok(hash) => hash,
            Err(e) => {
                return Ok(self
                    .fail_incoming(&id, format!("cannot hash received file: {e}"))
                    .await)
            }
        };
        if actual != transfer.sha256 {
            let mismatch = TransferError::HashMismatch {
                expected: transfer.sha256.clone(),
                actual,
            };
            tracing::warn!(
                transfer_id = %id,
                path = %transfer.local_path.display(),
                bytes = transfer.bytes_transferred,
                error = %mismatch,
                "transfer: integrity check failed, file kept"
            );
            self.mark_failed(&id, "hash mismatch").await;
            return Ok(None);
        }

        let done = self.apply(&id, |t| t.complete()).await?;
        tracing::info!(
            transfer_id = %id,
            path = %done.local_path.display(),
            size = done.size_bytes,
            secs = done.elapsed_seconds(),
            "transfer: received"
        );
        self.record_history(&done);
        self.events.emit(Event::TransferComplete(done));
        Ok(None)
    }

    async fn on_accept(&self, accept: FileAccept) -> Result<Option<Message>> {
        if !self.ledger.contains(&accept.transfer_id).await {
            return Err(TransferError::NotFound(accept.transfer_id));
        }
        let waiting = self.awaiting_accept.lock().await.remove(&accept.transfer_id);
        match waiting {
            Some(tx) => {
                tracing::debug!(transfer_id = %accept.transfer_id, "transfer: accepted by peer");
                let _ = tx.send(());
            }
            None => {
                tracing::debug!(transfer_id = %accept.transfer_id, "transfer: late accept ignored");
            }
        }
        Ok(None)
    }

    async fn on_reject(&self, reject: FileReject) -> Result<Option<Message>> {
        let transfer = self
            .ledger
            .get(&reject.transfer_id)
            .await
            .ok_or_else(|| TransferError::NotFound(reject.transfer_id.clone()))?;
        if transfer.direction != Direction::Sending {
            return Err(TransferError::Protocol(format!(
                "reject for inbound transfer {}",
                reject.transfer_id
            )));
        }
        let reason = if reject.reason.is_empty() {
            "rejected by peer".to_string()
        } else {
            format!("rejected by peer: {}", reject.reason)
        };
        self.mark_failed(&reject.transfer_id, reason).await;
        Ok(None)
    }

    async fn on_error(&self, error: FileError) -> Result<Option<Message>> {
        if !self.ledger.contains(&error.transfer_id).await {
            return Err(TransferError::NotFound(error.transfer_id));
        }
        self.mark_failed(&error.transfer_id, error.error).await;
        Ok(None)
    }

    /// Look up an inbound transfer that should still be accepting data.
    /// `Ok(None)` means it was cancelled locally and the message is ignored.
    async fn incoming(&self, id: &str) -> Result<Option<Transfer>> {
        let transfer = self
            .ledger
            .get(id)
            .await
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if transfer.direction != Direction::Receiving {
            return Err(TransferError::Protocol(format!(
                "data message for outgoing transfer {id}"
            )));
        }
        match transfer.state {
            TransferState::Transferring => Ok(Some(transfer)),
            TransferState::Cancelled => {
                tracing::debug!(transfer_id = id, "transfer: ignoring data for cancelled transfer");
                Ok(None)
            }
            state => Err(TransferError::InvalidState {
                id: id.to_string(),
                state,
            }),
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Cancel a queued or in-progress transfer. The peer is not notified.
    pub async fn cancel(&self, id: &str) -> Result<Transfer> {
        let cancelled = self.apply(id, |t| t.cancel()).await?;
        self.receiving.lock().await.remove(id);
        self.awaiting_accept.lock().await.remove(id);
        tracing::info!(
            transfer_id = id,
            offset = cancelled.bytes_transferred,
            "transfer: cancelled"
        );
        Ok(cancelled)
    }

    /// Fail every transfer still moving bytes, in either direction. Used when
    /// the link drops; an outgoing stream notices before its next chunk.
    pub async fn abort_in_flight(&self, reason: &str) -> usize {
        let mut aborted = 0;
        for direction in [Direction::Receiving, Direction::Sending] {
            for id in self.ledger.in_flight(direction).await {
                if self.mark_failed(&id, reason).await.is_some() {
                    aborted += 1;
                }
            }
        }
        aborted
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn apply(
        &self,
        id: &str,
        f: impl FnOnce(&mut Transfer) -> Result<()>,
    ) -> Result<Transfer> {
        self.ledger
            .update(id, |t: &mut Transfer| -> Result<Transfer> {
                f(t)?;
                Ok(t.clone())
            })
            .await
            .unwrap_or_else(|| Err(TransferError::NotFound(id.to_string())))
    }

    async fn stopped(&self, id: &str) -> Option<TransferState> {
        match self.ledger.get(id).await {
            Some(t) if t.state == TransferState::Transferring => None,
            Some(t) => Some(t.state),
            None => Some(TransferState::Cancelled),
        }
    }

    /// Move a transfer to Failed and report it. Returns the failed snapshot,
    /// or `None` if it had already reached a terminal state.
    async fn mark_failed(&self, id: &str, reason: impl Into<String>) -> Option<Transfer> {
        let reason = reason.into();
        self.receiving.lock().await.remove(id);

        let failed = self
            .ledger
            .update(id, |t| {
                t.fail(reason.clone()).ok()?;
                if t.direction == Direction::Sending {
                    t.retry_count += 1;
                }
                Some(t.clone())
            })
            .await
            .flatten();
        // after the ledger update, so a woken sender sees the final state
        self.awaiting_accept.lock().await.remove(id);
        let failed = failed?;

        tracing::warn!(
            transfer_id = id,
            direction = %failed.direction,
            peer = %failed.peer(),
            offset = failed.bytes_transferred,
            retry_count = failed.retry_count,
            error = %reason,
            "transfer: failed"
        );
        self.record_history(&failed);
        self.events.emit(Event::TransferError {
            transfer: failed.clone(),
            message: reason,
        });
        Some(failed)
    }

    async fn fail_incoming(&self, id: &str, reason: String) -> Option<Message> {
        self.mark_failed(id, reason.clone()).await?;
        Some(Message::Error(FileError {
            transfer_id: id.to_string(),
            error: reason,
        }))
    }

    fn record_history(&self, transfer: &Transfer) {
        if let Some(history) = &self.history {
            history.record(HistoryEntry::from_transfer(transfer));
        }
    }
}

/// Fill `buf` completely unless the reader hits EOF first.
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Reduce an offered filename to a single safe path component.
pub fn sanitize_filename(offered: &str) -> Result<String> {
    let name = offered
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("");
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err(TransferError::InvalidFilename(offered.to_string()));
    }
    Ok(name.to_string())
}

/// `name.ext`, then `name_1.ext`, `name_2.ext`, ... for the n-th collision.
fn candidate_name(filename: &str, n: u32) -> String {
    if n == 0 {
        return filename.to_string();
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    }
}

/// Create a new empty file for `filename` in `dir`, skipping names already taken.
async fn reserve_path(dir: &Path, filename: &str) -> std::io::Result<(PathBuf, File)> {
    tokio::fs::create_dir_all(dir).await?;
    let mut n = 0u32;
    loop {
        let candidate = dir.join(candidate_name(filename, n));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}
