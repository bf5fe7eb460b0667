//! Transfer engine — owns the queues, the long-running tasks and every
//! transfer, and exposes the send and receive operations.
//!
//! ```text
//! send ─► part queue ─► BatchBuilder ─► batch queue ─► SendWorker × N ─► Transport
//!             ▲                                              │
//!             └──────────── lost rounds / recovery ◄─────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashSet;
use mixdrop_core::config::{MixdropConfig, StorageConfig};
use mixdrop_core::wire::{self, TransferAnnouncement};
use mixdrop_core::{
    PartCrypto, PeerId, TransferId, TransferKey, TransferMac, FILE_MAX_SIZE, FILE_NAME_MAX_LEN,
    FILE_TYPE_MAX_LEN, PREVIEW_MAX_SIZE,
};
use mixdrop_store::{
    num_fingerprints, partition_file, FileKv, Kv, Part, ReceivedProgress, ReceivedTransfers,
    SentProgress, SentTransfers, StoreError,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchBuilder;
use crate::callbacks::{CallbackTracker, ProgressThunk};
use crate::context::EngineContext;
use crate::error::{EngineError, TransferError};
use crate::rate_limit::RateLimiter;
use crate::receive::{register_processors, unregister_processors};
use crate::recovery::recovery_loop;
use crate::round_tracker::SentRoundTracker;
use crate::send_worker::SendWorker;
use crate::transport::{Announcer, Transport};

/// Progress of an outgoing transfer, with the error that ended it if any.
pub type SentProgressCallback = Arc<dyn Fn(&SentProgress, Option<&TransferError>) + Send + Sync>;

/// Progress of an incoming transfer.
pub type ReceivedProgressCallback =
    Arc<dyn Fn(&ReceivedProgress, Option<&TransferError>) + Send + Sync>;

/// External collaborators of the engine.
pub struct EngineDeps {
    pub transport: Arc<dyn Transport>,
    pub crypto: Arc<dyn PartCrypto>,
    pub announcer: Arc<dyn Announcer>,
    pub kv: Kv,
}

impl EngineDeps {
    /// Collaborators persisting to the on-disk store at `storage.path`.
    pub fn open(
        storage: &StorageConfig,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn PartCrypto>,
        announcer: Arc<dyn Announcer>,
    ) -> Result<Self, EngineError> {
        let store = FileKv::new(storage.path.clone()).map_err(StoreError::from)?;
        tracing::debug!(path = %storage.path.display(), "opened transfer store");
        Ok(Self {
            transport,
            crypto,
            announcer,
            kv: Kv::new(Arc::new(store)),
        })
    }
}

/// A file to send.
#[derive(Debug, Clone, Default)]
pub struct OutgoingFile {
    pub name: String,
    pub file_type: String,
    pub data: Vec<u8>,
    pub preview: Vec<u8>,
    /// Extra encryption attempts allowed, as a fraction of the part count.
    pub retry: f32,
}

pub struct TransferEngine {
    ctx: Arc<EngineContext>,
    part_rx: Mutex<Option<mpsc::Receiver<Part>>>,
    /// Parts waiting for `start`: those loaded from storage plus any sent
    /// before the batch builder runs.
    held_parts: Mutex<Vec<Part>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_callback_id: AtomicU64,
}

impl TransferEngine {
    /// Load persisted transfers and prepare the queues. Must be called from
    /// inside a tokio runtime; nothing runs until `start`.
    pub fn new(config: &MixdropConfig, deps: EngineDeps) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        wire::part_size(deps.transport.max_message_payload_size())?;

        let (sent, loaded_parts) = SentTransfers::new_or_load(&deps.kv)?;
        let (received, incomplete) = ReceivedTransfers::new_or_load(&deps.kv)?;
        let (part_tx, part_rx) = mpsc::channel(config.sending.part_queue_len);

        let ctx = Arc::new(EngineContext {
            sending: config.sending.clone(),
            recovery: config.recovery.clone(),
            transport: deps.transport,
            crypto: deps.crypto,
            announcer: deps.announcer,
            sent,
            received,
            callbacks: CallbackTracker::new(runtime),
            part_tx,
            rounds: SentRoundTracker::new(config.sending.sent_rounds_age()),
            pending_rounds: DashSet::new(),
        });

        for transfer in &incomplete {
            if let Err(e) = register_processors(&ctx, transfer) {
                tracing::warn!(transfer_id = %transfer.tid(), error = %e, "failed to re-register receive fingerprints");
            }
        }

        Ok(Self {
            ctx,
            part_rx: Mutex::new(Some(part_rx)),
            held_parts: Mutex::new(loaded_parts),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
        })
    }

    /// Spawn the batch builder, the send workers and recovery, then queue
    /// the parts held back so far.
    pub async fn start(&self) -> Result<(), EngineError> {
        let part_rx = lock(&self.part_rx)
            .take()
            .ok_or(EngineError::AlreadyStarted)?;
        let sending = &self.ctx.sending;

        let (batch_tx, batch_rx) = mpsc::channel(sending.batch_queue_len);
        let limiter = RateLimiter::new(
            sending.max_throughput,
            sending.min_parts_per_round,
            sending.max_parts_per_round,
            self.ctx.transport.max_message_payload_size(),
        );
        let builder = BatchBuilder::new(
            part_rx,
            batch_tx,
            limiter,
            sending.min_parts_per_round,
            sending.max_parts_per_round,
            sending.batch_timeout(),
            self.cancel.clone(),
        );

        let mut tasks = Vec::with_capacity(sending.workers + 2);
        tasks.push(tokio::spawn(builder.run()));

        let batches = Arc::new(tokio::sync::Mutex::new(batch_rx));
        for id in 0..sending.workers {
            let worker = SendWorker::new(
                id,
                Arc::clone(&self.ctx),
                Arc::clone(&batches),
                self.cancel.clone(),
            );
            tasks.push(tokio::spawn(worker.run()));
        }
        tasks.push(tokio::spawn(recovery_loop(
            Arc::clone(&self.ctx),
            self.cancel.clone(),
        )));
        lock(&self.tasks).extend(tasks);

        let loaded = std::mem::take(&mut *lock(&self.held_parts));
        tracing::info!(
            workers = sending.workers,
            max_throughput = sending.max_throughput,
            queued = loaded.len(),
            "transfer engine started"
        );
        self.ctx.requeue(loaded).await;
        Ok(())
    }

    /// Stop every task and wait for them to exit. Parts still queued are
    /// picked up again from storage on the next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "engine task ended abnormally");
            }
        }
        tracing::info!("transfer engine stopped");
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// Announce `file` to `recipient` and queue all of its parts. Before
    /// `start` the parts are held and queued once the engine runs.
    pub async fn send(
        &self,
        recipient: PeerId,
        file: OutgoingFile,
        progress: Option<SentProgressCallback>,
        period: Duration,
    ) -> Result<TransferId, EngineError> {
        check_limits(&file)?;
        if !self.ctx.transport.is_healthy() {
            return Err(EngineError::NetworkUnhealthy);
        }

        let key = TransferKey::generate();
        let tid = TransferId::generate();
        let mac = TransferMac::compute(&key, &file.data);

        let part_size = wire::part_size(self.ctx.transport.max_message_payload_size())?;
        let parts = partition_file(&file.data, part_size);
        let num_parts =
            u16::try_from(parts.len()).map_err(|_| EngineError::TooManyParts(parts.len()))?;
        let file_size = u32::try_from(file.data.len()).map_err(|_| EngineError::FileTooLarge {
            len: file.data.len(),
            max: FILE_MAX_SIZE,
        })?;
        let num_fps = num_fingerprints(num_parts, file.retry);

        let announcement = TransferAnnouncement {
            file_name: file.name.clone(),
            file_type: file.file_type,
            key: key.clone(),
            mac,
            num_parts,
            size: file_size,
            retry: file.retry,
            preview: file.preview,
        };
        self.ctx
            .announcer
            .send_announcement(recipient, announcement.encode()?)?;

        self.ctx
            .sent
            .add_transfer(tid, recipient, key, file.name, file_size, parts, num_fps)?;
        if let Some(callback) = progress {
            self.register_sent_progress_callback(tid, callback, period)?;
        }

        tracing::info!(transfer_id = %tid, parts = num_parts, fingerprints = num_fps, size = file_size, "file transfer started");
        let parts = self.hold_until_started((0..num_parts).map(|n| Part::new(tid, n)).collect());
        self.ctx.requeue(parts).await;
        Ok(tid)
    }

    /// Keep `parts` back for `start` while nothing drains the part queue.
    /// Returns the parts to queue now.
    fn hold_until_started(&self, parts: Vec<Part>) -> Vec<Part> {
        // `start` takes the receiver before the held parts, so holding this
        // lock keeps it from missing parts added here.
        let part_rx = lock(&self.part_rx);
        if part_rx.is_none() {
            return parts;
        }
        lock(&self.held_parts).extend(parts);
        Vec::new()
    }

    /// Add a progress callback to an outgoing transfer. It is called once
    /// right away, then at most once per `period` while progress changes.
    pub fn register_sent_progress_callback(
        &self,
        tid: TransferId,
        callback: SentProgressCallback,
        period: Duration,
    ) -> Result<(), EngineError> {
        let transfer = self.ctx.sent.get(&tid).ok_or(EngineError::NoTransfer(tid))?;
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let thunk: ProgressThunk = Arc::new(move |err: Option<&TransferError>| {
            let progress = transfer.progress();
            let err_text = err.map(ToString::to_string);
            if transfer.callback_changed(id, &progress, err_text.as_deref()) {
                callback(&progress, err);
            }
        });
        self.ctx.callbacks.add_callback(tid, period, thunk);
        Ok(())
    }

    /// Forget a finished outgoing transfer.
    pub fn close_send(&self, tid: TransferId) -> Result<(), EngineError> {
        let transfer = self.ctx.sent.get(&tid).ok_or(EngineError::NoTransfer(tid))?;
        if !transfer.status().is_terminal() {
            return Err(EngineError::NotTerminal(tid));
        }
        self.ctx.callbacks.delete(tid);
        self.ctx.sent.delete_transfer(&tid)?;
        tracing::debug!(transfer_id = %tid, "closed sent transfer");
        Ok(())
    }

    pub fn sent_progress(&self, tid: TransferId) -> Result<SentProgress, EngineError> {
        let transfer = self.ctx.sent.get(&tid).ok_or(EngineError::NoTransfer(tid))?;
        Ok(transfer.progress())
    }

    // ── Receiving ─────────────────────────────────────────────────────────

    /// Start tracking a transfer announced by a peer and register its
    /// fingerprints. Returns the local ID of the transfer.
    pub fn handle_incoming_announcement(
        &self,
        payload: &[u8],
        progress: Option<ReceivedProgressCallback>,
        period: Duration,
    ) -> Result<TransferId, EngineError> {
        let announcement = TransferAnnouncement::decode(payload)?;
        if announcement.num_parts == 0 {
            return Err(EngineError::NoParts);
        }
        let num_fps = num_fingerprints(announcement.num_parts, announcement.retry);

        let tid = TransferId::generate();
        let transfer = self.ctx.received.add_transfer(
            tid,
            announcement.key,
            announcement.mac,
            announcement.file_name,
            announcement.size,
            announcement.num_parts,
            num_fps,
        )?;
        if let Err(e) = register_processors(&self.ctx, &transfer) {
            unregister_processors(&self.ctx, &transfer);
            if let Err(store_err) = self.ctx.received.delete_transfer(&tid) {
                tracing::warn!(transfer_id = %tid, error = %store_err, "failed to drop unregistered transfer");
            }
            return Err(e.into());
        }
        if let Some(callback) = progress {
            self.register_received_progress_callback(tid, callback, period)?;
        }

        tracing::info!(transfer_id = %tid, parts = announcement.num_parts, fingerprints = num_fps, "incoming file transfer");
        Ok(tid)
    }

    /// Add a progress callback to an incoming transfer.
    pub fn register_received_progress_callback(
        &self,
        tid: TransferId,
        callback: ReceivedProgressCallback,
        period: Duration,
    ) -> Result<(), EngineError> {
        let transfer = self
            .ctx
            .received
            .get(&tid)
            .ok_or(EngineError::NoTransfer(tid))?;
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let thunk: ProgressThunk = Arc::new(move |err: Option<&TransferError>| {
            let progress = transfer.progress();
            let err_text = err.map(ToString::to_string);
            if transfer.callback_changed(id, &progress, err_text.as_deref()) {
                callback(&progress, err);
            }
        });
        self.ctx.callbacks.add_callback(tid, period, thunk);
        Ok(())
    }

    /// Return the assembled file of a complete transfer and forget it.
    pub fn receive(&self, tid: TransferId) -> Result<Vec<u8>, EngineError> {
        let transfer = self
            .ctx
            .received
            .get(&tid)
            .ok_or(EngineError::NoTransfer(tid))?;
        let file = transfer.assembled_file()?;
        if !transfer.verify_mac(&file) {
            return Err(EngineError::MacMismatch(tid));
        }

        unregister_processors(&self.ctx, &transfer);
        self.ctx.callbacks.delete(tid);
        self.ctx.received.delete_transfer(&tid)?;
        tracing::info!(transfer_id = %tid, size = file.len(), "file received");
        Ok(file)
    }

    pub fn received_progress(&self, tid: TransferId) -> Result<ReceivedProgress, EngineError> {
        let transfer = self
            .ctx
            .received
            .get(&tid)
            .ok_or(EngineError::NoTransfer(tid))?;
        Ok(transfer.progress())
    }
}

fn check_limits(file: &OutgoingFile) -> Result<(), EngineError> {
    if file.name.len() > FILE_NAME_MAX_LEN {
        return Err(EngineError::FileNameTooLong {
            len: file.name.len(),
            max: FILE_NAME_MAX_LEN,
        });
    }
    if file.file_type.len() > FILE_TYPE_MAX_LEN {
        return Err(EngineError::FileTypeTooLong {
            len: file.file_type.len(),
            max: FILE_TYPE_MAX_LEN,
        });
    }
    if file.data.len() > FILE_MAX_SIZE {
        return Err(EngineError::FileTooLarge {
            len: file.data.len(),
            max: FILE_MAX_SIZE,
        });
    }
    if file.preview.len() > PREVIEW_MAX_SIZE {
        return Err(EngineError::PreviewTooLarge {
            len: file.preview.len(),
            max: PREVIEW_MAX_SIZE,
        });
    }
    if file.data.is_empty() {
        return Err(EngineError::EmptyFile);
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
