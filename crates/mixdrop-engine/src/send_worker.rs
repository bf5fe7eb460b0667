//! Send worker — pulls batches, encrypts each part under a fresh
//! fingerprint, transmits the batch as one round and waits for its outcome.
//!
//! Workers stop pulling batches while the transport is unhealthy and stay
//! responsive to shutdown while paused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mixdrop_core::wire::{encode_part, WireError};
use mixdrop_core::{RoundId, TransferId};
use mixdrop_store::{Part, SentTransfer, StoreError};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::context::EngineContext;
use crate::error::TransferError;
use crate::outcome::resolve_round;
use crate::round_tracker::ExcludedRounds;
use crate::transport::{RoundStatus, TargetedMessage};

/// Extra time a worker waits past the round results timeout before treating
/// an unanswered query as a failed round.
const RESULT_SLACK: Duration = Duration::from_secs(1);

pub(crate) type BatchQueue = Arc<Mutex<mpsc::Receiver<Vec<Part>>>>;

pub(crate) struct SendWorker {
    id: usize,
    ctx: Arc<EngineContext>,
    batches: BatchQueue,
    cancel: CancellationToken,
}

impl SendWorker {
    pub fn new(
        id: usize,
        ctx: Arc<EngineContext>,
        batches: BatchQueue,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ctx,
            batches,
            cancel,
        }
    }

    pub async fn run(self) {
        let (health_tx, mut health_rx) = mpsc::unbounded_channel();
        let subscription = self
            .ctx
            .transport
            .add_health_callback(Box::new(move |healthy: bool| {
                let _ = health_tx.send(healthy);
            }));
        tracing::debug!(worker = self.id, "send worker started");

        let mut running = self.ctx.transport.is_healthy() || self.wait_healthy(&mut health_rx).await;
        while running {
            tokio::select! {
                _ = self.cancel.cancelled() => running = false,

                Some(healthy) = health_rx.recv() => {
                    if !healthy {
                        tracing::debug!(worker = self.id, "network unhealthy, pausing");
                        running = self.wait_healthy(&mut health_rx).await;
                    }
                }

                batch = next_batch(&self.batches) => match batch {
                    Some(batch) => self.send_batch(batch).await,
                    None => {
                        tracing::debug!(worker = self.id, "batch queue closed");
                        running = false;
                    }
                },
            }
        }

        self.ctx.transport.remove_health_callback(subscription);
        tracing::debug!(worker = self.id, "send worker stopped");
    }

    /// Block until the network reports healthy. `false` on shutdown.
    async fn wait_healthy(&self, health_rx: &mut mpsc::UnboundedReceiver<bool>) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                healthy = health_rx.recv() => match healthy {
                    Some(true) => {
                        tracing::debug!(worker = self.id, "network healthy, resuming");
                        return true;
                    }
                    Some(false) => {}
                    None => return false,
                },
            }
        }
    }

    async fn send_batch(&self, batch: Vec<Part>) {
        let ctx = &self.ctx;
        let payload_size = ctx.transport.max_message_payload_size();

        let mut messages = Vec::with_capacity(batch.len());
        let mut sent: Vec<Part> = Vec::with_capacity(batch.len());
        let mut retry: Vec<Part> = Vec::new();

        for part in batch {
            let Some(transfer) = ctx.sent.get(&part.transfer_id) else {
                tracing::trace!(transfer_id = %part.transfer_id, part = part.part_num, "dropping part of closed transfer");
                continue;
            };
            if transfer.status().is_terminal() {
                continue;
            }

            match self.encrypt(&transfer, part.part_num, payload_size) {
                Ok(message) => {
                    messages.push(message);
                    sent.push(part);
                }
                Err(PrepareError::Exhausted) => {
                    fail_transfer(ctx, &transfer);
                }
                Err(PrepareError::Store(e)) if !e.is_invariant() => {
                    tracing::warn!(transfer_id = %part.transfer_id, part = part.part_num, error = %e, "failed to prepare part, requeueing");
                    retry.push(part);
                }
                Err(e) => {
                    tracing::error!(transfer_id = %part.transfer_id, part = part.part_num, error = %e, "dropping part");
                }
            }
        }
        ctx.requeue(retry).await;

        if messages.is_empty() {
            return;
        }

        ctx.rounds.remove_old_rounds();
        let round = match ctx.transport.transmit(messages, &ctx.rounds) {
            Ok(round) => round,
            Err(e) => {
                tracing::warn!(worker = self.id, parts = sent.len(), error = %e, "transmit failed, requeueing batch");
                ctx.requeue(sent).await;
                return;
            }
        };
        ctx.rounds.insert(round);
        ctx.pending_rounds.insert(round);
        tracing::debug!(worker = self.id, %round, parts = sent.len(), "batch transmitted");

        let tids = record_in_progress(ctx, round, &sent);
        self.await_outcome(round, tids);
    }

    fn encrypt(
        &self,
        transfer: &SentTransfer,
        part_num: u16,
        payload_size: usize,
    ) -> Result<TargetedMessage, PrepareError> {
        let cypher = match transfer.pop_cypher() {
            Ok(cypher) => cypher,
            Err(StoreError::FingerprintsExhausted) => return Err(PrepareError::Exhausted),
            Err(e) => return Err(e.into()),
        };
        let body = transfer.part_data(part_num)?;
        let plaintext = encode_part(part_num, &body, payload_size)?;
        tracing::trace!(transfer_id = %transfer.tid(), part = part_num, fp = cypher.fp_num(), "part encrypted");
        Ok(TargetedMessage {
            recipient: transfer.recipient(),
            part: cypher.encrypt(self.ctx.crypto.as_ref(), &plaintext),
        })
    }

    /// Query the outcome of `round` and resolve it in the background so the
    /// worker can move on to the next batch.
    fn await_outcome(&self, round: RoundId, tids: Vec<TransferId>) {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        let timeout = ctx.sending.round_results_timeout();

        let (tx, rx) = oneshot::channel();
        let queried = ctx.transport.query_round_outcome(
            &[round],
            timeout,
            Box::new(move |_: bool, statuses: HashMap<RoundId, RoundStatus>| {
                let _ = tx.send(statuses);
            }),
        );

        tokio::spawn(async move {
            let delivered = match queried {
                Ok(()) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            ctx.pending_rounds.remove(&round);
                            return;
                        }
                        res = tokio::time::timeout(timeout + RESULT_SLACK, rx) => match res {
                            Ok(Ok(statuses)) => statuses.get(&round) == Some(&RoundStatus::Succeeded),
                            Ok(Err(_)) => false,
                            Err(_) => {
                                tracing::warn!(%round, "no round outcome before timeout");
                                false
                            }
                        },
                    }
                }
                Err(e) => {
                    tracing::warn!(%round, error = %e, "round outcome query failed");
                    false
                }
            };
            resolve_round(&ctx, round, &tids, delivered).await;
            ctx.pending_rounds.remove(&round);
        });
    }
}

async fn next_batch(batches: &BatchQueue) -> Option<Vec<Part>> {
    batches.lock().await.recv().await
}

/// Record every transmitted part against `round`, grouped by transfer.
fn record_in_progress(ctx: &EngineContext, round: RoundId, sent: &[Part]) -> Vec<TransferId> {
    let mut by_transfer: HashMap<TransferId, Vec<u16>> = HashMap::new();
    for part in sent {
        by_transfer
            .entry(part.transfer_id)
            .or_default()
            .push(part.part_num);
    }

    let mut tids = Vec::with_capacity(by_transfer.len());
    for (tid, parts) in by_transfer {
        let Some(transfer) = ctx.sent.get(&tid) else {
            continue;
        };
        match transfer.set_in_progress(round, &parts) {
            Ok(true) => {
                tracing::warn!(transfer_id = %tid, %round, "round already held parts of this transfer");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(transfer_id = %tid, %round, error = %e, "failed to persist in-flight parts");
            }
        }
        tids.push(tid);
    }
    tids
}

fn fail_transfer(ctx: &EngineContext, transfer: &SentTransfer) {
    match transfer.mark_failed() {
        Ok(true) => {
            tracing::warn!(transfer_id = %transfer.tid(), "fingerprints exhausted, failing transfer");
        }
        // Another worker got there first and already reported it.
        Ok(false) => return,
        Err(e) => {
            tracing::warn!(transfer_id = %transfer.tid(), error = %e, "failed to persist failed status");
        }
    }
    ctx.callbacks
        .call(transfer.tid(), Some(&TransferError::RetriesExhausted));
}

#[derive(Debug, thiserror::Error)]
enum PrepareError {
    #[error("fingerprints exhausted")]
    Exhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
