//! State shared by every engine task.

use std::sync::Arc;

use dashmap::DashSet;
use mixdrop_core::config::{RecoveryConfig, SendingConfig};
use mixdrop_core::{PartCrypto, RoundId};
use mixdrop_store::{Part, ReceivedTransfers, SentTransfers};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;

use crate::callbacks::CallbackTracker;
use crate::round_tracker::SentRoundTracker;
use crate::transport::{Announcer, Transport};

pub(crate) struct EngineContext {
    pub sending: SendingConfig,
    pub recovery: RecoveryConfig,
    pub transport: Arc<dyn Transport>,
    pub crypto: Arc<dyn PartCrypto>,
    pub announcer: Arc<dyn Announcer>,
    pub sent: SentTransfers,
    pub received: ReceivedTransfers,
    pub callbacks: CallbackTracker,
    pub part_tx: mpsc::Sender<Part>,
    pub rounds: SentRoundTracker,
    /// Rounds a worker is currently waiting on. Recovery leaves these alone.
    pub pending_rounds: DashSet<RoundId>,
}

impl EngineContext {
    /// Push parts back onto the ready queue in random order.
    pub async fn requeue(&self, mut parts: Vec<Part>) {
        if parts.is_empty() {
            return;
        }
        parts.shuffle(&mut rand::thread_rng());
        for part in parts {
            if self.part_tx.send(part).await.is_err() {
                tracing::debug!("part queue closed, dropping requeued parts");
                return;
            }
        }
    }
}
