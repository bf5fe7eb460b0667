//! In-process transport and announcer for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use mixdrop_core::config::MixdropConfig;
use mixdrop_core::{Blake3PartCrypto, Fingerprint, PeerId, RoundId, TransferId, TransferKey};
use mixdrop_store::{partition_file, Kv, Part, ReceivedTransfers, SentTransfer, SentTransfers};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::callbacks::CallbackTracker;
use crate::context::EngineContext;
use crate::round_tracker::{ExcludedRounds, SentRoundTracker};
use crate::transport::{
    Announcer, FingerprintProcessor, HealthCallback, RoundOutcomeCallback, RoundStatus,
    TargetedMessage, Transport, TransportError,
};

pub(crate) struct MockTransport {
    pub healthy: AtomicBool,
    pub payload_size: usize,
    next_round: AtomicU64,
    /// Outcome reported per round. Unlisted rounds succeed.
    pub outcomes: Mutex<HashMap<RoundId, RoundStatus>>,
    /// Number of upcoming outcome queries that fail outright.
    pub failing_queries: AtomicU32,
    pub queries: AtomicUsize,
    pub transmitted: Mutex<Vec<(RoundId, Vec<TargetedMessage>)>>,
    pub fingerprints: DashMap<Fingerprint, Arc<dyn FingerprintProcessor>>,
    /// Registrations beyond this many fingerprints are refused.
    pub max_fingerprints: AtomicUsize,
    health_callbacks: Mutex<HashMap<u64, HealthCallback>>,
    next_callback: AtomicU64,
}

impl MockTransport {
    pub fn new(payload_size: usize) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            payload_size,
            next_round: AtomicU64::new(1),
            outcomes: Mutex::new(HashMap::new()),
            failing_queries: AtomicU32::new(0),
            queries: AtomicUsize::new(0),
            transmitted: Mutex::new(Vec::new()),
            fingerprints: DashMap::new(),
            max_fingerprints: AtomicUsize::new(usize::MAX),
            health_callbacks: Mutex::new(HashMap::new()),
            next_callback: AtomicU64::new(1),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        for callback in self.health_callbacks.lock().unwrap().values() {
            callback(healthy);
        }
    }

    pub fn set_outcome(&self, round: RoundId, status: RoundStatus) {
        self.outcomes.lock().unwrap().insert(round, status);
    }
}

impl Transport for MockTransport {
    fn transmit(
        &self,
        messages: Vec<TargetedMessage>,
        excluded: &dyn ExcludedRounds,
    ) -> Result<RoundId, TransportError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::Unhealthy);
        }
        let mut round = RoundId(self.next_round.fetch_add(1, Ordering::SeqCst));
        while excluded.has(round) {
            round = RoundId(self.next_round.fetch_add(1, Ordering::SeqCst));
        }
        self.transmitted.lock().unwrap().push((round, messages));
        Ok(round)
    }

    fn register_fingerprint(
        &self,
        fingerprint: Fingerprint,
        processor: Arc<dyn FingerprintProcessor>,
    ) -> Result<(), TransportError> {
        if self.fingerprints.len() >= self.max_fingerprints.load(Ordering::SeqCst) {
            return Err(TransportError::Registration("fingerprint table full".into()));
        }
        self.fingerprints.insert(fingerprint, processor);
        Ok(())
    }

    fn unregister_fingerprint(&self, fingerprint: &Fingerprint) {
        self.fingerprints.remove(fingerprint);
    }

    fn query_round_outcome(
        &self,
        rounds: &[RoundId],
        _timeout: Duration,
        callback: RoundOutcomeCallback,
    ) -> Result<(), TransportError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_queries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_queries.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Query("gateway unreachable".into()));
        }
        let statuses: HashMap<RoundId, RoundStatus> = {
            let outcomes = self.outcomes.lock().unwrap();
            rounds
                .iter()
                .map(|r| (*r, outcomes.get(r).copied().unwrap_or(RoundStatus::Succeeded)))
                .collect()
        };
        let all_ok = statuses.values().all(|s| *s == RoundStatus::Succeeded);
        callback(all_ok, statuses);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn add_health_callback(&self, callback: HealthCallback) -> u64 {
        let id = self.next_callback.fetch_add(1, Ordering::SeqCst);
        self.health_callbacks.lock().unwrap().insert(id, callback);
        id
    }

    fn remove_health_callback(&self, id: u64) {
        self.health_callbacks.lock().unwrap().remove(&id);
    }

    fn max_message_payload_size(&self) -> usize {
        self.payload_size
    }
}

#[derive(Default)]
pub(crate) struct RecordingAnnouncer {
    pub announcements: Mutex<Vec<(PeerId, Vec<u8>)>>,
    pub completions: Mutex<Vec<PeerId>>,
}

impl Announcer for RecordingAnnouncer {
    fn send_announcement(&self, recipient: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.announcements.lock().unwrap().push((recipient, payload));
        Ok(())
    }

    fn send_completion(&self, recipient: PeerId) -> Result<(), TransportError> {
        self.completions.lock().unwrap().push(recipient);
        Ok(())
    }
}

/// Build an engine context over `kv` with default settings. Returns the
/// receiving end of the part queue.
pub(crate) fn context(
    transport: Arc<MockTransport>,
    announcer: Arc<RecordingAnnouncer>,
    kv: &Kv,
) -> (Arc<EngineContext>, mpsc::Receiver<Part>) {
    let config = MixdropConfig::default();
    let (sent, _) = SentTransfers::new_or_load(kv).unwrap();
    let (received, _) = ReceivedTransfers::new_or_load(kv).unwrap();
    let (part_tx, part_rx) = mpsc::channel(1024);
    let ctx = Arc::new(EngineContext {
        rounds: SentRoundTracker::new(config.sending.sent_rounds_age()),
        sending: config.sending,
        recovery: config.recovery,
        transport,
        crypto: Arc::new(Blake3PartCrypto),
        announcer,
        sent,
        received,
        callbacks: CallbackTracker::new(Handle::current()),
        part_tx,
        pending_rounds: DashSet::new(),
    });
    (ctx, part_rx)
}

/// Every part currently waiting in the queue.
pub(crate) fn drain(part_rx: &mut mpsc::Receiver<Part>) -> Vec<Part> {
    let mut parts = Vec::new();
    while let Ok(part) = part_rx.try_recv() {
        parts.push(part);
    }
    parts
}

/// Recipient of every transfer made by `add_sent_transfer`.
pub(crate) const RECIPIENT: PeerId = PeerId::from_bytes([7; 32]);

/// Add a sender transfer of `num_parts` 16-byte parts, sized for a
/// `MockTransport` payload of 20 bytes.
pub(crate) fn add_sent_transfer(
    ctx: &EngineContext,
    num_parts: u16,
    num_fps: u16,
) -> Arc<SentTransfer> {
    let data = vec![0x33; usize::from(num_parts) * 16];
    ctx.sent
        .add_transfer(
            TransferId::generate(),
            RECIPIENT,
            TransferKey::generate(),
            "scan.png".into(),
            data.len() as u32,
            partition_file(&data, 16),
            num_fps,
        )
        .unwrap()
}
