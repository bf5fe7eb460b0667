//! Simulated mix network.
//!
//! Rounds are numbered from 1. With `fail_every = n`, every n-th round is
//! lost: its messages are dropped and its outcome reads `Failed`. Other
//! rounds deliver each message to the processor registered for its
//! fingerprint, or park it until one registers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mixdrop_core::{EncryptedPart, Fingerprint, PeerId, RoundId};
use mixdrop_engine::{
    Announcer, ExcludedRounds, FingerprintProcessor, HealthCallback, RoundOutcomeCallback,
    RoundStatus, TargetedMessage, Transport, TransportError,
};

#[derive(Default)]
struct NetState {
    next_round: u64,
    fail_every: u64,
    hold_queries: bool,
    rounds: HashMap<RoundId, RoundStatus>,
    processors: HashMap<Fingerprint, Arc<dyn FingerprintProcessor>>,
    mailbox: HashMap<Fingerprint, Vec<EncryptedPart>>,
    held: Vec<RoundOutcomeCallback>,
    health_callbacks: HashMap<u64, Arc<HealthCallback>>,
    next_callback: u64,
    transmitted: usize,
}

pub struct SimNetwork {
    state: Mutex<NetState>,
    healthy: AtomicBool,
    payload_size: usize,
}

impl SimNetwork {
    pub fn new(payload_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState {
                next_round: 1,
                ..NetState::default()
            }),
            healthy: AtomicBool::new(true),
            payload_size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap()
    }

    /// Lose every `n`-th round. 0 delivers everything.
    pub fn fail_every(&self, n: u64) {
        self.lock().fail_every = n;
    }

    /// Keep outcome callbacks without ever calling them.
    pub fn hold_queries(&self, hold: bool) {
        self.lock().hold_queries = hold;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
        let callbacks: Vec<_> = self.lock().health_callbacks.values().cloned().collect();
        for callback in callbacks {
            (*callback)(healthy);
        }
    }

    /// Messages accepted by `transmit`, delivered or not.
    pub fn transmitted(&self) -> usize {
        self.lock().transmitted
    }

    pub fn registered_fingerprints(&self) -> usize {
        self.lock().processors.len()
    }
}

impl Transport for SimNetwork {
    fn transmit(
        &self,
        messages: Vec<TargetedMessage>,
        excluded: &dyn ExcludedRounds,
    ) -> Result<RoundId, TransportError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::Unhealthy);
        }

        let mut deliveries = Vec::new();
        let round = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut round = RoundId(state.next_round);
            while excluded.has(round) {
                round = RoundId(round.0 + 1);
            }
            state.next_round = round.0 + 1;
            state.transmitted += messages.len();

            let lost = state.fail_every > 0 && round.0 % state.fail_every == 0;
            let status = if lost {
                RoundStatus::Failed
            } else {
                RoundStatus::Succeeded
            };
            state.rounds.insert(round, status);

            if !lost {
                for message in messages {
                    let fp = message.part.fingerprint;
                    match state.processors.get(&fp) {
                        Some(processor) => deliveries.push((Arc::clone(processor), message.part)),
                        None => state.mailbox.entry(fp).or_default().push(message.part),
                    }
                }
            }
            round
        };

        for (processor, part) in deliveries {
            processor.process(&part);
        }
        Ok(round)
    }

    fn register_fingerprint(
        &self,
        fingerprint: Fingerprint,
        processor: Arc<dyn FingerprintProcessor>,
    ) -> Result<(), TransportError> {
        let parked = {
            let mut state = self.lock();
            state.processors.insert(fingerprint, Arc::clone(&processor));
            state.mailbox.remove(&fingerprint).unwrap_or_default()
        };
        for part in parked {
            processor.process(&part);
        }
        Ok(())
    }

    fn unregister_fingerprint(&self, fingerprint: &Fingerprint) {
        self.lock().processors.remove(fingerprint);
    }

    fn query_round_outcome(
        &self,
        rounds: &[RoundId],
        _timeout: Duration,
        callback: RoundOutcomeCallback,
    ) -> Result<(), TransportError> {
        let statuses: HashMap<RoundId, RoundStatus> = {
            let mut state = self.lock();
            if state.hold_queries {
                state.held.push(callback);
                return Ok(());
            }
            rounds
                .iter()
                .filter_map(|r| state.rounds.get(r).map(|s| (*r, *s)))
                .collect()
        };
        let all_ok = statuses.len() == rounds.len()
            && statuses.values().all(|s| *s == RoundStatus::Succeeded);
        callback(all_ok, statuses);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn add_health_callback(&self, callback: HealthCallback) -> u64 {
        let mut state = self.lock();
        state.next_callback += 1;
        let id = state.next_callback;
        state.health_callbacks.insert(id, Arc::new(callback));
        id
    }

    fn remove_health_callback(&self, id: u64) {
        self.lock().health_callbacks.remove(&id);
    }

    fn max_message_payload_size(&self) -> usize {
        self.payload_size
    }
}

/// Records everything sent on the announcement channel.
#[derive(Default)]
pub struct SimAnnouncer {
    announcements: Mutex<Vec<(PeerId, Vec<u8>)>>,
    completions: Mutex<Vec<PeerId>>,
}

impl SimAnnouncer {
    pub fn last_announcement(&self) -> Option<(PeerId, Vec<u8>)> {
        self.announcements.lock().unwrap().last().cloned()
    }

    pub fn completions(&self) -> Vec<PeerId> {
        self.completions.lock().unwrap().clone()
    }
}

impl Announcer for SimAnnouncer {
    fn send_announcement(&self, recipient: PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.announcements.lock().unwrap().push((recipient, payload));
        Ok(())
    }

    fn send_completion(&self, recipient: PeerId) -> Result<(), TransportError> {
        self.completions.lock().unwrap().push(recipient);
        Ok(())
    }
}
