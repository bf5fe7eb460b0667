//! Sent-round tracking — remembers which rounds were recently used for
//! sending so the transport does not put two batches in the same round.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mixdrop_core::RoundId;
use tokio::time::Instant;

/// Rounds the transport must not pick for the next send.
pub trait ExcludedRounds: Send + Sync {
    fn has(&self, round: RoundId) -> bool;
    /// Returns `true` if the round was not already excluded.
    fn insert(&self, round: RoundId) -> bool;
    fn remove(&self, round: RoundId);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aged set of rounds recently used for sending.
#[derive(Clone)]
pub struct SentRoundTracker {
    rounds: Arc<DashMap<RoundId, Instant>>,
    max_age: Duration,
}

impl SentRoundTracker {
    pub fn new(max_age: Duration) -> Self {
        Self {
            rounds: Arc::new(DashMap::new()),
            max_age,
        }
    }

    /// Forget rounds older than the configured age. Bounds memory only;
    /// nothing depends on a round being remembered.
    pub fn remove_old_rounds(&self) {
        let now = Instant::now();
        let before = self.rounds.len();
        self.rounds
            .retain(|_, sent_at| now.duration_since(*sent_at) < self.max_age);
        let pruned = before.saturating_sub(self.rounds.len());
        if pruned > 0 {
            tracing::trace!(pruned, remaining = self.rounds.len(), "pruned sent rounds");
        }
    }
}

impl ExcludedRounds for SentRoundTracker {
    fn has(&self, round: RoundId) -> bool {
        self.rounds.contains_key(&round)
    }

    fn insert(&self, round: RoundId) -> bool {
        self.rounds.insert(round, Instant::now()).is_none()
    }

    fn remove(&self, round: RoundId) {
        self.rounds.remove(&round);
    }

    fn len(&self) -> usize {
        self.rounds.len()
    }
}
