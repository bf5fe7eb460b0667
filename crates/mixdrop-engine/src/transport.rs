//! Collaborators the engine drives but does not implement.
//!
//! `Transport` is the mix network: it carries fixed-size messages in rounds,
//! reports round outcomes after the fact and signals health changes.
//! `Announcer` is the separate reliable channel used once per transfer to
//! hand the receiver its key, and once more to say the transfer finished.
//!
//! Implementations must not block for long; every method is called from
//! async tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mixdrop_core::{EncryptedPart, Fingerprint, PeerId, RoundId};
use thiserror::Error;

use crate::round_tracker::ExcludedRounds;

/// One encrypted part addressed to a peer.
#[derive(Debug, Clone)]
pub struct TargetedMessage {
    pub recipient: PeerId,
    pub part: EncryptedPart,
}

/// Outcome of one round as reported by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Called once with `true` if every queried round succeeded, and the status
/// of each round that could be resolved.
pub type RoundOutcomeCallback = Box<dyn FnOnce(bool, HashMap<RoundId, RoundStatus>) + Send>;

/// Called on every health change.
pub type HealthCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Handles messages that arrive for a registered fingerprint.
pub trait FingerprintProcessor: Send + Sync {
    fn process(&self, part: &EncryptedPart);
}

pub trait Transport: Send + Sync {
    /// Send every message in one round, avoiding the rounds in `excluded`.
    fn transmit(
        &self,
        messages: Vec<TargetedMessage>,
        excluded: &dyn ExcludedRounds,
    ) -> Result<RoundId, TransportError>;

    fn register_fingerprint(
        &self,
        fingerprint: Fingerprint,
        processor: Arc<dyn FingerprintProcessor>,
    ) -> Result<(), TransportError>;

    fn unregister_fingerprint(&self, fingerprint: &Fingerprint);

    /// Ask for the outcome of `rounds`. `callback` is called exactly once,
    /// at the latest after `timeout`. An error means the query itself could
    /// not be issued.
    fn query_round_outcome(
        &self,
        rounds: &[RoundId],
        timeout: Duration,
        callback: RoundOutcomeCallback,
    ) -> Result<(), TransportError>;

    fn is_healthy(&self) -> bool;

    fn add_health_callback(&self, callback: HealthCallback) -> u64;

    fn remove_health_callback(&self, id: u64);

    /// Bytes available to the engine in one message.
    fn max_message_payload_size(&self) -> usize;
}

pub trait Announcer: Send + Sync {
    /// Deliver an encoded `TransferAnnouncement` to `recipient`.
    fn send_announcement(&self, recipient: PeerId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Tell `recipient` that every part of a transfer to them has arrived.
    fn send_completion(&self, recipient: PeerId) -> Result<(), TransportError>;
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network is not healthy")]
    Unhealthy,
    #[error("send failed: {0}")]
    Send(String),
    #[error("round outcome query failed: {0}")]
    Query(String),
    #[error("fingerprint registration failed: {0}")]
    Registration(String),
}
