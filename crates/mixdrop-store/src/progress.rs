//! Progress snapshots handed to callbacks.

use serde::{Deserialize, Serialize};

use crate::state_vector::StateVector;

/// Lifecycle of a sent transfer. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Running,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Not yet delivered and not in any outstanding round.
    Pending,
    /// Sent in a round whose outcome is not known yet.
    InFlight,
    /// Delivered (sender) or received (receiver).
    Arrived,
}

/// Point-in-time view of every part of one transfer.
#[derive(Debug, Clone)]
pub struct PartTracker {
    arrived: StateVector,
    in_flight: Vec<u16>,
}

impl PartTracker {
    pub(crate) fn new(arrived: StateVector, mut in_flight: Vec<u16>) -> Self {
        in_flight.sort_unstable();
        Self { arrived, in_flight }
    }

    pub fn part_status(&self, part_num: u16) -> Option<PartStatus> {
        match self.arrived.is_used(part_num) {
            Err(_) => None,
            Ok(true) => Some(PartStatus::Arrived),
            Ok(false) if self.in_flight.binary_search(&part_num).is_ok() => {
                Some(PartStatus::InFlight)
            }
            Ok(false) => Some(PartStatus::Pending),
        }
    }

    pub fn num_parts(&self) -> u16 {
        self.arrived.num_keys()
    }
}

#[derive(Debug, Clone)]
pub struct SentProgress {
    pub completed: bool,
    pub arrived: u16,
    pub total: u16,
    pub status: TransferStatus,
    pub tracker: PartTracker,
}

#[derive(Debug, Clone)]
pub struct ReceivedProgress {
    pub completed: bool,
    pub received: u16,
    pub total: u16,
    pub tracker: PartTracker,
}

/// Comparison key for callback deduplication.
pub(crate) fn callback_fingerprint(
    completed: bool,
    count: u16,
    total: u16,
    err: Option<&str>,
) -> String {
    format!("{completed}{count}{total}{}", err.unwrap_or("<nil>"))
}
