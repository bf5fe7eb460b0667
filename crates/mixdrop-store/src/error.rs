use mixdrop_core::TransferId;
use thiserror::Error;

use crate::kv::KvError;
use crate::state_vector::StateVectorError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("file transfer failed: ran out of retries")]
    FingerprintsExhausted,
    #[error("part number {part} out of range of max {max}")]
    PartOutOfRange { part: u16, max: u16 },
    #[error("cannot get incomplete file: missing {missing} of {total} parts")]
    IncompleteFile { missing: u16, total: u16 },
    #[error("no transfer with ID {0}")]
    NoTransfer(TransferId),
    #[error("transfer {0} already exists")]
    DuplicateTransfer(TransferId),
    #[error("stored state for {key} is missing or corrupt")]
    Corrupt { key: String },
    #[error(transparent)]
    StateVector(#[from] StateVectorError),
    /// A caller broke a contract of the transfer state, e.g. finishing a
    /// round that was never set in progress.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl StoreError {
    pub fn is_invariant(&self) -> bool {
        matches!(self, StoreError::Invariant(_))
    }
}
