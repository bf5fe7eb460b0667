use mixdrop_core::config::ConfigError;
use mixdrop_core::wire::WireError;
use mixdrop_core::TransferId;
use mixdrop_store::StoreError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned directly by `TransferEngine` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file name of {len} bytes exceeds maximum of {max}")]
    FileNameTooLong { len: usize, max: usize },
    #[error("file type of {len} bytes exceeds maximum of {max}")]
    FileTypeTooLong { len: usize, max: usize },
    #[error("file of {len} bytes exceeds maximum of {max}")]
    FileTooLarge { len: usize, max: usize },
    #[error("preview of {len} bytes exceeds maximum of {max}")]
    PreviewTooLarge { len: usize, max: usize },
    #[error("cannot send an empty file")]
    EmptyFile,
    #[error("file needs {0} parts, more than a transfer can hold")]
    TooManyParts(usize),
    #[error("announcement describes a transfer with no parts")]
    NoParts,
    #[error("cannot send file: network is not healthy")]
    NetworkUnhealthy,
    #[error("no transfer with ID {0}")]
    NoTransfer(TransferId),
    #[error("cannot delete transfer {0} that has not completed or failed")]
    NotTerminal(TransferId),
    #[error("received file for transfer {0} failed MAC verification")]
    MacMismatch(TransferId),
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine must be created inside a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Terminal errors reported through a transfer's progress callbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("file transfer failed: ran out of retries")]
    RetriesExhausted,
}

/// Failures of old-round reconciliation. Never attached to a transfer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("failed to recover {rounds} rounds after {attempts} attempts")]
    Unresolved { rounds: usize, attempts: u32 },
    #[error("recovery cancelled")]
    Cancelled,
}
