//! mixdrop-engine — reliable file transfer over a lossy mix network.
//!
//! Files are split into fixed-size parts, each sent encrypted under a
//! single-use fingerprint. Parts travel in batched rounds; a lost round sends
//! its parts back to the queue under fresh fingerprints until every part has
//! arrived or the transfer runs out of fingerprints.

mod batch;
mod callbacks;
mod context;
mod error;
mod manager;
mod outcome;
mod rate_limit;
mod receive;
mod recovery;
mod round_tracker;
mod send_worker;
mod transport;

#[cfg(test)]
mod test_util;

pub use callbacks::{CallbackTracker, ProgressThunk};
pub use error::{EngineError, RecoveryError, TransferError};
pub use manager::{
    EngineDeps, OutgoingFile, ReceivedProgressCallback, SentProgressCallback, TransferEngine,
};
pub use rate_limit::RateLimiter;
pub use round_tracker::{ExcludedRounds, SentRoundTracker};
pub use transport::{
    Announcer, FingerprintProcessor, HealthCallback, RoundOutcomeCallback, RoundStatus,
    TargetedMessage, Transport, TransportError,
};

pub use mixdrop_core::{FILE_MAX_SIZE, FILE_NAME_MAX_LEN, FILE_TYPE_MAX_LEN, PREVIEW_MAX_SIZE};
