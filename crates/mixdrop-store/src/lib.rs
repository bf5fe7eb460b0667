//! mixdrop-store — per-transfer state and its persistence.
//!
//! Sender and receiver state, the fingerprint allocator, the state vector
//! they are built on, and the versioned key/value layer they persist to.

pub mod cypher;
pub mod error;
pub mod kv;
pub mod part;
pub mod progress;
pub mod received;
pub mod sent;
pub mod state_vector;

pub use cypher::{Cypher, CypherManager};
pub use error::StoreError;
pub use kv::{FileKv, Kv, KvError, KvStore, MemKv, VersionedObject};
pub use part::{num_fingerprints, partition_file, Part};
pub use progress::{PartStatus, PartTracker, ReceivedProgress, SentProgress, TransferStatus};
pub use received::{ReceivedTransfer, ReceivedTransfers};
pub use sent::{SentTransfer, SentTransfers};
pub use state_vector::{StateVector, StateVectorError};
