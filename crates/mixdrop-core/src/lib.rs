//! mixdrop-core — identifiers, part crypto, wire format and configuration.
//! The store and engine crates depend on this one.

pub mod config;
pub mod crypto;
pub mod ids;
pub mod wire;

pub use crypto::{Blake3PartCrypto, EncryptedPart, Fingerprint, PartCrypto, TransferKey, TransferMac};
pub use ids::{PeerId, RoundId, TransferId};

/// Longest file name accepted by `send`, in bytes.
pub const FILE_NAME_MAX_LEN: usize = 48;

/// Longest file type accepted by `send`, in bytes.
pub const FILE_TYPE_MAX_LEN: usize = 8;

/// Largest file accepted by `send`, in bytes.
pub const FILE_MAX_SIZE: usize = 250_000;

/// Largest preview accepted by `send`, in bytes.
pub const PREVIEW_MAX_SIZE: usize = 4_000;
