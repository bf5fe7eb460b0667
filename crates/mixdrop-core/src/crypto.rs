//! Part encryption and the keys that drive it.
//!
//! Every transfer has one symmetric `TransferKey`. Each transmission attempt
//! of a part is encrypted under a one-time fingerprint slot of that key:
//!
//!   part_key    = BLAKE3-derive("mixdrop part key", key || fp_num)
//!   mac_key     = BLAKE3-derive("mixdrop part mac", key || fp_num)
//!   fingerprint = BLAKE3-derive("mixdrop fingerprint", key || fp_num)
//!
//! The fingerprint is what the receiver listens for. A given fingerprint is
//! only ever used for one ciphertext, so a replayed or duplicated message can
//! never be confused with a fresh attempt.
//!
//! Key material derives ZeroizeOnDrop. There is no unsafe code in this module.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const PART_KEY_CONTEXT: &str = "mixdrop 2024-06 part key";
const PART_MAC_CONTEXT: &str = "mixdrop 2024-06 part mac";
const FINGERPRINT_CONTEXT: &str = "mixdrop 2024-06 fingerprint";
const TRANSFER_MAC_CONTEXT: &str = "mixdrop 2024-06 transfer mac";

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Symmetric secret for one transfer. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct TransferKey([u8; 32]);

impl TransferKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn derive(&self, context: &str, fp_num: u16) -> Zeroizing<[u8; 32]> {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(&self.0);
        hasher.update(&fp_num.to_le_bytes());
        Zeroizing::new(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferKey(..)")
    }
}

/// Per-attempt tag derived from a transfer key and a fingerprint index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn derive(key: &TransferKey, fp_num: u16) -> Self {
        Self(*key.derive(FINGERPRINT_CONTEXT, fp_num))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

// ── Transfer MAC ──────────────────────────────────────────────────────────────

/// Keyed hash over a complete file, announced by the sender and checked by
/// the receiver once every part has arrived.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMac(pub [u8; 32]);

impl TransferMac {
    pub fn compute(key: &TransferKey, file: &[u8]) -> Self {
        let mac_key = Zeroizing::new(blake3::derive_key(TRANSFER_MAC_CONTEXT, key.as_bytes()));
        Self(*blake3::keyed_hash(&mac_key, file).as_bytes())
    }

    /// Constant-time comparison against a freshly computed MAC.
    pub fn verify(&self, key: &TransferKey, file: &[u8]) -> bool {
        let expected = Self::compute(key, file);
        blake3::Hash::from(expected.0) == blake3::Hash::from(self.0)
    }
}

impl fmt::Debug for TransferMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferMac({})", hex::encode(&self.0[..8]))
    }
}

// ── Part crypto ───────────────────────────────────────────────────────────────

/// One encrypted part as it travels through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPart {
    pub ciphertext: Vec<u8>,
    pub mac: [u8; 32],
    pub fingerprint: Fingerprint,
}

/// Symmetric encryption of a single part under one fingerprint slot.
///
/// The engine only ever calls these two methods; anything implementing them
/// with a fresh key per `(key, fp_num)` pair can be plugged in.
pub trait PartCrypto: Send + Sync {
    fn encrypt_part(&self, key: &TransferKey, fp_num: u16, plaintext: &[u8]) -> EncryptedPart;

    fn decrypt_part(
        &self,
        key: &TransferKey,
        fp_num: u16,
        part: &EncryptedPart,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// BLAKE3 keyed-XOF stream cipher with an encrypt-then-MAC tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3PartCrypto;

impl Blake3PartCrypto {
    fn apply_keystream(part_key: &[u8; 32], data: &mut [u8]) {
        let mut stream = Zeroizing::new(vec![0u8; data.len()]);
        blake3::Hasher::new_keyed(part_key)
            .finalize_xof()
            .fill(&mut stream);
        for (byte, k) in data.iter_mut().zip(stream.iter()) {
            *byte ^= k;
        }
    }
}

impl PartCrypto for Blake3PartCrypto {
    fn encrypt_part(&self, key: &TransferKey, fp_num: u16, plaintext: &[u8]) -> EncryptedPart {
        let part_key = key.derive(PART_KEY_CONTEXT, fp_num);
        let mac_key = key.derive(PART_MAC_CONTEXT, fp_num);

        let mut ciphertext = plaintext.to_vec();
        Self::apply_keystream(&part_key, &mut ciphertext);
        let mac = *blake3::keyed_hash(&mac_key, &ciphertext).as_bytes();

        EncryptedPart {
            ciphertext,
            mac,
            fingerprint: Fingerprint::derive(key, fp_num),
        }
    }

    fn decrypt_part(
        &self,
        key: &TransferKey,
        fp_num: u16,
        part: &EncryptedPart,
    ) -> Result<Vec<u8>, CryptoError> {
        if Fingerprint::derive(key, fp_num) != part.fingerprint {
            return Err(CryptoError::FingerprintMismatch(fp_num));
        }

        let mac_key = key.derive(PART_MAC_CONTEXT, fp_num);
        let expected = blake3::keyed_hash(&mac_key, &part.ciphertext);
        if expected != blake3::Hash::from(part.mac) {
            return Err(CryptoError::MacMismatch(fp_num));
        }

        let part_key = key.derive(PART_KEY_CONTEXT, fp_num);
        let mut plaintext = part.ciphertext.clone();
        Self::apply_keystream(&part_key, &mut plaintext);
        Ok(plaintext)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("fingerprint does not match slot {0}")]
    FingerprintMismatch(u16),
    #[error("MAC verification failed for slot {0}")]
    MacMismatch(u16),
}
