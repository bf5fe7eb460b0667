//! Fingerprint allocation for one transfer.
//!
//! Every encryption attempt consumes one fingerprint slot. The manager hands
//! out slots in ascending order and reports exhaustion once all `num_fps` are
//! gone, at which point a sender transfer can no longer be retried.

use std::sync::Arc;

use mixdrop_core::crypto::{CryptoError, EncryptedPart, Fingerprint, PartCrypto, TransferKey};
use serde::{Deserialize, Serialize};

use crate::state_vector::{StateVector, StateVectorError};

/// A transfer key bound to one fingerprint slot.
#[derive(Debug, Clone)]
pub struct Cypher {
    key: Arc<TransferKey>,
    fp_num: u16,
}

impl Cypher {
    pub fn fp_num(&self) -> u16 {
        self.fp_num
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(&self.key, self.fp_num)
    }

    pub fn encrypt(&self, crypto: &dyn PartCrypto, plaintext: &[u8]) -> EncryptedPart {
        crypto.encrypt_part(&self.key, self.fp_num, plaintext)
    }

    pub fn decrypt(
        &self,
        crypto: &dyn PartCrypto,
        part: &EncryptedPart,
    ) -> Result<Vec<u8>, CryptoError> {
        crypto.decrypt_part(&self.key, self.fp_num, part)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CypherManager {
    key: Arc<TransferKey>,
    fp_vector: StateVector,
}

impl CypherManager {
    pub fn new(key: TransferKey, num_fps: u16) -> Self {
        Self {
            key: Arc::new(key),
            fp_vector: StateVector::new(num_fps),
        }
    }

    /// Allocate the next unused fingerprint slot.
    pub fn pop_cypher(&mut self) -> Result<Cypher, StateVectorError> {
        let fp_num = self.fp_vector.next()?;
        Ok(self.cypher(fp_num))
    }

    /// Every slot that has not been allocated or consumed yet.
    pub fn unused_cyphers(&self) -> Vec<Cypher> {
        self.fp_vector
            .unused_keys()
            .into_iter()
            .map(|fp_num| self.cypher(fp_num))
            .collect()
    }

    /// Mark a slot consumed. Returns `false` if it already was.
    pub fn mark_used(&mut self, fp_num: u16) -> Result<bool, StateVectorError> {
        self.fp_vector.use_key(fp_num)
    }

    pub fn num_available(&self) -> u16 {
        self.fp_vector.num_available()
    }

    pub fn num_fps(&self) -> u16 {
        self.fp_vector.num_keys()
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    fn cypher(&self, fp_num: u16) -> Cypher {
        Cypher {
            key: Arc::clone(&self.key),
            fp_num,
        }
    }
}
