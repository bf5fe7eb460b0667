//! Fixed-capacity used/unused bitset.
//!
//! The shared primitive behind fingerprint allocation and part-arrival
//! tracking. A vector never shrinks and a key never becomes unused again.
//!
//! The vector is plain data. Callers keep it inside the lock of the transfer
//! that owns it; snapshots for progress reporting are taken with `clone()`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BLOCK_BITS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    blocks: Vec<u64>,
    /// Lowest key that may still be unused. Everything below it is used.
    first_available: u32,
    num_keys: u32,
    num_available: u32,
}

impl StateVector {
    pub fn new(num_keys: u16) -> Self {
        let num_keys = u32::from(num_keys);
        let num_blocks = num_keys.div_ceil(BLOCK_BITS) as usize;
        Self {
            blocks: vec![0; num_blocks],
            first_available: 0,
            num_keys,
            num_available: num_keys,
        }
    }

    /// Mark `key` used. Returns `false` if it was already used, in which
    /// case nothing changes.
    pub fn use_key(&mut self, key: u16) -> Result<bool, StateVectorError> {
        self.check(key)?;
        if self.bit(key) {
            return Ok(false);
        }

        let (block, mask) = locate(key);
        self.blocks[block] |= mask;
        self.num_available -= 1;

        if u32::from(key) == self.first_available {
            self.advance_first_available();
        }
        Ok(true)
    }

    /// Allocate and return the lowest unused key.
    pub fn next(&mut self) -> Result<u16, StateVectorError> {
        if self.num_available == 0 {
            return Err(StateVectorError::Exhausted(self.num_keys));
        }
        let key = self.first_available as u16;
        self.use_key(key)?;
        Ok(key)
    }

    pub fn is_used(&self, key: u16) -> Result<bool, StateVectorError> {
        self.check(key)?;
        Ok(self.bit(key))
    }

    pub fn used_keys(&self) -> Vec<u16> {
        self.keys().filter(|k| self.bit(*k)).collect()
    }

    pub fn unused_keys(&self) -> Vec<u16> {
        self.keys().filter(|k| !self.bit(*k)).collect()
    }

    pub fn num_used(&self) -> u16 {
        (self.num_keys - self.num_available) as u16
    }

    pub fn num_available(&self) -> u16 {
        self.num_available as u16
    }

    pub fn num_keys(&self) -> u16 {
        self.num_keys as u16
    }

    fn keys(&self) -> impl Iterator<Item = u16> {
        0..self.num_keys as u16
    }

    fn bit(&self, key: u16) -> bool {
        let (block, mask) = locate(key);
        self.blocks[block] & mask != 0
    }

    fn check(&self, key: u16) -> Result<(), StateVectorError> {
        if u32::from(key) >= self.num_keys {
            return Err(StateVectorError::OutOfRange {
                key,
                num_keys: self.num_keys as u16,
            });
        }
        Ok(())
    }

    fn advance_first_available(&mut self) {
        while self.first_available < self.num_keys && self.bit(self.first_available as u16) {
            self.first_available += 1;
        }
    }
}

fn locate(key: u16) -> (usize, u64) {
    let key = u32::from(key);
    ((key / BLOCK_BITS) as usize, 1u64 << (key % BLOCK_BITS))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateVectorError {
    #[error("key {key} out of range of {num_keys} keys")]
    OutOfRange { key: u16, num_keys: u16 },
    #[error("all {0} keys used")]
    Exhausted(u32),
}
