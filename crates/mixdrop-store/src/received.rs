//! Receiver-side transfer state.
//!
//! Storage layout, under `ReceivedFileTransferStore/`:
//!   transfers                 — list of transfer IDs
//!   {tid}/info                — name, MAC, sizes
//!   {tid}/state               — cypher manager, received vector
//!   {tid}/receivedPart#{n}    — raw bytes of part n

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use mixdrop_core::{TransferId, TransferKey, TransferMac};
use serde::{Deserialize, Serialize};

use crate::cypher::{Cypher, CypherManager};
use crate::error::StoreError;
use crate::kv::Kv;
use crate::progress::{callback_fingerprint, PartTracker, ReceivedProgress};
use crate::state_vector::StateVector;

const STORE_PREFIX: &str = "ReceivedFileTransferStore";
const LIST_KEY: &str = "transfers";
const INFO_KEY: &str = "info";
const STATE_KEY: &str = "state";
const STORE_VERSION: u64 = 0;

fn part_key(part_num: u16) -> String {
    format!("receivedPart#{part_num}")
}

#[derive(Serialize, Deserialize)]
struct ReceivedInfo {
    file_name: String,
    mac: TransferMac,
    file_size: u32,
    num_parts: u16,
}

#[derive(Serialize, Deserialize)]
struct ReceivedInner {
    cypher: CypherManager,
    part_status: StateVector,
    #[serde(skip)]
    parts: Vec<Option<Bytes>>,
    #[serde(skip)]
    last_callback_fps: HashMap<u64, String>,
}

pub struct ReceivedTransfer {
    tid: TransferId,
    file_name: String,
    mac: TransferMac,
    file_size: u32,
    num_parts: u16,
    inner: Mutex<ReceivedInner>,
    kv: Kv,
}

impl ReceivedTransfer {
    #[allow(clippy::too_many_arguments)]
    fn create(
        tid: TransferId,
        key: TransferKey,
        mac: TransferMac,
        file_name: String,
        file_size: u32,
        num_parts: u16,
        num_fps: u16,
        kv: Kv,
    ) -> Result<Self, StoreError> {
        let info = ReceivedInfo {
            file_name: file_name.clone(),
            mac,
            file_size,
            num_parts,
        };
        kv.set(INFO_KEY, STORE_VERSION, &info)?;

        let transfer = Self {
            tid,
            file_name,
            mac,
            file_size,
            num_parts,
            inner: Mutex::new(ReceivedInner {
                cypher: CypherManager::new(key, num_fps),
                part_status: StateVector::new(num_parts),
                parts: vec![None; usize::from(num_parts)],
                last_callback_fps: HashMap::new(),
            }),
            kv,
        };
        transfer.save(&transfer.lock())?;
        Ok(transfer)
    }

    fn load(tid: TransferId, kv: Kv) -> Result<Self, StoreError> {
        let corrupt = |key: &str| StoreError::Corrupt {
            key: format!("{}/{}", tid.to_hex(), key),
        };

        let info: ReceivedInfo = kv.get(INFO_KEY, STORE_VERSION)?.ok_or_else(|| corrupt(INFO_KEY))?;
        let mut inner: ReceivedInner =
            kv.get(STATE_KEY, STORE_VERSION)?.ok_or_else(|| corrupt(STATE_KEY))?;

        if inner.part_status.num_keys() != info.num_parts {
            return Err(corrupt(STATE_KEY));
        }
        inner.parts = vec![None; usize::from(info.num_parts)];
        for part_num in inner.part_status.used_keys() {
            let key = part_key(part_num);
            let data = kv
                .get_raw(&key, STORE_VERSION)?
                .ok_or_else(|| corrupt(&key))?;
            inner.parts[usize::from(part_num)] = Some(Bytes::from(data));
        }

        Ok(Self {
            tid,
            file_name: info.file_name,
            mac: info.mac,
            file_size: info.file_size,
            num_parts: info.num_parts,
            inner: Mutex::new(inner),
            kv,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReceivedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, inner: &ReceivedInner) -> Result<(), StoreError> {
        self.kv.set(STATE_KEY, STORE_VERSION, inner)?;
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        let received = self.lock().part_status.used_keys();
        for part_num in received {
            self.kv.delete(&part_key(part_num))?;
        }
        self.kv.delete(STATE_KEY)?;
        self.kv.delete(INFO_KEY)?;
        Ok(())
    }

    pub fn tid(&self) -> TransferId {
        self.tid
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn num_parts(&self) -> u16 {
        self.num_parts
    }

    /// Store a decrypted part. Returns `false` if the part was already
    /// received; the stored copy is kept.
    pub fn add_part(&self, data: &[u8], part_num: u16) -> Result<bool, StoreError> {
        if part_num >= self.num_parts {
            return Err(StoreError::PartOutOfRange {
                part: part_num,
                max: self.num_parts,
            });
        }

        let mut inner = self.lock();
        if inner.part_status.is_used(part_num)? {
            return Ok(false);
        }

        self.kv
            .set_raw(&part_key(part_num), STORE_VERSION, data.to_vec())?;
        inner.parts[usize::from(part_num)] = Some(Bytes::copy_from_slice(data));
        inner.part_status.use_key(part_num)?;
        self.save(&inner)?;
        Ok(true)
    }

    /// Mark a fingerprint slot consumed after a message for it was decrypted.
    pub fn use_fingerprint(&self, fp_num: u16) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let newly = inner.cypher.mark_used(fp_num)?;
        if newly {
            self.save(&inner)?;
        }
        Ok(newly)
    }

    /// Fingerprints a sender may still use, for (re)registering listeners.
    pub fn unused_cyphers(&self) -> Vec<Cypher> {
        self.lock().cypher.unused_cyphers()
    }

    pub fn is_complete(&self) -> bool {
        self.lock().part_status.num_available() == 0
    }

    /// Concatenate every part and trim the padding. Fails unless all parts
    /// are present.
    pub fn assembled_file(&self) -> Result<Vec<u8>, StoreError> {
        let inner = self.lock();
        let missing = inner.part_status.num_available();
        if missing > 0 {
            return Err(StoreError::IncompleteFile {
                missing,
                total: self.num_parts,
            });
        }

        let mut file = Vec::with_capacity(self.file_size as usize);
        for part in inner.parts.iter().flatten() {
            file.extend_from_slice(part);
        }
        file.truncate(self.file_size as usize);
        Ok(file)
    }

    /// Check an assembled file against the MAC announced by the sender.
    pub fn verify_mac(&self, file: &[u8]) -> bool {
        self.mac.verify(self.lock().cypher.key(), file)
    }

    pub fn progress(&self) -> ReceivedProgress {
        let inner = self.lock();
        let received = inner.part_status.num_used();
        ReceivedProgress {
            completed: received == self.num_parts,
            received,
            total: self.num_parts,
            tracker: PartTracker::new(inner.part_status.clone(), Vec::new()),
        }
    }

    /// Record the state about to be reported to callback `callback_id`.
    /// Returns `false` when it matches that callback's previous report.
    pub fn callback_changed(
        &self,
        callback_id: u64,
        progress: &ReceivedProgress,
        err: Option<&str>,
    ) -> bool {
        let fp = callback_fingerprint(progress.completed, progress.received, progress.total, err);
        let mut inner = self.lock();
        if inner.last_callback_fps.get(&callback_id) == Some(&fp) {
            return false;
        }
        inner.last_callback_fps.insert(callback_id, fp);
        true
    }
}

// ── Collection ────────────────────────────────────────────────────────────────

/// Every incoming transfer, indexed by ID.
pub struct ReceivedTransfers {
    transfers: DashMap<TransferId, Arc<ReceivedTransfer>>,
    kv: Kv,
    list_lock: Mutex<()>,
}

impl ReceivedTransfers {
    /// Restore every stored transfer. Also returns those still missing parts,
    /// whose fingerprints must be registered again.
    pub fn new_or_load(kv: &Kv) -> Result<(Self, Vec<Arc<ReceivedTransfer>>), StoreError> {
        let kv = kv.prefix(STORE_PREFIX);
        let tids: Vec<TransferId> = kv.get(LIST_KEY, STORE_VERSION)?.unwrap_or_default();

        let transfers = DashMap::new();
        let mut incomplete = Vec::new();
        for tid in tids {
            let transfer = match ReceivedTransfer::load(tid, kv.prefix(&tid.to_hex())) {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    tracing::warn!(transfer_id = %tid, error = %e, "skipping unreadable received transfer");
                    continue;
                }
            };
            if !transfer.is_complete() {
                incomplete.push(Arc::clone(&transfer));
            }
            transfers.insert(tid, transfer);
        }

        let received = Self {
            transfers,
            kv,
            list_lock: Mutex::new(()),
        };
        Ok((received, incomplete))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_transfer(
        &self,
        tid: TransferId,
        key: TransferKey,
        mac: TransferMac,
        file_name: String,
        file_size: u32,
        num_parts: u16,
        num_fps: u16,
    ) -> Result<Arc<ReceivedTransfer>, StoreError> {
        if self.transfers.contains_key(&tid) {
            return Err(StoreError::DuplicateTransfer(tid));
        }
        let transfer = Arc::new(ReceivedTransfer::create(
            tid,
            key,
            mac,
            file_name,
            file_size,
            num_parts,
            num_fps,
            self.kv.prefix(&tid.to_hex()),
        )?);
        self.transfers.insert(tid, Arc::clone(&transfer));
        self.save_list()?;
        Ok(transfer)
    }

    pub fn get(&self, tid: &TransferId) -> Option<Arc<ReceivedTransfer>> {
        self.transfers.get(tid).map(|e| Arc::clone(e.value()))
    }

    pub fn delete_transfer(&self, tid: &TransferId) -> Result<(), StoreError> {
        let (_, transfer) = self
            .transfers
            .remove(tid)
            .ok_or(StoreError::NoTransfer(*tid))?;
        transfer.delete()?;
        self.save_list()
    }

    fn save_list(&self) -> Result<(), StoreError> {
        let _guard = self.list_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let tids: Vec<TransferId> = self.transfers.iter().map(|e| *e.key()).collect();
        self.kv.set(LIST_KEY, STORE_VERSION, &tids)?;
        Ok(())
    }
}
