//! Sender-side transfer state.
//!
//! Each `SentTransfer` owns the file's parts, the arrival vector, the
//! fingerprint allocator and the record of which parts are out in which
//! round. Everything mutable sits behind one per-transfer lock; the lock is
//! never held across an await or a user callback.
//!
//! Storage layout, under `SentFileTransferStore/`:
//!   transfers           — list of transfer IDs
//!   {tid}/info          — recipient, name, sizes
//!   {tid}/parts         — raw part bytes, concatenated
//!   {tid}/state         — cypher manager, status, arrivals, in-flight rounds

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use mixdrop_core::{PeerId, RoundId, TransferId, TransferKey};
use serde::{Deserialize, Serialize};

use crate::cypher::{Cypher, CypherManager};
use crate::error::StoreError;
use crate::kv::Kv;
use crate::part::Part;
use crate::progress::{callback_fingerprint, PartTracker, SentProgress, TransferStatus};
use crate::state_vector::{StateVector, StateVectorError};

const STORE_PREFIX: &str = "SentFileTransferStore";
const LIST_KEY: &str = "transfers";
const INFO_KEY: &str = "info";
const PARTS_KEY: &str = "parts";
const STATE_KEY: &str = "state";
const STORE_VERSION: u64 = 0;

#[derive(Serialize, Deserialize)]
struct SentInfo {
    recipient: PeerId,
    file_name: String,
    file_size: u32,
    num_parts: u16,
    part_size: u32,
}

#[derive(Serialize, Deserialize)]
struct SentInner {
    cypher: CypherManager,
    status: TransferStatus,
    part_status: StateVector,
    #[serde(with = "round_map")]
    in_flight: BTreeMap<RoundId, Vec<u16>>,
    #[serde(skip)]
    last_callback_fps: HashMap<u64, String>,
}

impl SentInner {
    /// Record one arrival, completing the transfer on the last one.
    fn arrive(&mut self, part_num: u16) -> Result<bool, StateVectorError> {
        let newly = self.part_status.use_key(part_num)?;
        if newly
            && self.status == TransferStatus::Running
            && self.part_status.num_available() == 0
        {
            self.status = TransferStatus::Completed;
        }
        Ok(newly)
    }

    fn in_flight_parts(&self) -> Vec<u16> {
        self.in_flight.values().flatten().copied().collect()
    }
}

pub struct SentTransfer {
    tid: TransferId,
    recipient: PeerId,
    file_name: String,
    file_size: u32,
    parts: Vec<Bytes>,
    inner: Mutex<SentInner>,
    kv: Kv,
}

impl SentTransfer {
    #[allow(clippy::too_many_arguments)]
    fn create(
        tid: TransferId,
        recipient: PeerId,
        key: TransferKey,
        file_name: String,
        file_size: u32,
        parts: Vec<Bytes>,
        num_fps: u16,
        kv: Kv,
    ) -> Result<Self, StoreError> {
        let num_parts = u16::try_from(parts.len())
            .map_err(|_| StoreError::Invariant(format!("{} parts do not fit a transfer", parts.len())))?;
        let part_size = parts.first().map_or(0, |p| p.len()) as u32;

        let transfer = Self {
            tid,
            recipient,
            file_name,
            file_size,
            inner: Mutex::new(SentInner {
                cypher: CypherManager::new(key, num_fps),
                status: TransferStatus::Running,
                part_status: StateVector::new(num_parts),
                in_flight: BTreeMap::new(),
                last_callback_fps: HashMap::new(),
            }),
            parts,
            kv,
        };

        let info = SentInfo {
            recipient,
            file_name: transfer.file_name.clone(),
            file_size,
            num_parts,
            part_size,
        };
        transfer.kv.set(INFO_KEY, STORE_VERSION, &info)?;
        transfer
            .kv
            .set_raw(PARTS_KEY, STORE_VERSION, transfer.parts.concat())?;
        transfer.save(&transfer.lock())?;
        Ok(transfer)
    }

    fn load(tid: TransferId, kv: Kv) -> Result<Self, StoreError> {
        let corrupt = |key: &str| StoreError::Corrupt {
            key: format!("{}/{}", tid.to_hex(), key),
        };

        let info: SentInfo = kv.get(INFO_KEY, STORE_VERSION)?.ok_or_else(|| corrupt(INFO_KEY))?;
        let raw = kv
            .get_raw(PARTS_KEY, STORE_VERSION)?
            .ok_or_else(|| corrupt(PARTS_KEY))?;
        let inner: SentInner = kv.get(STATE_KEY, STORE_VERSION)?.ok_or_else(|| corrupt(STATE_KEY))?;

        let part_size = info.part_size as usize;
        if part_size == 0 || raw.len() != part_size * usize::from(info.num_parts) {
            return Err(corrupt(PARTS_KEY));
        }
        let raw = Bytes::from(raw);
        let parts = (0..usize::from(info.num_parts))
            .map(|i| raw.slice(i * part_size..(i + 1) * part_size))
            .collect();

        Ok(Self {
            tid,
            recipient: info.recipient,
            file_name: info.file_name,
            file_size: info.file_size,
            parts,
            inner: Mutex::new(inner),
            kv,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, inner: &SentInner) -> Result<(), StoreError> {
        self.kv.set(STATE_KEY, STORE_VERSION, inner)?;
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        for key in [INFO_KEY, PARTS_KEY, STATE_KEY] {
            self.kv.delete(key)?;
        }
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn tid(&self) -> TransferId {
        self.tid
    }

    pub fn recipient(&self) -> PeerId {
        self.recipient
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn num_parts(&self) -> u16 {
        self.parts.len() as u16
    }

    pub fn status(&self) -> TransferStatus {
        self.lock().status
    }

    /// Raw bytes of one part, padded to the part size.
    pub fn part_data(&self, part_num: u16) -> Result<Bytes, StoreError> {
        self.parts
            .get(usize::from(part_num))
            .cloned()
            .ok_or_else(|| {
                StoreError::Invariant(format!(
                    "part {part_num} requested from transfer {} with {} parts",
                    self.tid,
                    self.parts.len()
                ))
            })
    }

    // ── Parts ─────────────────────────────────────────────────────────────

    /// Parts that have not arrived yet.
    pub fn unsent_parts(&self) -> Vec<u16> {
        self.lock().part_status.unused_keys()
    }

    /// Parts that have not arrived and are not out in any round.
    pub fn queueable_parts(&self) -> Vec<u16> {
        let inner = self.lock();
        let mut in_flight = inner.in_flight_parts();
        in_flight.sort_unstable();
        inner
            .part_status
            .unused_keys()
            .into_iter()
            .filter(|p| in_flight.binary_search(p).is_err())
            .collect()
    }

    /// Allocate the next fingerprint for an encryption attempt.
    pub fn pop_cypher(&self) -> Result<Cypher, StoreError> {
        let mut inner = self.lock();
        let cypher = match inner.cypher.pop_cypher() {
            Ok(c) => c,
            Err(StateVectorError::Exhausted(_)) => return Err(StoreError::FingerprintsExhausted),
            Err(e) => return Err(e.into()),
        };
        self.save(&inner)?;
        Ok(cypher)
    }

    /// Mark one part arrived. Returns `false` if it had already arrived.
    pub fn mark_arrived(&self, part_num: u16) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let newly = inner.arrive(part_num)?;
        if newly {
            self.save(&inner)?;
        }
        Ok(newly)
    }

    /// Irreversibly fail a running transfer. Returns `false` if it was
    /// already terminal.
    pub fn mark_failed(&self) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.status != TransferStatus::Running {
            return Ok(false);
        }
        inner.status = TransferStatus::Failed;
        self.save(&inner)?;
        Ok(true)
    }

    // ── Rounds ────────────────────────────────────────────────────────────

    /// Record parts as sent on `round`. Returns `true` if the round already
    /// held parts of this transfer.
    pub fn set_in_progress(&self, round: RoundId, parts: &[u16]) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let existed = inner.in_flight.contains_key(&round);
        inner.in_flight.entry(round).or_default().extend_from_slice(parts);
        self.save(&inner)?;
        Ok(existed)
    }

    /// Resolve `round` as delivered: every part it carried arrives. Returns
    /// `true` if this call completed the transfer.
    pub fn finish_in_progress(&self, round: RoundId) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let parts = inner.in_flight.remove(&round).ok_or_else(|| {
            StoreError::Invariant(format!(
                "round {round} finished on transfer {} without being set in progress",
                self.tid
            ))
        })?;

        let was_running = inner.status == TransferStatus::Running;
        for part_num in parts {
            inner.arrive(part_num)?;
        }
        self.save(&inner)?;
        Ok(was_running && inner.status == TransferStatus::Completed)
    }

    /// Resolve `round` as lost and return the parts to resend. Empty if the
    /// round was already resolved.
    ///
    /// The parts are returned even if persisting the change fails.
    pub fn unset_in_progress(&self, round: RoundId) -> Vec<u16> {
        let mut inner = self.lock();
        let Some(parts) = inner.in_flight.remove(&round) else {
            return Vec::new();
        };
        if let Err(e) = self.save(&inner) {
            tracing::warn!(transfer_id = %self.tid, %round, error = %e, "failed to persist lost round");
        }
        parts
    }

    pub fn in_flight_rounds(&self) -> Vec<(RoundId, Vec<u16>)> {
        self.lock()
            .in_flight
            .iter()
            .map(|(r, p)| (*r, p.clone()))
            .collect()
    }

    // ── Progress ──────────────────────────────────────────────────────────

    pub fn progress(&self) -> SentProgress {
        let inner = self.lock();
        SentProgress {
            completed: inner.status == TransferStatus::Completed,
            arrived: inner.part_status.num_used(),
            total: inner.part_status.num_keys(),
            status: inner.status,
            tracker: PartTracker::new(inner.part_status.clone(), inner.in_flight_parts()),
        }
    }

    /// Record the state about to be reported to callback `callback_id`.
    /// Returns `false` when it matches that callback's previous report, in
    /// which case the call should be skipped.
    pub fn callback_changed(
        &self,
        callback_id: u64,
        progress: &SentProgress,
        err: Option<&str>,
    ) -> bool {
        let fp = callback_fingerprint(progress.completed, progress.arrived, progress.total, err);
        let mut inner = self.lock();
        if inner.last_callback_fps.get(&callback_id) == Some(&fp) {
            return false;
        }
        inner.last_callback_fps.insert(callback_id, fp);
        true
    }
}

// ── Collection ────────────────────────────────────────────────────────────────

/// Every outgoing transfer, indexed by ID.
pub struct SentTransfers {
    transfers: DashMap<TransferId, Arc<SentTransfer>>,
    kv: Kv,
    list_lock: Mutex<()>,
}

impl SentTransfers {
    /// Restore every stored transfer. Also returns the parts of running
    /// transfers that should be queued for sending; parts out in a round are
    /// left to recovery.
    pub fn new_or_load(kv: &Kv) -> Result<(Self, Vec<Part>), StoreError> {
        let kv = kv.prefix(STORE_PREFIX);
        let tids: Vec<TransferId> = kv.get(LIST_KEY, STORE_VERSION)?.unwrap_or_default();

        let transfers = DashMap::new();
        let mut to_queue = Vec::new();
        for tid in tids {
            let transfer = match SentTransfer::load(tid, kv.prefix(&tid.to_hex())) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(transfer_id = %tid, error = %e, "skipping unreadable sent transfer");
                    continue;
                }
            };
            if transfer.status() == TransferStatus::Running {
                to_queue.extend(transfer.queueable_parts().into_iter().map(|p| Part::new(tid, p)));
            }
            transfers.insert(tid, Arc::new(transfer));
        }

        if !transfers.is_empty() {
            tracing::info!(
                transfers = transfers.len(),
                parts = to_queue.len(),
                "loaded sent transfers"
            );
        }

        let sent = Self {
            transfers,
            kv,
            list_lock: Mutex::new(()),
        };
        Ok((sent, to_queue))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_transfer(
        &self,
        tid: TransferId,
        recipient: PeerId,
        key: TransferKey,
        file_name: String,
        file_size: u32,
        parts: Vec<Bytes>,
        num_fps: u16,
    ) -> Result<Arc<SentTransfer>, StoreError> {
        if self.transfers.contains_key(&tid) {
            return Err(StoreError::DuplicateTransfer(tid));
        }
        let transfer = Arc::new(SentTransfer::create(
            tid,
            recipient,
            key,
            file_name,
            file_size,
            parts,
            num_fps,
            self.kv.prefix(&tid.to_hex()),
        )?);
        self.transfers.insert(tid, Arc::clone(&transfer));
        self.save_list()?;
        Ok(transfer)
    }

    pub fn get(&self, tid: &TransferId) -> Option<Arc<SentTransfer>> {
        self.transfers.get(tid).map(|e| Arc::clone(e.value()))
    }

    pub fn all(&self) -> Vec<Arc<SentTransfer>> {
        self.transfers.iter().map(|e| Arc::clone(e.value())).collect()
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

/// In-flight rounds persist as a list of pairs.
mod round_map {
    use std::collections::BTreeMap;

    use mixdrop_core::RoundId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<RoundId, Vec<u16>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<BTreeMap<RoundId, Vec<u16>>, D::Error> {
        let pairs: Vec<(RoundId, Vec<u16>)> = Vec::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}
