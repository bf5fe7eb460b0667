//! Versioned key/value storage.
//!
//! Transfers persist through the `KvStore` trait. Every value is wrapped in a
//! `VersionedObject` so a record written by an older layout is detected on
//! load instead of being misread.
//!
//! Two stores ship with the crate:
//!   `MemKv`  — DashMap-backed, for tests and ephemeral nodes
//!   `FileKv` — one file per key in a two-level directory tree:
//!              {root}/{hash[0..2]}/{full_hash}
//!              where hash = BLAKE3(key). Writes are atomic (tmp → rename).

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedObject {
    pub version: u64,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

impl VersionedObject {
    pub fn new(version: u64, data: Vec<u8>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            version,
            timestamp_ms,
            data,
        }
    }
}

/// Persistent storage consumed by the transfer state.
///
/// `get` returns `Ok(None)` for a missing key; deleting a missing key is not
/// an error.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<VersionedObject>, KvError>;
    fn set(&self, key: &str, object: VersionedObject) -> Result<(), KvError>;
    fn delete(&self, key: &str) -> Result<(), KvError>;
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemKv {
    entries: Arc<DashMap<String, VersionedObject>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &str) -> Result<Option<VersionedObject>, KvError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn set(&self, key: &str, object: VersionedObject) -> Result<(), KvError> {
        self.entries.insert(key.to_string(), object);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }
}

// ── On disk ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| KvError::Io(root.clone(), e))?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let hex = blake3::hash(key.as_bytes()).to_hex();
        self.root.join(&hex[0..2]).join(hex.as_str())
    }

    /// Number of stored keys (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<VersionedObject>, KvError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KvError::Io(path, e)),
        };
        let object = serde_json::from_slice(&bytes).map_err(KvError::Encoding)?;
        Ok(Some(object))
    }

    fn set(&self, key: &str, object: VersionedObject) -> Result<(), KvError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| KvError::Io(parent.to_path_buf(), e))?;
        }

        let bytes = serde_json::to_vec(&object).map_err(KvError::Encoding)?;

        // Atomic write: tmp file → rename
        let tmp_path = path.with_extension("tmp");
        {
            let mut file =
                fs::File::create(&tmp_path).map_err(|e| KvError::Io(tmp_path.clone(), e))?;
            file.write_all(&bytes)
                .map_err(|e| KvError::Io(tmp_path.clone(), e))?;
            file.sync_all().map_err(|e| KvError::Io(tmp_path.clone(), e))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| KvError::Io(path.clone(), e))?;

        tracing::trace!(key, "kv entry written");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KvError::Io(path, e)),
        }
    }
}

// ── Prefixed view ─────────────────────────────────────────────────────────────

/// A store handle scoped to a key prefix, with typed JSON helpers.
#[derive(Clone)]
pub struct Kv {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl Kv {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
        }
    }

    /// A child view whose keys live under `name/`.
    pub fn prefix(&self, name: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: format!("{}{}/", self.prefix, name),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get_raw(&self, key: &str, version: u64) -> Result<Option<Vec<u8>>, KvError> {
        let full = self.full_key(key);
        match self.store.get(&full)? {
            None => Ok(None),
            Some(obj) if obj.version != version => Err(KvError::VersionMismatch {
                key: full,
                expected: version,
                found: obj.version,
            }),
            Some(obj) => Ok(Some(obj.data)),
        }
    }

    pub fn set_raw(&self, key: &str, version: u64, data: Vec<u8>) -> Result<(), KvError> {
        self.store
            .set(&self.full_key(key), VersionedObject::new(version, data))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, version: u64) -> Result<Option<T>, KvError> {
        match self.get_raw(key, version)? {
            None => Ok(None),
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(KvError::Encoding),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, version: u64, value: &T) -> Result<(), KvError> {
        let data = serde_json::to_vec(value).map_err(KvError::Encoding)?;
        self.set_raw(key, version, data)
    }

    pub fn delete(&self, key: &str) -> Result<(), KvError> {
        self.store.delete(&self.full_key(key))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage I/O on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("encoding: {0}")]
    Encoding(serde_json::Error),
    #[error("{key}: stored version {found}, expected {expected}")]
    VersionMismatch { key: String, expected: u64, found: u64 },
}
