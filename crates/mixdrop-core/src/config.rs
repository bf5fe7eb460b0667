//! Configuration system for mixdrop.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MIXDROP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mixdrop/config.toml
//!   3. ~/.config/mixdrop/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MixdropConfig {
    pub sending: SendingConfig,
    pub recovery: RecoveryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendingConfig {
    /// Bytes per second released to the network. 0 = unlimited.
    pub max_throughput: u64,
    /// Concurrent sending workers.
    pub workers: usize,
    /// Bounds on the number of parts sent in one round.
    pub min_parts_per_round: usize,
    pub max_parts_per_round: usize,
    /// Idle time after which a partial batch is released.
    pub batch_timeout_ms: u64,
    /// How long a worker waits for a round outcome.
    pub round_results_timeout_ms: u64,
    /// Age after which a round is forgotten by the sent-round tracker.
    pub sent_rounds_age_ms: u64,
    pub part_queue_len: usize,
    pub batch_queue_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Round-outcome queries attempted before recovery gives up.
    pub max_attempts: u32,
    /// Wall-clock bound on one recovery run. 0 = unbounded.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the on-disk key/value store.
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            max_throughput: 150_000,
            workers: 4,
            min_parts_per_round: 1,
            max_parts_per_round: 11,
            batch_timeout_ms: 100,
            round_results_timeout_ms: 15_000,
            sent_rounds_age_ms: 10_000,
            part_queue_len: 10_000,
            batch_queue_len: 10_000,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_ms: 300_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("kv"),
        }
    }
}

impl SendingConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn round_results_timeout(&self) -> Duration {
        Duration::from_millis(self.round_results_timeout_ms)
    }

    pub fn sent_rounds_age(&self) -> Duration {
        Duration::from_millis(self.sent_rounds_age_ms)
    }
}

impl RecoveryConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mixdrop")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("mixdrop")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MixdropConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MixdropConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MIXDROP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MixdropConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sending;
        if s.workers == 0 {
            return Err(ConfigError::Invalid("sending.workers must be at least 1"));
        }
        if s.min_parts_per_round == 0 {
            return Err(ConfigError::Invalid("sending.min_parts_per_round must be at least 1"));
        }
        if s.min_parts_per_round > s.max_parts_per_round {
            return Err(ConfigError::Invalid(
                "sending.min_parts_per_round exceeds sending.max_parts_per_round",
            ));
        }
        if s.part_queue_len == 0 || s.batch_queue_len == 0 {
            return Err(ConfigError::Invalid("queue lengths must be at least 1"));
        }
        Ok(())
    }

    /// Apply MIXDROP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MIXDROP_MAX_THROUGHPUT") {
            if let Ok(n) = v.parse() {
                self.sending.max_throughput = n;
            }
        }
        if let Ok(v) = std::env::var("MIXDROP_WORKERS") {
            if let Ok(n) = v.parse() {
                self.sending.workers = n;
            }
        }
        if let Ok(v) = std::env::var("MIXDROP_RECOVERY_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.recovery.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("MIXDROP_STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
    }
}
