//! Store configuration
//!
//! A TOML file (`tsvault.toml`) with one section per subsystem, overlaid
//! with `TSVAULT_*` environment variables, then turned into a [`StoreConfig`].

use crate::storage::journal::{JournalOptions, JournalSyncMode};
use crate::store::StoreConfig;
use crate::throttle::ThrottleConfig;
use crate::txn::{LockPolicy, TxnConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub journal: JournalSection,

    #[serde(default)]
    pub transactions: TransactionSection,

    #[serde(default)]
    pub throttle: ThrottleSection,

    #[serde(default)]
    pub index: IndexSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data directory and container layout
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Expected number of keys
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    #[serde(default = "default_max_entries_per_dir")]
    pub max_entries_per_dir: u64,

    #[serde(default = "default_dir_fan_out")]
    pub dir_fan_out: u32,

    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,

    #[serde(default = "default_true")]
    pub compress: bool,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// 0 disables periodic checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tsvault").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tsvault_data".to_string())
}

fn default_capacity() -> u64 {
    1_000_000
}

fn default_max_entries_per_dir() -> u64 {
    1000
}

fn default_dir_fan_out() -> u32 {
    64
}

fn default_max_open_files() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> u64 {
    200
}

fn default_checkpoint_interval() -> u64 {
    300
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            capacity: default_capacity(),
            max_entries_per_dir: default_max_entries_per_dir(),
            dir_fan_out: default_dir_fan_out(),
            max_open_files: default_max_open_files(),
            compress: default_true(),
            flush_interval_ms: default_flush_interval(),
            checkpoint_interval_secs: default_checkpoint_interval(),
        }
    }
}

/// Write-ahead journal settings
#[derive(Debug, Clone, Deserialize)]
pub struct JournalSection {
    #[serde(default)]
    pub sync_mode: JournalSyncMode,

    #[serde(default = "default_segment_size")]
    pub segment_size_mb: u64,

    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,
}

fn default_segment_size() -> u64 {
    16
}

fn default_batch_bytes() -> usize {
    64 * 1024
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            sync_mode: JournalSyncMode::default(),
            segment_size_mb: default_segment_size(),
            batch_bytes: default_batch_bytes(),
        }
    }
}

/// Transaction timeouts and lock behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionSection {
    #[serde(default = "default_tx_timeout")]
    pub timeout_secs: u64,

    /// "wait" or "no_wait"
    #[serde(default = "default_lock_policy")]
    pub lock_policy: String,

    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,

    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,
}

fn default_tx_timeout() -> u64 {
    300
}

fn default_lock_policy() -> String {
    "wait".to_string()
}

fn default_lock_wait() -> u64 {
    30_000
}

fn default_reaper_interval() -> u64 {
    1000
}

impl Default for TransactionSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_tx_timeout(),
            lock_policy: default_lock_policy(),
            lock_wait_ms: default_lock_wait(),
            reaper_interval_ms: default_reaper_interval(),
        }
    }
}

/// Admission control
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_queued")]
    pub max_queued: usize,

    /// 0 waits indefinitely
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    64
}

fn default_max_queued() -> usize {
    256
}

fn default_queue_timeout() -> u64 {
    30_000
}

impl Default for ThrottleSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queued: default_max_queued(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

/// Index tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSection {
    #[serde(default = "default_fanout")]
    pub fanout: usize,
}

fn default_fanout() -> usize {
    crate::storage::format::DEFAULT_FANOUT
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            fanout: default_fanout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsvault").join("config.toml")),
            Some(PathBuf::from("/etc/tsvault/config.toml")),
            Some(PathBuf::from("./tsvault.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("TSVAULT_DATA_DIR") {
            self.store.data_dir = data_dir;
        }

        if let Ok(max) = std::env::var("TSVAULT_MAX_CONCURRENT") {
            if let Ok(n) = max.parse() {
                self.throttle.max_concurrent = n;
            }
        }

        if let Ok(level) = std::env::var("TSVAULT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TSVAULT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.store.dir_fan_out < 2 {
            return invalid(format!("dir_fan_out must be at least 2, got {}", self.store.dir_fan_out));
        }
        if u64::from(self.store.dir_fan_out) > self.store.max_entries_per_dir {
            return invalid(format!(
                "dir_fan_out ({}) exceeds max_entries_per_dir ({})",
                self.store.dir_fan_out, self.store.max_entries_per_dir
            ));
        }
        if self.index.fanout < 3 {
            return invalid(format!("index fanout must be at least 3, got {}", self.index.fanout));
        }
        if self.throttle.max_concurrent == 0 {
            return invalid("throttle.max_concurrent must be positive".to_string());
        }
        if !matches!(self.transactions.lock_policy.as_str(), "wait" | "no_wait") {
            return invalid(format!(
                "unknown lock_policy '{}' (expected wait or no_wait)",
                self.transactions.lock_policy
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return invalid(format!("unknown log format '{}'", self.logging.format));
        }
        Ok(())
    }

    /// Runtime store settings
    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        self.validate()?;
        let tx = &self.transactions;
        let lock_policy = match tx.lock_policy.as_str() {
            "no_wait" => LockPolicy::NoWait,
            _ => LockPolicy::Wait(Duration::from_millis(tx.lock_wait_ms)),
        };
        Ok(StoreConfig {
            data_dir: expand_home(&self.store.data_dir),
            capacity: self.store.capacity,
            max_entries_per_dir: self.store.max_entries_per_dir,
            dir_fan_out: self.store.dir_fan_out,
            max_open_files: self.store.max_open_files,
            compress: self.store.compress,
            index_fanout: self.index.fanout,
            journal: JournalOptions {
                sync_mode: self.journal.sync_mode,
                segment_size: self.journal.segment_size_mb * 1024 * 1024,
                batch_bytes: self.journal.batch_bytes,
            },
            txn: TxnConfig {
                timeout: Duration::from_secs(tx.timeout_secs),
                lock_policy,
                reaper_interval: Duration::from_millis(tx.reaper_interval_ms.max(10)),
            },
            throttle: ThrottleConfig {
                max_concurrent: self.throttle.max_concurrent,
                max_queued: self.throttle.max_queued,
                queue_timeout: (self.throttle.queue_timeout_ms > 0)
                    .then(|| Duration::from_millis(self.throttle.queue_timeout_ms)),
            },
            flush_interval: Duration::from_millis(self.store.flush_interval_ms.max(10)),
            checkpoint_interval: (self.store.checkpoint_interval_secs > 0)
                .then(|| Duration::from_secs(self.store.checkpoint_interval_secs)),
            ..StoreConfig::default()
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::storage::error::StoreError {
    fn from(err: ConfigError) -> Self {
        crate::storage::error::StoreError::Config(err.to_string())
    }
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsvault Configuration
#
# Environment variables override these settings:
# - TSVAULT_DATA_DIR
# - TSVAULT_MAX_CONCURRENT
# - TSVAULT_LOG_LEVEL
# - TSVAULT_LOG_FORMAT

[store]
# Directory holding containers, journal and index checkpoint
data_dir = "~/.local/share/tsvault"

# Expected number of keys (sizes the directory hash)
capacity = 1000000

# Upper bound on entries in one directory
max_entries_per_dir = 1000

# Subdirectories per directory level
dir_fan_out = 64

# Container file handles kept open
max_open_files = 256

# LZ4-compress record payloads
compress = true

# How often to sync the journal and flush allocation bitmaps (ms)
flush_interval_ms = 200

# How often to checkpoint the index (seconds, 0 = only on close)
checkpoint_interval_secs = 300

[journal]
# Sync mode: every_write, batched, none
sync_mode = "batched"

# Segment size before rotation (MB)
segment_size_mb = 16

# Batched mode syncs after this many bytes
batch_bytes = 65536

[transactions]
# Active transactions older than this are rolled back (seconds)
timeout_secs = 300

# On a locked key: wait (up to lock_wait_ms) or no_wait (fail fast)
lock_policy = "wait"
lock_wait_ms = 30000

# Timeout reaper period (ms)
reaper_interval_ms = 1000

[throttle]
# Requests running at once
max_concurrent = 64

# Requests waiting for a slot before new ones are rejected
max_queued = 256

# Give up waiting after this long (ms, 0 = wait forever)
queue_timeout_ms = 30000

[index]
# B-link tree node fan-out
fanout = 64

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.index.fanout, 64);
        assert_eq!(config.journal.sync_mode, JournalSyncMode::Batched);

        let store = config.store_config().unwrap();
        assert_eq!(store.txn.timeout, Duration::from_secs(300));
        assert_eq!(store.txn.lock_policy, LockPolicy::Wait(Duration::from_secs(30)));
        assert_eq!(store.journal.segment_size, 16 * 1024 * 1024);
        assert!(!store.data_dir.starts_with("~"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transactions]
            lock_policy = "no_wait"

            [throttle]
            queue_timeout_ms = 0
            "#,
        )
        .unwrap();
        let store = config.store_config().unwrap();
        assert_eq!(store.txn.lock_policy, LockPolicy::NoWait);
        assert_eq!(store.throttle.queue_timeout, None);
        assert_eq!(store.throttle.max_concurrent, 64);
        assert_eq!(store.index_fanout, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.store.dir_fan_out = 5000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.transactions.lock_policy = "sometimes".into();
        assert!(config.store_config().is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[store\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }
}
