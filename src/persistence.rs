//! Persistence layer for relay-mesh.
//!
//! Provides the durable key/value substrate for:
//! - The last-connected relay snapshot and the user's relay list
//! - Relay performance metrics
//! - Per-tier blobs of `important` cache entries
//!
//! Every store enforces a byte quota and reports its usage, so quota
//! pressure is an explicit, testable condition: a write that would push
//! usage past the quota fails with [`Error::QuotaExceeded`] and leaves the
//! store unchanged.
//!
//! Snapshots are best-effort. [`load_json`] treats a missing or corrupt
//! record as absent and never fails startup.

use crate::error::{Error, Result};
use rocksdb::{Options, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Well-known storage keys.
pub mod keys {
    /// Connected relay URLs plus the time they were recorded.
    pub const LAST_CONNECTED: &str = "relay-mesh:last_connected";
    /// Relays the user added explicitly.
    pub const USER_RELAYS: &str = "relay-mesh:user_relays";
    /// Relay performance metrics.
    pub const PERFORMANCE: &str = "relay-mesh:performance";
    /// Important event cache entries.
    pub const EVENT_CACHE: &str = "relay-mesh:cache:events";
    /// Important profile cache entries.
    pub const PROFILE_CACHE: &str = "relay-mesh:cache:profiles";
    /// Important thread cache entries.
    pub const THREAD_CACHE: &str = "relay-mesh:cache:threads";
    /// Important feed cache entries.
    pub const FEED_CACHE: &str = "relay-mesh:cache:feeds";
    /// Important list cache entries.
    pub const LIST_CACHE: &str = "relay-mesh:cache:lists";
}

/// Default storage quota (50 MiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;

// =============================================================================
// Types
// =============================================================================

/// Configuration for the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Whether on-disk persistence is enabled. When disabled an in-memory
    /// store with the same quota is used.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directory holding the RocksDB database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Byte quota for everything the client persists.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_quota_bytes() -> u64 {
    DEFAULT_QUOTA_BYTES
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            data_dir: default_data_dir(),
            quota_bytes: default_quota_bytes(),
        }
    }
}

/// Storage usage relative to the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    /// Bytes currently used (keys plus values).
    pub used_bytes: u64,
    /// Total quota in bytes.
    pub quota_bytes: u64,
}

impl StorageUsage {
    /// Fraction of the quota in use (0.0 - 1.0+).
    pub fn ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.quota_bytes as f64
    }

    /// Bytes still available under the quota.
    pub fn available(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }
}

fn entry_size(key: &str, value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

// =============================================================================
// Store Trait
// =============================================================================

/// Trait for quota-aware key-value stores with string keys.
pub trait Store: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value by key. Fails with [`Error::QuotaExceeded`] when the
    /// write would push usage over the quota.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a value by key.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check if a key exists.
    fn contains(&self, key: &str) -> Result<bool>;

    /// Get all keys.
    fn keys(&self) -> Result<Vec<String>>;

    /// Current usage against the quota.
    fn usage(&self) -> StorageUsage;
}

/// Load and decode a JSON snapshot.
///
/// Missing, unreadable, or corrupt records yield `None`; corrupt records
/// are logged.
pub fn load_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Option<T> {
    let bytes = match store.get(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read snapshot {}: {}", key, e);
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring corrupt snapshot {}: {}", key, e);
            None
        }
    }
}

/// Encode a value as JSON and write it under `key`.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

/// Open the store described by the configuration.
pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn Store>> {
    if !config.enabled {
        info!("Persistence is disabled, using in-memory store");
        return Ok(Arc::new(MemoryStore::with_quota(config.quota_bytes)));
    }

    std::fs::create_dir_all(&config.data_dir).map_err(|e| {
        Error::Persistence(format!(
            "Failed to create data directory {}: {}",
            config.data_dir, e
        ))
    })?;

    let path = Path::new(&config.data_dir).join("relay-mesh");
    Ok(Arc::new(RocksStore::open(&path, "relay-mesh", config.quota_bytes)?))
}

// =============================================================================
// RocksDB Store Implementation
// =============================================================================

/// RocksDB-backed key-value store with quota accounting.
pub struct RocksStore {
    db: DB,
    name: String,
    quota_bytes: u64,
    used_bytes: AtomicU64,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, name: &str, quota_bytes: u64) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(256);
        opts.set_keep_log_file_num(3);
        opts.set_max_log_file_size(1024 * 1024); // 1MB

        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| Error::Persistence(format!("Failed to open RocksDB {}: {}", name, e)))?;

        let mut used = 0u64;
        for item in db.iterator(rocksdb::IteratorMode::Start) {
            match item {
                Ok((key, value)) => used += (key.len() + value.len()) as u64,
                Err(e) => {
                    warn!("RocksDB iteration error: {}", e);
                    break;
                }
            }
        }

        info!(
            "Opened RocksDB store: {} at {:?} ({} of {} bytes used)",
            name,
            path.as_ref(),
            used,
            quota_bytes
        );

        Ok(Self {
            db,
            name: name.to_string(),
            quota_bytes,
            used_bytes: AtomicU64::new(used),
            write_lock: Mutex::new(()),
        })
    }

    /// Get the store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn existing_size(&self, key: &str) -> Result<u64> {
        let existing = self
            .db
            .get_pinned(key.as_bytes())
            .map_err(|e| Error::Persistence(format!("RocksDB get error: {}", e)))?;
        Ok(existing.map(|v| entry_size(key, &v)).unwrap_or(0))
    }
}

impl Store for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| Error::Persistence(format!("RocksDB get error: {}", e)))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let old = self.existing_size(key)?;
        let new = entry_size(key, value);
        let base = self.used_bytes.load(Ordering::SeqCst).saturating_sub(old);
        if base + new > self.quota_bytes {
            return Err(Error::QuotaExceeded {
                needed: new,
                available: self.quota_bytes.saturating_sub(base),
            });
        }

        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| Error::Persistence(format!("RocksDB put error: {}", e)))?;
        self.used_bytes.store(base + new, Ordering::SeqCst);
        debug!("Persisted key: {} ({} bytes)", key, value.len());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let old = self.existing_size(key)?;
        self.db
            .delete(key.as_bytes())
            .map_err(|e| Error::Persistence(format!("RocksDB delete error: {}", e)))?;
        let used = self.used_bytes.load(Ordering::SeqCst);
        self.used_bytes.store(used.saturating_sub(old), Ordering::SeqCst);
        debug!("Deleted key: {}", key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        self.db
            .get_pinned(key.as_bytes())
            .map(|opt| opt.is_some())
            .map_err(|e| Error::Persistence(format!("RocksDB contains error: {}", e)))
    }

    fn keys(&self) -> Result<Vec<String>> {
        let iter = self.db.iterator(rocksdb::IteratorMode::Start);
        let mut keys = Vec::new();

        for item in iter {
            match item {
                Ok((key, _)) => {
                    if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                        keys.push(key_str);
                    }
                }
                Err(e) => {
                    warn!("RocksDB iteration error: {}", e);
                    break;
                }
            }
        }

        Ok(keys)
    }

    fn usage(&self) -> StorageUsage {
        StorageUsage {
            used_bytes: self.used_bytes.load(Ordering::SeqCst),
            quota_bytes: self.quota_bytes,
        }
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory store, used when persistence is disabled and in tests.
///
/// The quota can be changed at runtime to simulate storage pressure.
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
    quota_bytes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }
}

impl MemoryStore {
    /// Create a new in-memory store with the default quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store with an explicit quota.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            quota_bytes: AtomicU64::new(quota_bytes),
        }
    }

    /// Change the quota.
    pub fn set_quota(&self, quota_bytes: u64) {
        self.quota_bytes.store(quota_bytes, Ordering::SeqCst);
    }

    fn used(data: &HashMap<String, Vec<u8>>) -> u64 {
        data.iter().map(|(k, v)| entry_size(k, v)).sum()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self
            .data
            .read()
            .map_err(|_| Error::Persistence("Memory store lock poisoned (read)".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| Error::Persistence("Memory store lock poisoned (write)".to_string()))?;

        let quota = self.quota_bytes.load(Ordering::SeqCst);
        let old = guard.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let base = Self::used(&guard).saturating_sub(old);
        let new = entry_size(key, value);
        if base + new > quota {
            return Err(Error::QuotaExceeded {
                needed: new,
                available: quota.saturating_sub(base),
            });
        }

        guard.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self
            .data
            .write()
            .map_err(|_| Error::Persistence("Memory store lock poisoned (write)".to_string()))?;
        guard.remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        let guard = self
            .data
            .read()
            .map_err(|_| Error::Persistence("Memory store lock poisoned (read)".to_string()))?;
        Ok(guard.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        let guard = self
            .data
            .read()
            .map_err(|_| Error::Persistence("Memory store lock poisoned (read)".to_string()))?;
        Ok(guard.keys().cloned().collect())
    }

    fn usage(&self) -> StorageUsage {
        let used = self
            .data
            .read()
            .map(|guard| Self::used(&guard))
            .unwrap_or(0);
        StorageUsage {
            used_bytes: used,
            quota_bytes: self.quota_bytes.load(Ordering::SeqCst),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Snapshot {
        urls: Vec<String>,
        timestamp: u64,
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();

        store.put("key1", b"value1").unwrap();
        assert_eq!(store.get("key1").unwrap(), Some(b"value1".to_vec()));

        assert!(store.contains("key1").unwrap());
        assert!(!store.contains("nonexistent").unwrap());

        store.delete("key1").unwrap();
        assert!(!store.contains("key1").unwrap());
    }

    #[test]
    fn test_memory_store_enforces_quota() {
        let store = MemoryStore::with_quota(20);

        store.put("k", b"0123456789").unwrap();
        assert_eq!(store.usage().used_bytes, 11);

        let err = store.put("other", b"0123456789").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(!store.contains("other").unwrap());

        // Overwriting an existing key only counts the difference.
        store.put("k", b"0123456789abcdef").unwrap();
        assert_eq!(store.usage().used_bytes, 17);
    }

    #[test]
    fn test_usage_ratio() {
        let store = MemoryStore::with_quota(1000);
        store.put("filler", &vec![0u8; 694]).unwrap();

        let usage = store.usage();
        assert!((usage.ratio() - 0.7).abs() < 1e-9);
        assert_eq!(usage.available(), 300);

        store.set_quota(0);
        assert_eq!(store.usage().ratio(), 1.0);
    }

    #[test]
    fn test_rocks_store() {
        let tmp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(tmp_dir.path(), "test", DEFAULT_QUOTA_BYTES).unwrap();

        store.put("key1", b"value1").unwrap();
        assert_eq!(store.get("key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.usage().used_bytes, 10);

        assert!(store.contains("key1").unwrap());
        assert!(!store.contains("nonexistent").unwrap());

        store.delete("key1").unwrap();
        assert!(!store.contains("key1").unwrap());
        assert_eq!(store.usage().used_bytes, 0);
    }

    #[test]
    fn test_rocks_store_quota_and_reopen() {
        let tmp_dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(tmp_dir.path(), "test", 32).unwrap();
            store.put("a", b"0123456789").unwrap();
            assert!(store.put("b", &[0u8; 40]).unwrap_err().is_quota_exceeded());
        }

        let reopened = RocksStore::open(tmp_dir.path(), "test", 32).unwrap();
        assert_eq!(reopened.usage().used_bytes, 11);
        assert_eq!(reopened.keys().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_json_round_trip() {
        let store = MemoryStore::new();
        let snapshot = Snapshot {
            urls: vec!["wss://relay.damus.io".to_string()],
            timestamp: 42,
        };

        save_json(&store, keys::LAST_CONNECTED, &snapshot).unwrap();
        let loaded: Option<Snapshot> = load_json(&store, keys::LAST_CONNECTED);
        assert_eq!(loaded, Some(snapshot));
    }

    #[test]
    fn test_corrupt_snapshot_is_treated_as_missing() {
        let store = MemoryStore::new();
        store.put(keys::LAST_CONNECTED, b"{not json").unwrap();

        let loaded: Option<Snapshot> = load_json(&store, keys::LAST_CONNECTED);
        assert!(loaded.is_none());

        let missing: Option<Snapshot> = load_json(&store, "absent");
        assert!(missing.is_none());
    }

    #[test]
    fn test_open_store_disabled_uses_memory() {
        let config = PersistenceConfig {
            enabled: false,
            quota_bytes: 64,
            ..Default::default()
        };
        let store = open_store(&config).unwrap();
        assert_eq!(store.usage().quota_bytes, 64);
    }

    #[test]
    fn test_open_store_with_rocksdb() {
        let tmp_dir = TempDir::new().unwrap();
        let config = PersistenceConfig {
            enabled: true,
            data_dir: tmp_dir.path().to_string_lossy().to_string(),
            quota_bytes: 1024,
        };

        let store = open_store(&config).unwrap();
        store.put("key", b"value").unwrap();
        assert_eq!(store.get("key").unwrap(), Some(b"value".to_vec()));
    }
}
