//! Namespaced key-value store on top of a `StorageBackend`.
//!
//! Keys are laid out as:
//! - plain keys for general values (`user_preferences`, `currentTheme`, ...)
//! - `secure_<name>` for obfuscated secrets (the auth token lives here)
//! - `cache_<name>` for values with an absolute expiry
//!
//! Reads never fail. A missing, corrupt or unreadable value is logged and
//! the caller gets `None` (or its default). Writes return a `Result` so the
//! caller can decide whether a failed write matters.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Duration;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::backend::{FileBackend, MemoryBackend, StorageBackend};
use super::obfuscate::{decrypt, encrypt};
use super::StorageError;
use crate::clock::{system_clock, SharedClock};

/// Prefix for obfuscated entries
const SECURE_PREFIX: &str = "secure_";

/// Prefix for entries with an expiry
const CACHE_PREFIX: &str = "cache_";

/// Secure-namespace name of the bearer token
const TOKEN_KEY: &str = "auth_token";

const USER_PREFERENCES_KEY: &str = "user_preferences";

/// Key written and removed by the availability probe
const PROBE_KEY: &str = "__localStorage_test__";

/// Default lifetime for TTL cache entries.
pub const DEFAULT_CACHE_TTL_MINUTES: i64 = 60;

/// Buffer for change notifications. Slow subscribers resync on lag.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change to the key space. `key` is `None` when the whole store was
/// cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TtlItem<T> {
    value: T,
    /// Absolute expiry, epoch milliseconds
    expiry: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
    pub used: usize,
    pub remaining: usize,
    pub percentage: f64,
}

/// Shared handle to the store. Clone is cheap; clones share the backend and
/// the change channel.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
    clock: SharedClock,
    events: broadcast::Sender<StorageEvent>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_clock(backend, system_clock())
    }

    pub fn with_clock(backend: Arc<dyn StorageBackend>, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            clock,
            events,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(FileBackend::open(path)?)))
    }

    /// Receive every subsequent change made through any clone of this store.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn publish(&self, key: Option<String>, old_value: Option<String>, new_value: Option<String>) {
        if key.is_some() && old_value == new_value {
            return;
        }
        // No subscribers is fine
        let _ = self.events.send(StorageEvent {
            key,
            old_value,
            new_value,
        });
    }

    // ===== Raw access =====

    /// Raw stored string, `None` if absent or unreadable.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Storage read failed");
                None
            }
        }
    }

    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old = self.get_raw(key);
        self.backend.set(key, value)?;
        self.publish(Some(key.to_string()), old, Some(value.to_string()));
        Ok(())
    }

    // ===== Basic operations =====

    pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(value)?;
        self.set_raw(key, &serialized)
    }

    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = key, error = %e, "Stored value could not be parsed");
                None
            }
        }
    }

    pub fn get_item_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_item(key).unwrap_or(default)
    }

    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let old = self.get_raw(key);
        self.backend.remove(key)?;
        self.publish(Some(key.to_string()), old, None);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.backend.clear()?;
        self.publish(None, None, None);
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.backend.keys().unwrap_or_else(|e| {
            warn!(error = %e, "Storage key listing failed");
            Vec::new()
        })
    }

    // ===== Secure namespace =====

    pub fn set_secure_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(value)?;
        self.set_raw(&format!("{}{}", SECURE_PREFIX, key), &encrypt(&serialized))
    }

    pub fn get_secure_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = format!("{}{}", SECURE_PREFIX, key);
        let encoded = self.get_raw(&full_key)?;
        let Some(decoded) = decrypt(&encoded) else {
            warn!(key = %full_key, "Secure value could not be decoded");
            return None;
        };
        match serde_json::from_str(&decoded) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %full_key, error = %e, "Secure value could not be parsed");
                None
            }
        }
    }

    pub fn remove_secure_item(&self, key: &str) -> Result<(), StorageError> {
        self.remove_item(&format!("{}{}", SECURE_PREFIX, key))
    }

    // ===== Token management =====

    pub fn set_token(&self, token: &str) -> Result<(), StorageError> {
        self.set_secure_item(TOKEN_KEY, token)
    }

    pub fn get_token(&self) -> Option<String> {
        self.get_secure_item(TOKEN_KEY)
    }

    pub fn remove_token(&self) -> Result<(), StorageError> {
        self.remove_secure_item(TOKEN_KEY)
    }

    // ===== User preferences =====

    pub fn set_user_preferences(&self, preferences: &Map<String, Value>) -> Result<(), StorageError> {
        self.set_item(USER_PREFERENCES_KEY, preferences)
    }

    pub fn get_user_preferences(&self) -> Map<String, Value> {
        self.get_item(USER_PREFERENCES_KEY).unwrap_or_default()
    }

    pub fn update_user_preference(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut preferences = self.get_user_preferences();
        preferences.insert(key.to_string(), value);
        self.set_user_preferences(&preferences)
    }

    // ===== TTL cache =====

    pub fn set_cache_item<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), StorageError> {
        let item = TtlItem {
            value,
            expiry: (self.clock.now() + ttl).timestamp_millis(),
        };
        self.set_item(&format!("{}{}", CACHE_PREFIX, key), &item)
    }

    /// Read a cached value. An expired entry is deleted and reads as absent.
    pub fn get_cache_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = format!("{}{}", CACHE_PREFIX, key);
        let item: TtlItem<Value> = self.get_item(&full_key)?;

        if self.clock.now().timestamp_millis() > item.expiry {
            debug!(key = %full_key, "Cache entry expired");
            if let Err(e) = self.remove_item(&full_key) {
                warn!(key = %full_key, error = %e, "Failed to remove expired cache entry");
            }
            return None;
        }

        match serde_json::from_value(item.value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    pub fn get_cache_item_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_cache_item(key).unwrap_or(default)
    }

    pub fn remove_cache_item(&self, key: &str) -> Result<(), StorageError> {
        self.remove_item(&format!("{}{}", CACHE_PREFIX, key))
    }

    /// Remove every expired `cache_` entry. Returns how many were removed.
    pub fn clean_expired_cache(&self) -> Result<usize, StorageError> {
        let now = self.clock.now().timestamp_millis();
        let mut removed = 0;

        for key in self.backend.keys()? {
            if !key.starts_with(CACHE_PREFIX) {
                continue;
            }
            let Some(item) = self.get_item::<TtlItem<Value>>(&key) else {
                continue;
            };
            if now > item.expiry {
                self.remove_item(&key)?;
                removed += 1;
            }
        }

        debug!(removed, "Expired cache sweep finished");
        Ok(removed)
    }

    // ===== Store-wide =====

    pub fn storage_usage(&self) -> StorageUsage {
        let quota = self.backend.quota();
        let used: usize = self
            .keys()
            .iter()
            .map(|k| k.len() + self.get_raw(k).map(|v| v.len()).unwrap_or(0))
            .sum();

        StorageUsage {
            used,
            remaining: quota.saturating_sub(used),
            percentage: if quota == 0 {
                100.0
            } else {
                used as f64 / quota as f64 * 100.0
            },
        }
    }

    /// Probe whether writes actually work.
    pub fn is_available(&self) -> bool {
        self.backend.set(PROBE_KEY, "test").is_ok() && self.backend.remove(PROBE_KEY).is_ok()
    }

    /// Snapshot the entire key space verbatim as a JSON object.
    pub fn backup(&self) -> Result<String, StorageError> {
        let mut snapshot = BTreeMap::new();
        for key in self.backend.keys()? {
            if let Some(value) = self.backend.get(&key)? {
                snapshot.insert(key, value);
            }
        }
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Replay a `backup` snapshot. Existing keys not in the snapshot are kept.
    pub fn restore(&self, snapshot: &str) -> Result<usize, StorageError> {
        let entries: BTreeMap<String, String> = serde_json::from_str(snapshot)?;
        for (key, value) in &entries {
            self.set_raw(key, value)?;
        }
        Ok(entries.len())
    }
}
