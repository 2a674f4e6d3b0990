//! Raw string key-value backends.
//!
//! Backends only know about strings; serialization and namespacing live in
//! `LocalStore`. Both backends enforce the same quota so that a full store
//! behaves the same in tests and on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::warn;

use super::StorageError;

/// Storage quota in bytes of key + value text (5 MiB).
pub const QUOTA_BYTES: usize = 5 * 1024 * 1024;

pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    fn quota(&self) -> usize {
        QUOTA_BYTES
    }
}

fn entries_size(entries: &BTreeMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// Check that replacing `key` with `value` keeps `entries` within `quota`.
fn check_quota(
    entries: &BTreeMap<String, String>,
    key: &str,
    value: &str,
    quota: usize,
) -> Result<(), StorageError> {
    let current = entries_size(entries);
    let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
    let needed = key.len() + value.len();
    let after = current - existing + needed;
    if after > quota {
        return Err(StorageError::QuotaExceeded {
            needed,
            remaining: quota.saturating_sub(current - existing),
        });
    }
    Ok(())
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    available: bool,
    quota: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_quota(QUOTA_BYTES)
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            available: true,
            quota,
        }
    }

    /// A backend that refuses every operation, like storage in a locked-down
    /// private browsing session.
    pub fn unavailable() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            available: false,
            quota: 0,
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        if !self.available {
            return Err(StorageError::Unavailable);
        }
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries()?;
        check_quota(&entries, key, value, self.quota)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries()?.clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries()?.keys().cloned().collect())
    }

    fn quota(&self) -> usize {
        self.quota
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Persists the whole key space as one JSON object, rewritten on every
/// mutation through a temp file and rename.
///
/// Several handles (or processes) may share one file. Every mutation
/// re-reads the file before applying its change, and reads reload whenever
/// the file's modification stamp moved, so one handle never writes back a
/// stale copy over another handle's keys.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    entries: BTreeMap<String, String>,
    /// Modification time and length of the file when `entries` was read
    stamp: Option<(SystemTime, u64)>,
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

impl FileBackend {
    /// Open (or create) the store at `path`. A corrupt file is logged and
    /// replaced by an empty store on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let backend = Self {
            path,
            state: Mutex::new(FileState::default()),
        };
        backend.reload(&mut backend.lock())?;
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the cached entries with what is on disk now.
    fn reload(&self, state: &mut FileState) -> Result<(), StorageError> {
        let stamp = file_stamp(&self.path);
        state.entries = match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Storage file is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        state.stamp = stamp;
        Ok(())
    }

    /// Reload only if another writer touched the file since the last read.
    fn refresh(&self, state: &mut FileState) -> Result<(), StorageError> {
        if state.stamp.is_none() || file_stamp(&self.path) != state.stamp {
            self.reload(state)?;
        }
        Ok(())
    }

    fn persist(&self, state: &mut FileState) -> Result<(), StorageError> {
        let contents = serde_json::to_string_pretty(&state.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        state.stamp = file_stamp(&self.path);
        Ok(())
    }

    /// Read-modify-write against the current file contents. On a failed
    /// write the cache is reloaded so memory and disk agree.
    /// `change` returns whether it touched the entries.
    fn mutate(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> Result<bool, StorageError>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        self.reload(&mut state)?;
        if !change(&mut state.entries)? {
            return Ok(());
        }
        if let Err(e) = self.persist(&mut state) {
            let _ = self.reload(&mut state);
            return Err(e);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut state = self.lock();
        self.refresh(&mut state)?;
        Ok(state.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.mutate(|entries| {
            check_quota(entries, key, value, QUOTA_BYTES)?;
            entries.insert(key.to_string(), value.to_string());
            Ok(true)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.mutate(|entries| Ok(entries.remove(key).is_some()))
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.mutate(|entries| {
            entries.clear();
            Ok(true)
        })
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut state = self.lock();
        self.refresh(&mut state)?;
        Ok(state.entries.keys().cloned().collect())
    }
}
