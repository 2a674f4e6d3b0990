//! Named cache generations persisted on disk.
//!
//! Each generation is one JSON document `<dir>/<name>.json` mapping cache
//! keys to stored responses. Generations are written whole (temp file then
//! rename) and never edited in place, so a generation file either holds a
//! complete population or does not exist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{WorkerError, WorkerResponse};
use crate::util::LruCache;

/// Number of parsed generations kept in memory.
const OPEN_GENERATIONS: usize = 4;

const GENERATION_EXT: &str = "json";

/// An immutable, fully populated generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheGeneration {
    pub name: String,
    pub entries: BTreeMap<String, WorkerResponse>,
}

impl CacheGeneration {
    pub fn get(&self, key: &str) -> Option<&WorkerResponse> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct CacheStorage {
    dir: PathBuf,
    opened: Mutex<LruCache<String, Arc<CacheGeneration>>>,
}

impl CacheStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, WorkerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            opened: Mutex::new(LruCache::new(OPEN_GENERATIONS)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn validate_name(name: &str) -> Result<(), WorkerError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !name.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(WorkerError::InvalidGeneration(name.to_string()))
        }
    }

    fn generation_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, GENERATION_EXT))
    }

    fn opened(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<CacheGeneration>>> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of every stored generation, sorted.
    pub fn keys(&self) -> Result<Vec<String>, WorkerError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(GENERATION_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn has(&self, name: &str) -> Result<bool, WorkerError> {
        Self::validate_name(name)?;
        Ok(self.generation_path(name).exists())
    }

    pub fn open(&self, name: &str) -> Result<Option<Arc<CacheGeneration>>, WorkerError> {
        Self::validate_name(name)?;
        if let Some(generation) = self.opened().get(&name.to_string()) {
            return Ok(Some(generation.clone()));
        }

        let path = self.generation_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let generation: Arc<CacheGeneration> = Arc::new(serde_json::from_str(&contents)?);
        self.opened().put(name.to_string(), generation.clone());
        Ok(Some(generation))
    }

    /// Store a complete generation, replacing any previous one of that name.
    pub fn put_generation(
        &self,
        name: &str,
        entries: BTreeMap<String, WorkerResponse>,
    ) -> Result<Arc<CacheGeneration>, WorkerError> {
        Self::validate_name(name)?;
        let generation = Arc::new(CacheGeneration {
            name: name.to_string(),
            entries,
        });

        let path = self.generation_path(name);
        let tmp = self.dir.join(format!("{}.{}.tmp", name, GENERATION_EXT));
        std::fs::write(&tmp, serde_json::to_vec(generation.as_ref())?)?;
        std::fs::rename(&tmp, &path)?;

        self.opened().put(name.to_string(), generation.clone());
        info!(generation = name, entries = generation.len(), "Cache generation stored");
        Ok(generation)
    }

    /// Delete a generation. Returns false if it did not exist.
    pub fn delete(&self, name: &str) -> Result<bool, WorkerError> {
        Self::validate_name(name)?;
        self.opened().remove(&name.to_string());
        let path = self.generation_path(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        debug!(generation = name, "Cache generation deleted");
        Ok(true)
    }

    /// Look up `key` in one generation.
    pub fn match_in(&self, name: &str, key: &str) -> Result<Option<WorkerResponse>, WorkerError> {
        Ok(self
            .open(name)?
            .and_then(|generation| generation.get(key).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(keys: &[&str]) -> BTreeMap<String, WorkerResponse> {
        keys.iter()
            .map(|k| (k.to_string(), WorkerResponse::new(200, format!("body of {}", k))))
            .collect()
    }

    #[test]
    fn test_put_open_match() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::new(dir.path()).unwrap();
        storage.put_generation("admin-panel-v1", entries(&["/", "/manifest.json"])).unwrap();

        assert!(storage.has("admin-panel-v1").unwrap());
        let hit = storage.match_in("admin-panel-v1", "/").unwrap().unwrap();
        assert_eq!(hit.body, b"body of /");
        assert_eq!(storage.match_in("admin-panel-v1", "/missing").unwrap(), None);
        assert_eq!(storage.match_in("admin-panel-v2", "/").unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        CacheStorage::new(dir.path())
            .unwrap()
            .put_generation("v1", entries(&["/"]))
            .unwrap();

        let storage = CacheStorage::new(dir.path()).unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["v1"]);
        assert_eq!(storage.open("v1").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::new(dir.path()).unwrap();
        storage.put_generation("v1", entries(&["/"])).unwrap();
        storage.put_generation("v2", entries(&["/"])).unwrap();

        assert!(storage.delete("v1").unwrap());
        assert!(!storage.delete("v1").unwrap());
        assert_eq!(storage.keys().unwrap(), vec!["v2"]);
        assert!(storage.open("v1").unwrap().is_none());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::new(dir.path()).unwrap();
        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(storage.has(bad), Err(WorkerError::InvalidGeneration(_))));
        }
    }
}
