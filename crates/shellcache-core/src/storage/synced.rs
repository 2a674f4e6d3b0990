//! A single stored value kept in step with every other writer of the store.

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use super::{LocalStore, StorageError, StorageEvent};

pub struct SyncedValue<T> {
    store: LocalStore,
    key: String,
    default: T,
    value: T,
    events: broadcast::Receiver<StorageEvent>,
}

impl<T> SyncedValue<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(store: &LocalStore, key: impl Into<String>, default: T) -> Self {
        let key = key.into();
        // Subscribe before reading so no write can slip between the two
        let events = store.subscribe();
        let value = store.get_item(&key).unwrap_or_else(|| default.clone());
        Self {
            store: store.clone(),
            key,
            default,
            value,
            events,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) -> Result<(), StorageError> {
        self.store.set_item(&self.key, &value)?;
        self.value = value;
        Ok(())
    }

    /// Apply `f` to the current value and store the result.
    pub fn update(&mut self, f: impl FnOnce(&T) -> T) -> Result<(), StorageError> {
        let next = f(&self.value);
        self.set(next)
    }

    pub fn remove(&mut self) -> Result<(), StorageError> {
        self.store.remove_item(&self.key)?;
        self.value = self.default.clone();
        Ok(())
    }

    /// Apply every pending change notification. Returns true if the value
    /// changed.
    pub fn sync(&mut self) -> bool {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(event) => changed |= self.apply(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "Missed storage events, rereading");
                    changed |= self.reload();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        changed
    }

    /// Wait for the next change that touches this key.
    pub async fn changed(&mut self) -> Option<&T> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if self.apply(&event) {
                        return Some(&self.value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.reload() {
                        return Some(&self.value);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn apply(&mut self, event: &StorageEvent) -> bool {
        let next = match &event.key {
            None => self.default.clone(),
            Some(key) if *key == self.key => match &event.new_value {
                None => self.default.clone(),
                Some(raw) => match serde_json::from_str(raw) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "Ignoring unparseable storage change");
                        return false;
                    }
                },
            },
            Some(_) => return false,
        };
        self.replace(next)
    }

    fn reload(&mut self) -> bool {
        let next = self
            .store
            .get_item(&self.key)
            .unwrap_or_else(|| self.default.clone());
        self.replace(next)
    }

    fn replace(&mut self, next: T) -> bool {
        // Compare serialized forms so T does not need PartialEq
        let same = serde_json::to_value(&next).ok() == serde_json::to_value(&self.value).ok();
        self.value = next;
        !same
    }
}
