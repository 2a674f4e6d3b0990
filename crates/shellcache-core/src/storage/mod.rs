//! Durable key-value storage for tokens, preferences and TTL-cached values.
//!
//! This module provides:
//! - `StorageBackend`: raw string storage (`MemoryBackend`, `FileBackend`)
//! - `LocalStore`: namespaced access with obfuscated secrets and lazy TTL
//!   expiry, plus change notification
//! - `SyncedValue`: one key kept current from those notifications

pub mod backend;
pub mod error;
pub mod obfuscate;
pub mod store;
pub mod synced;

pub use backend::{FileBackend, MemoryBackend, StorageBackend, QUOTA_BYTES};
pub use error::StorageError;
pub use obfuscate::{decrypt, encrypt};
pub use store::{LocalStore, StorageEvent, StorageUsage, DEFAULT_CACHE_TTL_MINUTES};
pub use synced::SyncedValue;
