//! Offline cache worker for the application shell.
//!
//! This module provides:
//! - `CacheStorage`: named, whole-replacement cache generations on disk
//! - `route`: the per-request cache / network / redirect decision
//! - `CacheWorker`: the install / activate / fetch / message lifecycle
//!
//! Only one generation is current. Activation deletes every other one.

pub mod cache;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod response;
pub mod route;

pub use cache::{CacheGeneration, CacheStorage};
pub use error::WorkerError;
pub use lifecycle::{
    CacheWorker, ClientId, Clients, EventOutcome, WorkerEvent, WorkerMessage, WorkerState,
    DEFAULT_GENERATION, SHELL_MANIFEST,
};
pub use network::{HttpNetwork, Network};
pub use response::WorkerResponse;
pub use route::{cache_key, route, Destination, FetchRequest, RequestMode, Route, SHELL_PATH};
