//! shellcache core library.
//!
//! Offline support for a client-routed admin application:
//! - `worker`: versioned shell cache with install / activate / fetch routing
//! - `api`: authenticated request layer and reactive resources
//! - `storage`: token, preference and TTL cache store
//! - `state`: reducers for auth, notifications and theme

pub mod api;
pub mod clock;
pub mod config;
pub mod reporting;
pub mod state;
pub mod storage;
pub mod util;
pub mod worker;

pub use config::Config;
