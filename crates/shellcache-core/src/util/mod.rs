//! Generic concurrency and caching primitives.

pub mod backoff;
pub mod lru;
pub mod queue;

pub use backoff::{exponential_delay, retry_with_backoff};
pub use lru::LruCache;
pub use queue::TaskQueue;
