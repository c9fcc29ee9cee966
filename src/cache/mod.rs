//! Semantic HTTP response cache.
//!
//! An axum middleware that answers repeated requests from a local store and
//! stores responses according to their caching headers:
//!
//! - **Policy**: which requests and responses may be cached
//! - **Body wrapping**: tees streamed bodies into the store and adds an `etag`
//! - **Stores**: a bounded in-memory index, decorated with `Vary` keying
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `semcache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! limit = 1024
//! maximum_size = 65536
//! prune_interval_seconds = 60
//! ```

pub mod body;
mod config;
pub mod headers;
mod keys;
mod lock;
mod middleware;
pub mod policy;
mod response;
pub mod store;

pub use config::CacheConfig;
pub use headers::{CacheControl, CacheHeaders};
pub use keys::CacheKey;
pub use middleware::{CacheState, response_cache_layer};
pub use response::{CachedResponse, not_modified};
pub use store::{DefaultStore, MemoryStore, Store, StoreStats, VaryStore, default_store};
