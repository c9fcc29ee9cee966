//! Cache storage.
//!
//! [`Store`] is the capability the middleware depends on. [`MemoryStore`] is
//! the bounded in-process index; [`VaryStore`] decorates any store with
//! `Vary`-based secondary keys.

use async_trait::async_trait;
use axum::{http::HeaderMap, response::Response};

use super::{config::CacheConfig, keys::CacheKey, response::CachedResponse};

mod memory;
mod vary;

pub use memory::{MemoryStore, StoreStats};
pub use vary::VaryStore;

/// The store used when none is configured explicitly.
pub type DefaultStore = VaryStore<MemoryStore>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Rewrites request headers to reduce key cardinality. Runs before key derivation.
    fn normalize(&self, _request: &mut HeaderMap) {}

    /// Returns a response for `key`: an independent copy of the stored entry,
    /// or `304 Not Modified` when the request's `If-None-Match` matches it.
    fn lookup(&self, key: &CacheKey, request: &HeaderMap) -> Option<Response>;

    /// Stores `response` under `key`, subject to the store's limits.
    fn insert(&self, key: CacheKey, request: &HeaderMap, response: CachedResponse);

    /// Releases background resources. Calling it again is a no-op.
    async fn close(&self);
}

/// `VaryStore<MemoryStore>` sized from `config`.
pub fn default_store(config: &CacheConfig) -> DefaultStore {
    VaryStore::new(MemoryStore::new(config))
}
