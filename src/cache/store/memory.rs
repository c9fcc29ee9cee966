use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{http::HeaderMap, response::Response};
use metrics::{counter, gauge};
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use super::Store;
use crate::cache::{
    config::CacheConfig,
    headers::CacheHeaders,
    keys::CacheKey,
    lock::mutex_lock,
    response::{CachedResponse, not_modified},
};
use crate::util::bytes::format_bytes;

const SOURCE: &str = "cache::store::memory";

const METRIC_STORE_HIT: &str = "semcache_store_hit_total";
const METRIC_STORE_MISS: &str = "semcache_store_miss_total";
const METRIC_STORE_PRUNED: &str = "semcache_store_pruned_total";
const METRIC_STORE_REJECTED: &str = "semcache_store_rejected_total";
const METRIC_STORE_ENTRIES: &str = "semcache_store_entries";

/// Counter snapshot of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hit: u64,
    pub miss: u64,
    pub pruned: u64,
    pub entries: usize,
}

impl StoreStats {
    /// Hits per miss, as a percentage.
    pub fn ratio(&self) -> f64 {
        if self.miss == 0 {
            return 0.0;
        }
        100.0 * self.hit as f64 / self.miss as f64
    }
}

struct MemoryIndex {
    entries: Mutex<HashMap<CacheKey, CachedResponse>>,
    limit: usize,
    maximum_size: u64,
    hit: AtomicU64,
    miss: AtomicU64,
    pruned: AtomicU64,
}

impl MemoryIndex {
    fn prune(&self) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "prune");
        let initial = entries.len();
        entries.retain(|_, response| !response.is_expired());
        let remaining = entries.len();
        gauge!(METRIC_STORE_ENTRIES).set(remaining as f64);
        initial - remaining
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            hit: self.hit.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            entries: mutex_lock(&self.entries, SOURCE, "stats").len(),
        }
    }

    fn body_usage(&self) -> u64 {
        mutex_lock(&self.entries, SOURCE, "body_usage")
            .values()
            .filter_map(CachedResponse::body_length)
            .sum()
    }
}

struct Gardener {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Bounded in-memory store with lazy expiry on read and periodic pruning.
pub struct MemoryStore {
    index: Arc<MemoryIndex>,
    gardener: Mutex<Option<Gardener>>,
}

impl MemoryStore {
    /// Create a store and start its pruning task on the current Tokio runtime.
    ///
    /// Outside a runtime the store still works but expired entries are only
    /// removed when they are looked up or when [`MemoryStore::prune`] is called.
    pub fn new(config: &CacheConfig) -> Self {
        let index = Arc::new(MemoryIndex {
            entries: Mutex::new(HashMap::new()),
            limit: config.limit,
            maximum_size: config.maximum_size,
            hit: AtomicU64::new(0),
            miss: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        });

        let gardener = match Handle::try_current() {
            Ok(runtime) => {
                let (stop, stopped) = oneshot::channel();
                let handle = runtime.spawn(garden(
                    Arc::clone(&index),
                    config.prune_interval(),
                    stopped,
                ));
                Some(Gardener { stop, handle })
            }
            Err(_) => {
                warn!(
                    cache = "memory",
                    "No Tokio runtime available; background pruning disabled"
                );
                None
            }
        };

        Self {
            index,
            gardener: Mutex::new(gardener),
        }
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn prune(&self) -> usize {
        self.index.prune()
    }

    pub fn stats(&self) -> StoreStats {
        self.index.stats()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.index.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pruning(&self) -> bool {
        mutex_lock(&self.gardener, SOURCE, "is_pruning").is_some()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn lookup(&self, key: &CacheKey, request: &HeaderMap) -> Option<Response> {
        let mut entries = mutex_lock(&self.index.entries, SOURCE, "lookup");

        let Some(entry) = entries.get(key) else {
            self.index.miss.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_STORE_MISS).increment(1);
            return None;
        };

        if entry.is_expired() {
            entries.remove(key);
            gauge!(METRIC_STORE_ENTRIES).set(entries.len() as f64);
            drop(entries);
            self.index.pruned.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_STORE_PRUNED).increment(1);
            debug!(cache = "memory", key = %key, "Dropped expired entry on lookup");
            return None;
        }

        if let Some(etag) = entry.etag().and_then(|etag| etag.to_str().ok())
            && request.if_none_match().contains(&etag)
        {
            return Some(not_modified());
        }

        let copy = entry.duplicate();
        drop(entries);

        self.index.hit.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STORE_HIT).increment(1);
        Some(copy.into_response())
    }

    fn insert(&self, key: CacheKey, _request: &HeaderMap, response: CachedResponse) {
        let mut entries = mutex_lock(&self.index.entries, SOURCE, "insert");

        if entries.len() >= self.index.limit {
            drop(entries);
            counter!(METRIC_STORE_REJECTED, "reason" => "limit").increment(1);
            debug!(cache = "memory", key = %key, limit = self.index.limit, "Index full, entry rejected");
            return;
        }

        // Unknown lengths are admitted.
        if let Some(length) = response.body_length()
            && length > self.index.maximum_size
        {
            drop(entries);
            counter!(METRIC_STORE_REJECTED, "reason" => "size").increment(1);
            debug!(
                cache = "memory",
                key = %key,
                length,
                maximum_size = self.index.maximum_size,
                "Body too large, entry rejected"
            );
            return;
        }

        entries.insert(key, response);
        gauge!(METRIC_STORE_ENTRIES).set(entries.len() as f64);
    }

    async fn close(&self) {
        let gardener = mutex_lock(&self.gardener, SOURCE, "close").take();
        let Some(Gardener { stop, handle }) = gardener else {
            return;
        };

        let _ = stop.send(());
        if let Err(error) = handle.await
            && error.is_panic()
        {
            warn!(cache = "memory", error = %error, "Pruning task panicked");
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(gardener) = mutex_lock(&self.gardener, SOURCE, "drop").take() {
            gardener.handle.abort();
        }
    }
}

async fn garden(index: Arc<MemoryIndex>, interval: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip the first immediate tick

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let pruned = index.prune();
                index.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
                counter!(METRIC_STORE_PRUNED).increment(pruned as u64);
                log_statistics(&index, pruned);
            }
        }
    }

    debug!(cache = "memory", "Pruning task stopped");
}

fn log_statistics(index: &MemoryIndex, pruned: usize) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }

    let stats = index.stats();
    debug!(
        cache = "memory",
        pruned,
        hits = stats.hit,
        misses = stats.miss,
        total_pruned = stats.pruned,
        ratio = format!("{:.2}%", stats.ratio()),
        entries = stats.entries,
        memory = %format_bytes(index.body_usage()),
        "Pruned expired entries"
    );
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, Method, Response as HttpResponse, StatusCode};
    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            limit: 2,
            maximum_size: 8,
            prune_interval_secs: 2,
            ..Default::default()
        }
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::new("example.test", Method::GET, path)
    }

    fn cached(headers: &[(&'static str, &'static str)], body: Option<&'static [u8]>) -> CachedResponse {
        let mut builder = HttpResponse::builder().status(StatusCode::OK);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let parts = builder.body(()).expect("response should build").into_parts().0;
        CachedResponse::new(&parts, body.map(Bytes::from_static))
    }

    async fn body_of(response: Response) -> Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("body should collect")
            .to_bytes()
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let store = MemoryStore::new(&config());
        let request = HeaderMap::new();

        assert!(store.lookup(&key("/"), &request).is_none());
        store.insert(key("/"), &request, cached(&[], Some(b"hello")));

        let response = store.lookup(&key("/"), &request).expect("entry stored");
        assert_eq!(response.headers().get("x-cache").unwrap(), "hit");
        assert_eq!(body_of(response).await, Bytes::from_static(b"hello"));

        let stats = store.stats();
        assert_eq!((stats.hit, stats.miss, stats.entries), (1, 1, 1));
        store.close().await;
    }

    #[tokio::test]
    async fn insert_respects_limit_and_size() {
        let store = MemoryStore::new(&config());
        let request = HeaderMap::new();

        store.insert(key("/large"), &request, cached(&[], Some(b"123456789")));
        assert!(store.is_empty());

        store.insert(key("/exact"), &request, cached(&[], Some(b"12345678")));
        store.insert(key("/unknown"), &request, cached(&[], None));
        assert_eq!(store.len(), 2);

        store.insert(key("/third"), &request, cached(&[], Some(b"x")));
        assert_eq!(store.len(), 2);
        assert!(store.lookup(&key("/third"), &request).is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn insert_overwrites_existing_entry() {
        let store = MemoryStore::new(&CacheConfig::default());
        let request = HeaderMap::new();

        store.insert(key("/"), &request, cached(&[], Some(b"old")));
        store.insert(key("/"), &request, cached(&[], Some(b"new")));

        let response = store.lookup(&key("/"), &request).expect("entry stored");
        assert_eq!(body_of(response).await, Bytes::from_static(b"new"));
        store.close().await;
    }

    #[tokio::test]
    async fn if_none_match_returns_not_modified() {
        let store = MemoryStore::new(&config());
        store.insert(
            key("/"),
            &HeaderMap::new(),
            cached(&[("etag", "\"v1\"")], Some(b"body")),
        );

        let mut request = HeaderMap::new();
        request.insert("if-none-match", HeaderValue::from_static("\"v0\", \"v1\""));
        let response = store.lookup(&key("/"), &request).expect("conditional hit");
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(body_of(response).await.is_empty());

        // Entry untouched and hit counter unchanged.
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().hit, 0);

        request.insert("if-none-match", HeaderValue::from_static("\"v2\""));
        let response = store.lookup(&key("/"), &request).expect("plain hit");
        assert_eq!(response.status(), StatusCode::OK);
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_dropped_on_lookup() {
        let store = MemoryStore::new(&CacheConfig::default());
        let request = HeaderMap::new();
        store.insert(key("/"), &request, cached(&[("cache-control", "max-age=1")], Some(b"x")));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(store.lookup(&key("/"), &request).is_none());
        assert!(store.is_empty());
        assert_eq!(store.stats().pruned, 1);
        assert_eq!(store.stats().miss, 0);
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_only_expired_entries() {
        let store = MemoryStore::new(&CacheConfig::default());
        let request = HeaderMap::new();
        store.insert(key("/short"), &request, cached(&[("cache-control", "max-age=1")], None));
        store.insert(key("/long"), &request, cached(&[("cache-control", "max-age=60")], None));
        store.insert(key("/forever"), &request, cached(&[], None));

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.prune(), 1);
        assert_eq!(store.prune(), 0);
        assert_eq!(store.len(), 2);
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gardener_prunes_within_one_interval() {
        let store = MemoryStore::new(&config());
        let request = HeaderMap::new();
        store.insert(key("/"), &request, cached(&[("cache-control", "max-age=1")], None));

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(store.is_empty());
        assert_eq!(store.stats().pruned, 1);
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_pruning_and_is_idempotent() {
        let store = MemoryStore::new(&config());
        assert!(store.is_pruning());

        store.close().await;
        assert!(!store.is_pruning());
        store.close().await;

        let request = HeaderMap::new();
        store.insert(key("/"), &request, cached(&[("cache-control", "max-age=1")], None));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().pruned, 0);
    }

    #[test]
    fn works_without_a_runtime() {
        let store = MemoryStore::new(&config());
        assert!(!store.is_pruning());

        store.insert(key("/"), &HeaderMap::new(), cached(&[], Some(b"ok")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ratio_is_hits_per_miss() {
        let stats = StoreStats {
            hit: 10,
            miss: 4,
            ..Default::default()
        };
        assert_eq!(stats.ratio(), 250.0);
        assert_eq!(StoreStats::default().ratio(), 0.0);
    }
}
