//! Response cache middleware.
//!
//! Serves cacheable requests from a [`Store`] and tees cacheable upstream
//! responses into it once their bodies have been fully streamed.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, request::Parts},
    middleware::Next,
    response::Response,
};
use http_body::Body as _;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig,
    body::{self, Completed},
    headers::CacheHeaders,
    keys::CacheKey,
    policy::{RequestHead, cacheable_request, cacheable_response, proceed_with_response_cache},
    response::CachedResponse,
    store::{DefaultStore, Store, default_store},
};

const METRIC_MIDDLEWARE_HIT: &str = "semcache_middleware_hit_total";

/// Shared cache state for middleware.
pub struct CacheState<S = DefaultStore> {
    config: CacheConfig,
    store: Arc<S>,
    count: Arc<AtomicU64>,
}

impl<S> Clone for CacheState<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            count: Arc::clone(&self.count),
        }
    }
}

impl CacheState<DefaultStore> {
    /// State backed by the default `Vary`-aware memory store.
    pub fn from_config(config: CacheConfig) -> Self {
        let store = default_store(&config);
        Self::new(config, store)
    }
}

impl<S: Store> CacheState<S> {
    pub fn new(config: CacheConfig, store: S) -> Self {
        Self {
            config,
            store: Arc::new(store),
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of requests answered from the store.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Close the store, stopping its background work.
    pub async fn close(&self) {
        self.store.close().await;
    }

    /// Normalize the request headers through the store, then derive the key.
    pub fn key(&self, request: &mut Parts) -> CacheKey {
        self.store.normalize(&mut request.headers);
        CacheKey::for_request(request)
    }

    /// Arrange for `response` to be stored under `key` once its body completes.
    ///
    /// Responses that may not be stored are returned untouched.
    pub fn wrap(&self, key: CacheKey, request: RequestHead, response: Response) -> Response {
        if request.method == Method::HEAD && !response.body().is_end_stream() {
            warn!(cache = "middleware", key = %key, "HEAD request resulted in a non-empty body");
            return response;
        }

        if !cacheable_request(&request) || !cacheable_response(&response) {
            return response;
        }

        let store = Arc::clone(&self.store);
        body::wrap(response, move |completed| {
            update(store.as_ref(), key, &request, completed);
        })
    }
}

fn update<S: Store>(store: &S, key: CacheKey, request: &RequestHead, completed: Completed) {
    let Completed {
        parts,
        body,
        trailers,
    } = completed;

    if !proceed_with_response_cache(&parts.headers, &trailers) {
        debug!(cache = "middleware", key = %key, "Trailers forbid caching");
        return;
    }

    let cached = CachedResponse::new(&parts, body);
    debug!(
        cache = "middleware",
        key = %key,
        status = %cached.status(),
        shareable = cached.cacheable(),
        "Updating cache"
    );
    store.insert(key, &request.headers, cached);
}

/// Middleware for semantic response caching.
///
/// Requests carrying `Cache-Control: no-cache` skip the lookup; `no-store`
/// requests are forwarded without touching the store.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer<S: Store>(
    State(cache): State<CacheState<S>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enabled {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let key = cache.key(&mut parts);
    let directives = parts.headers.cache_control();

    if !directives.is_some_and(|cc| cc.no_cache) {
        if let Some(response) = cache.store.lookup(&key, &parts.headers) {
            cache.count.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_MIDDLEWARE_HIT).increment(1);
            debug!(cache = "middleware", outcome = "hit", key = %key, "Serving cached response");
            return response;
        }
        debug!(cache = "middleware", outcome = "miss", key = %key, "Forwarding request");
    }

    if directives.is_some_and(|cc| cc.no_store) {
        return next.run(Request::from_parts(parts, body)).await;
    }

    let head = RequestHead::new(&parts, &body);
    let response = next.run(Request::from_parts(parts, body)).await;
    cache.wrap(key, head, response)
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, StatusCode};
    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::*;

    fn state() -> CacheState {
        CacheState::from_config(CacheConfig::default())
    }

    fn request(method: Method, headers: &[(&'static str, &'static str)]) -> (Parts, Body) {
        let mut builder = Request::builder()
            .method(method)
            .uri("http://example.test/resource?page=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).expect("request should build").into_parts()
    }

    fn upstream(status: StatusCode, body: &'static str) -> Response {
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert("cache-control", HeaderValue::from_static("public, max-age=60"));
        response
    }

    #[tokio::test]
    async fn key_normalizes_before_derivation() {
        let state = state();
        let (mut parts, _) = request(Method::GET, &[("accept-encoding", "gzip, br")]);

        let key = state.key(&mut parts);

        assert_eq!(parts.headers.get("accept-encoding").unwrap(), "gzip");
        assert_eq!(key.authority(), "example.test");
        assert_eq!(key.path(), "/resource?page=1");
        state.close().await;
    }

    #[tokio::test]
    async fn wrapped_response_is_stored_after_streaming() {
        let state = state();
        let (mut parts, body) = request(Method::GET, &[]);
        let key = state.key(&mut parts);
        let head = RequestHead::new(&parts, &body);

        let response = state.wrap(key.clone(), head, upstream(StatusCode::OK, "Hello World"));
        assert!(state.store().lookup(&key, &parts.headers).is_none());

        let bytes = response.into_body().collect().await.expect("streams").to_bytes();
        assert_eq!(bytes, Bytes::from_static(b"Hello World"));

        let cached = state.store().lookup(&key, &parts.headers).expect("stored");
        assert_eq!(cached.headers().get("x-cache").unwrap(), "hit");
        assert!(cached.headers().get("etag").is_some());
        state.close().await;
    }

    #[tokio::test]
    async fn uncacheable_responses_are_returned_untouched() {
        let state = state();
        let (mut parts, body) = request(Method::GET, &[]);
        let key = state.key(&mut parts);
        let head = RequestHead::new(&parts, &body);

        let response = state.wrap(key.clone(), head, upstream(StatusCode::ACCEPTED, "later"));
        assert!(response.headers().get("trailer").is_none());
        response.into_body().collect().await.expect("streams");

        assert!(state.store().delegate().is_empty());
        state.close().await;
    }

    #[tokio::test]
    async fn head_with_body_is_not_stored() {
        let state = state();
        let (mut parts, body) = request(Method::HEAD, &[]);
        let key = state.key(&mut parts);
        let head = RequestHead::new(&parts, &body);

        let response = state.wrap(key, head, upstream(StatusCode::OK, "unexpected"));
        response.into_body().collect().await.expect("streams");

        assert!(state.store().delegate().is_empty());
        state.close().await;
    }

    #[tokio::test]
    async fn declared_trailers_can_forbid_caching() {
        let state = state();
        let (mut parts, body) = request(Method::GET, &[]);
        let key = state.key(&mut parts);
        let head = RequestHead::new(&parts, &body);

        let mut trailers = axum::http::HeaderMap::new();
        trailers.insert("cache-control", HeaderValue::from_static("no-store"));
        let stream = http_body_util::StreamBody::new(futures::stream::iter(vec![
            Ok::<_, std::convert::Infallible>(http_body::Frame::data(Bytes::from_static(b"data"))),
            Ok(http_body::Frame::trailers(trailers)),
        ]));
        let mut response = Response::new(Body::new(stream));
        response
            .headers_mut()
            .insert("trailer", HeaderValue::from_static("cache-control"));

        let response = state.wrap(key, head, response);
        response.into_body().collect().await.expect("streams");

        assert!(state.store().delegate().is_empty());
        state.close().await;
    }
}
