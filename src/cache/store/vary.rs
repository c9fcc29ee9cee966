use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};

use super::Store;
use crate::cache::{
    headers::CacheHeaders,
    keys::CacheKey,
    lock::{rw_read, rw_write},
    response::CachedResponse,
};

const SOURCE: &str = "cache::store::vary";

/// Adds `Vary` secondary keying on top of another store.
///
/// The most recent `Vary` list seen for a primary key is remembered and used
/// to extend that key on every later lookup and insert.
pub struct VaryStore<S> {
    delegate: S,
    vary: RwLock<HashMap<CacheKey, Vec<HeaderName>>>,
}

impl<S: Store> VaryStore<S> {
    pub fn new(delegate: S) -> Self {
        Self {
            delegate,
            vary: RwLock::new(HashMap::new()),
        }
    }

    pub fn delegate(&self) -> &S {
        &self.delegate
    }

    /// Recorded `Vary` header names for a primary key.
    pub fn vary_for(&self, key: &CacheKey) -> Option<Vec<HeaderName>> {
        rw_read(&self.vary, SOURCE, "vary_for").get(key).cloned()
    }
}

#[async_trait]
impl<S: Store> Store for VaryStore<S> {
    fn normalize(&self, request: &mut HeaderMap) {
        let Some(accepts_gzip) = accepts_gzip(request) else {
            return;
        };

        if accepts_gzip {
            request.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        } else {
            request.remove(header::ACCEPT_ENCODING);
        }
    }

    fn lookup(&self, key: &CacheKey, request: &HeaderMap) -> Option<Response> {
        match self.vary_for(key) {
            Some(names) => self.delegate.lookup(&key.extend(&names, request), request),
            None => self.delegate.lookup(key, request),
        }
    }

    fn insert(&self, key: CacheKey, request: &HeaderMap, response: CachedResponse) {
        let key = match response.headers().vary() {
            Some(mut names) => {
                names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                let extended = key.extend(&names, request);
                rw_write(&self.vary, SOURCE, "insert").insert(key, names);
                extended
            }
            None => key,
        };

        self.delegate.insert(key, request, response);
    }

    async fn close(&self) {
        self.delegate.close().await;
    }
}

/// `None` without an `Accept-Encoding` header, otherwise whether it lists gzip.
fn accepts_gzip(request: &HeaderMap) -> Option<bool> {
    let mut values = request
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .peekable();
    values.peek()?;

    Some(
        values
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|coding| coding.split(';').next())
            .any(|coding| coding.trim().eq_ignore_ascii_case("gzip")),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, Response as HttpResponse, StatusCode};
    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::*;
    use crate::cache::{config::CacheConfig, store::MemoryStore};

    fn store() -> VaryStore<MemoryStore> {
        VaryStore::new(MemoryStore::new(&CacheConfig::default()))
    }

    fn primary() -> CacheKey {
        CacheKey::new("example.test", Method::GET, "/")
    }

    fn request(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        headers
    }

    fn cached(vary: Option<&'static str>, body: &'static str) -> CachedResponse {
        let mut builder = HttpResponse::builder()
            .status(StatusCode::OK)
            .header("cache-control", "max-age=60, public");
        if let Some(vary) = vary {
            builder = builder.header("vary", vary);
        }
        let parts = builder.body(()).expect("response should build").into_parts().0;
        CachedResponse::new(&parts, Some(Bytes::from_static(body.as_bytes())))
    }

    async fn body_of(response: Response) -> Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("body should collect")
            .to_bytes()
    }

    #[test]
    fn normalize_collapses_accept_encoding() {
        let store = store();

        let mut gzip = request(&[("accept-encoding", "br, gzip;q=0.8, deflate")]);
        store.normalize(&mut gzip);
        assert_eq!(gzip.get("accept-encoding").unwrap(), "gzip");

        let mut other = request(&[("accept-encoding", "br, deflate")]);
        store.normalize(&mut other);
        assert!(other.get("accept-encoding").is_none());

        let mut absent = request(&[("user-agent", "test")]);
        store.normalize(&mut absent);
        assert_eq!(absent.len(), 1);
    }

    #[tokio::test]
    async fn variants_are_stored_separately() {
        let store = store();
        let a = request(&[("user-agent", "test-a")]);
        let b = request(&[("user-agent", "test-b")]);

        store.insert(primary(), &a, cached(Some("user-agent"), "test-a"));
        store.insert(primary(), &b, cached(Some("user-agent"), "test-b"));
        assert_eq!(store.delegate().len(), 2);

        let response = store.lookup(&primary(), &a).expect("variant a");
        assert_eq!(body_of(response).await, Bytes::from_static(b"test-a"));
        let response = store.lookup(&primary(), &b).expect("variant b");
        assert_eq!(body_of(response).await, Bytes::from_static(b"test-b"));

        let unknown = request(&[("user-agent", "test-c")]);
        assert!(store.lookup(&primary(), &unknown).is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn vary_order_does_not_split_variants() {
        let store = store();
        let headers = request(&[("user-agent", "ua"), ("accept-language", "en")]);

        store.insert(primary(), &headers, cached(Some("user-agent, accept-language"), "one"));
        store.insert(primary(), &headers, cached(Some("accept-language, user-agent"), "two"));

        assert_eq!(store.delegate().len(), 1);
        assert_eq!(
            store.vary_for(&primary()).unwrap(),
            vec![
                HeaderName::from_static("accept-language"),
                HeaderName::from_static("user-agent"),
            ]
        );
        let response = store.lookup(&primary(), &headers).expect("variant");
        assert_eq!(body_of(response).await, Bytes::from_static(b"two"));
        store.close().await;
    }

    #[tokio::test]
    async fn later_header_values_select_the_variant() {
        let store = store();
        let french = request(&[("accept-language", "en"), ("accept-language", "fr")]);
        let german = request(&[("accept-language", "en"), ("accept-language", "de")]);

        store.insert(primary(), &french, cached(Some("accept-language"), "french"));
        assert!(store.lookup(&primary(), &german).is_none());

        store.insert(primary(), &german, cached(Some("accept-language"), "german"));
        assert_eq!(store.delegate().len(), 2);

        let response = store.lookup(&primary(), &german).expect("german variant");
        assert_eq!(body_of(response).await, Bytes::from_static(b"german"));
        let response = store.lookup(&primary(), &french).expect("french variant");
        assert_eq!(body_of(response).await, Bytes::from_static(b"french"));
        store.close().await;
    }

    #[tokio::test]
    async fn missing_header_is_its_own_variant() {
        let store = store();
        let without = HeaderMap::new();
        let with = request(&[("user-agent", "ua")]);

        store.insert(primary(), &without, cached(Some("user-agent"), "anonymous"));

        let response = store.lookup(&primary(), &without).expect("placeholder variant");
        assert_eq!(body_of(response).await, Bytes::from_static(b"anonymous"));
        assert!(store.lookup(&primary(), &with).is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn responses_without_vary_use_the_primary_key() {
        let store = store();
        let headers = request(&[("user-agent", "ua")]);

        store.insert(primary(), &headers, cached(None, "plain"));

        assert!(store.vary_for(&primary()).is_none());
        assert!(store.lookup(&primary(), &HeaderMap::new()).is_some());
        store.close().await;
    }
}
