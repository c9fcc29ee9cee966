//! Stored responses.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, Version, header, response::Parts},
    response::Response,
};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::warn;

use super::headers::{CacheHeaders, X_CACHE};

/// A finalized response held by a store, together with its freshness metadata.
///
/// The header collection is a private copy of the upstream response headers
/// carrying an `x-cache: hit` marker; the live upstream response never sees it.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
    generated_at: Instant,
    max_age: Option<Duration>,
    etag: Option<HeaderValue>,
}

impl CachedResponse {
    pub fn new(parts: &Parts, body: Option<Bytes>) -> Self {
        let generated_at = Instant::now();

        let mut headers = parts.headers.clone();
        headers.insert(X_CACHE, HeaderValue::from_static("hit"));
        if headers.contains_key(header::ETAG) {
            retire_etag_trailer(&mut headers);
        }

        let max_age = headers.cache_control().and_then(|cc| cc.max_age);
        let etag = headers.etag().cloned();

        Self {
            version: parts.version,
            status: parts.status,
            headers,
            body,
            generated_at,
            max_age,
            etag,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Body length in bytes, `None` when there is no body to measure.
    pub fn body_length(&self) -> Option<u64> {
        self.body.as_ref().map(|body| body.len() as u64)
    }

    pub fn generated_at(&self) -> Instant {
        self.generated_at
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn etag(&self) -> Option<&HeaderValue> {
        self.etag.as_ref()
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.generated_at)
    }

    /// `None` when no `max-age` was given, otherwise whether the age exceeds it.
    pub fn expired(&self) -> Option<bool> {
        self.max_age.map(|max_age| self.age() > max_age)
    }

    /// Expiry as seen by store reads: an unknown lifetime never expires.
    pub fn is_expired(&self) -> bool {
        self.expired().unwrap_or(false)
    }

    /// Whether the stored headers allow serving this response to any client.
    pub fn cacheable(&self) -> bool {
        if let Some(cc) = self.headers.cache_control()
            && (cc.private || !cc.public)
        {
            return false;
        }

        if self.headers.contains_key(header::SET_COOKIE) {
            warn!(status = %self.status, "Cannot cache response with set-cookie header");
            return false;
        }

        true
    }

    /// An independent copy whose headers and body can be changed without
    /// touching the stored entry. `generated_at` is carried over.
    pub fn duplicate(&self) -> Self {
        Self {
            version: self.version,
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.as_deref().map(Bytes::copy_from_slice),
            generated_at: self.generated_at,
            max_age: self.max_age,
            etag: self.etag.clone(),
        }
    }

    pub fn into_response(self) -> Response {
        let body = match self.body {
            Some(bytes) => Body::from(bytes),
            None => Body::empty(),
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers;
        response
    }
}

/// A stored entry carries its `ETag` as a header, so `Trailer` must not
/// announce it again.
fn retire_etag_trailer(headers: &mut HeaderMap) {
    let remaining: Vec<String> = headers
        .get_all(header::TRAILER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case("etag"))
        .map(str::to_owned)
        .collect();

    headers.remove(header::TRAILER);
    if remaining.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.join(", ")) {
        headers.insert(header::TRAILER, value);
    }
}

/// Canonical `304 Not Modified` returned for a matching conditional request.
pub fn not_modified() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    response
}
