//! Cacheability rules for requests and responses.

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode, header, request::Parts},
    response::Response,
};
use http_body::Body as _;

use super::headers::CacheHeaders;

/// Status codes whose responses may be stored and reused.
pub const CACHEABLE_STATUS_CODES: [StatusCode; 7] = [
    StatusCode::OK,
    StatusCode::NON_AUTHORITATIVE_INFORMATION,
    StatusCode::MULTIPLE_CHOICES,
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::NOT_FOUND,
    StatusCode::GONE,
];

/// The parts of a request the cache still needs after it has been forwarded.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub headers: HeaderMap,
    pub has_body: bool,
}

impl RequestHead {
    pub fn new(parts: &Parts, body: &Body) -> Self {
        Self {
            method: parts.method.clone(),
            headers: parts.headers.clone(),
            has_body: !body.is_end_stream(),
        }
    }

    fn is_upgrade(&self) -> bool {
        self.method == Method::CONNECT || self.headers.contains_key(header::UPGRADE)
    }
}

/// Requests with a body, an upgrade, a method other than GET/HEAD, or
/// credentials are never served from or written to the cache.
pub fn cacheable_request(request: &RequestHead) -> bool {
    if request.has_body || request.is_upgrade() {
        return false;
    }

    if request.method != Method::GET && request.method != Method::HEAD {
        return false;
    }

    !request.headers.contains_key(header::AUTHORIZATION)
        && !request.headers.contains_key(header::COOKIE)
}

pub fn cacheable_response_headers(headers: &HeaderMap) -> bool {
    if let Some(cc) = headers.cache_control()
        && (cc.no_store || cc.private)
    {
        return false;
    }

    !headers.contains_key(header::SET_COOKIE)
}

pub fn cacheable_response(response: &Response) -> bool {
    CACHEABLE_STATUS_CODES.contains(&response.status())
        && cacheable_response_headers(response.headers())
}

/// `Cache-Control` and `Set-Cookie` may arrive as trailers; when the response
/// declares any, they must pass the same header rules.
pub fn proceed_with_response_cache(headers: &HeaderMap, trailers: &HeaderMap) -> bool {
    if headers.declares_trailers() {
        return cacheable_response_headers(trailers);
    }
    true
}
