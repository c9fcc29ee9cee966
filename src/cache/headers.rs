//! Header access used by the cache.
//!
//! Store, middleware and body code read headers only through [`CacheHeaders`],
//! so they never depend on how a particular header is spelled or split.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Parsed `Cache-Control` directives relevant to the cache.
///
/// Unknown directives are ignored and a malformed `max-age` is treated as absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
}

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Option<Self> {
        let mut values = headers.get_all(header::CACHE_CONTROL).iter().peekable();
        values.peek()?;

        let mut cc = Self::default();
        for value in values {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for directive in value.split(',') {
                cc.apply(directive.trim());
            }
        }
        Some(cc)
    }

    fn apply(&mut self, directive: &str) {
        let (name, argument) = match directive.split_once('=') {
            Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
            None => (directive, None),
        };

        if name.eq_ignore_ascii_case("public") {
            self.public = true;
        } else if name.eq_ignore_ascii_case("private") {
            self.private = true;
        } else if name.eq_ignore_ascii_case("no-cache") {
            self.no_cache = true;
        } else if name.eq_ignore_ascii_case("no-store") {
            self.no_store = true;
        } else if name.eq_ignore_ascii_case("max-age")
            && let Some(secs) = argument.and_then(|value| value.parse::<u64>().ok())
        {
            self.max_age = Some(Duration::from_secs(secs));
        }
    }
}

/// Cache-relevant view over a header collection.
pub trait CacheHeaders {
    fn cache_control(&self) -> Option<CacheControl>;

    fn etag(&self) -> Option<&HeaderValue>;

    /// Header names listed by `Vary`, lower-cased, in declaration order.
    fn vary(&self) -> Option<Vec<HeaderName>>;

    /// Whether `Trailer` announces any trailer fields.
    fn declares_trailers(&self) -> bool;

    /// Entity tags listed by `If-None-Match`.
    fn if_none_match(&self) -> Vec<&str>;
}

impl CacheHeaders for HeaderMap {
    fn cache_control(&self) -> Option<CacheControl> {
        CacheControl::parse(self)
    }

    fn etag(&self) -> Option<&HeaderValue> {
        self.get(header::ETAG)
    }

    fn vary(&self) -> Option<Vec<HeaderName>> {
        let mut values = self.get_all(header::VARY).iter().peekable();
        values.peek()?;

        Some(
            values
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
                .collect(),
        )
    }

    fn declares_trailers(&self) -> bool {
        self.get_all(header::TRAILER)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.split(',').any(|name| !name.trim().is_empty()))
    }

    fn if_none_match(&self) -> Vec<&str> {
        self.get_all(header::IF_NONE_MATCH)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}
