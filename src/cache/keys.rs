//! Cache key definitions.
//!
//! A primary key identifies a resource by authority, method and path. `Vary`
//! extends it with the request header values a stored response depends on.

use std::fmt;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header, request::Parts};

/// Key of an entry in a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    authority: String,
    method: Method,
    path: String,
    variant: Vec<Vec<HeaderValue>>,
}

impl CacheKey {
    pub fn new(authority: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            method,
            path: path.into(),
            variant: Vec::new(),
        }
    }

    /// Primary key for a request: authority from the URI or `Host`, path including the query.
    pub fn for_request(parts: &Parts) -> Self {
        let authority = parts
            .uri
            .authority()
            .map(|authority| authority.as_str().to_owned())
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|host| host.to_str().ok())
                    .map(str::to_owned)
            })
            .unwrap_or_default();

        let path = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        Self::new(authority, parts.method.clone(), path)
    }

    /// Appends every value the request carries for each named header, in
    /// order; an absent header contributes an empty variant.
    pub fn extend(&self, names: &[HeaderName], headers: &HeaderMap) -> Self {
        let mut extended = self.clone();
        extended.variant.extend(
            names
                .iter()
                .map(|name| headers.get_all(name).iter().cloned().collect()),
        );
        extended
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.authority, self.method, self.path)?;
        for values in &self.variant {
            f.write_str("-")?;
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    f.write_str(", ")?;
                }
                f.write_str(value.to_str().unwrap_or_default())?;
            }
        }
        Ok(())
    }
}
