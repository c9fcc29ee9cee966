//! semcache: a semantic HTTP response cache for axum.
//!
//! The [`cache`] module holds the middleware and its stores; [`infra`] and
//! [`config`] wire it into a caching reverse proxy.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod util;

/// Crate version, as reported by `semcache --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
