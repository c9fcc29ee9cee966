//! Cache configuration.
//!
//! Bounds for the in-memory store and the pruning cadence, read from the
//! `[cache]` section of `semcache.toml`.

use std::time::Duration;

const DEFAULT_LIMIT: usize = 1024;
const DEFAULT_MAXIMUM_SIZE: u64 = 64 * 1024;
const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Serve and store responses through the cache layer.
    pub enabled: bool,
    /// Maximum number of entries in the store index.
    pub limit: usize,
    /// Maximum body length in bytes of a single stored entry.
    pub maximum_size: u64,
    /// Seconds between background pruning passes.
    pub prune_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: DEFAULT_LIMIT,
            maximum_size: DEFAULT_MAXIMUM_SIZE,
            prune_interval_secs: DEFAULT_PRUNE_INTERVAL_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            limit: settings.limit.get(),
            maximum_size: settings.maximum_size,
            prune_interval_secs: settings.prune_interval.as_secs(),
        }
    }
}

impl CacheConfig {
    /// Prune interval, clamped to at least one second.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.limit, 1024);
        assert_eq!(config.maximum_size, 65536);
        assert_eq!(config.prune_interval(), Duration::from_secs(60));
    }

    #[test]
    fn zero_interval_clamps_to_one_second() {
        let config = CacheConfig {
            prune_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.prune_interval(), Duration::from_secs(1));
    }
}
