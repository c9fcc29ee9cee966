use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Runs once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "semcache_store_hit_total",
            Unit::Count,
            "Total number of store lookups answered with a stored response."
        );
        describe_counter!(
            "semcache_store_miss_total",
            Unit::Count,
            "Total number of store lookups without a matching entry."
        );
        describe_counter!(
            "semcache_store_pruned_total",
            Unit::Count,
            "Total number of expired entries removed from the store."
        );
        describe_counter!(
            "semcache_store_rejected_total",
            Unit::Count,
            "Total number of inserts rejected by the entry limit or body size bound."
        );
        describe_gauge!(
            "semcache_store_entries",
            Unit::Count,
            "Current number of entries in the store index."
        );
        describe_counter!(
            "semcache_middleware_hit_total",
            Unit::Count,
            "Total number of requests answered by the cache middleware."
        );
    });
}
