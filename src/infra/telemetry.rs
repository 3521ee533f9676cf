use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "studio_cache_lookup_total",
            Unit::Count,
            "Cache lookups by outcome (hit, stale, miss)."
        );
        describe_counter!(
            "studio_cache_backend_error_total",
            Unit::Count,
            "KV backend failures absorbed by the cache, by operation."
        );
        describe_counter!(
            "studio_cache_lock_contention_total",
            Unit::Count,
            "Times a caller found the fill lock held and waited."
        );
        describe_counter!(
            "studio_cache_revalidate_total",
            Unit::Count,
            "Background revalidations by result (ok, error, skipped)."
        );
        describe_counter!(
            "studio_cache_invalidated_keys_total",
            Unit::Count,
            "Keys removed by pattern invalidation."
        );
        describe_gauge!(
            "studio_cache_revalidations_in_flight",
            Unit::Count,
            "Background revalidations currently running."
        );
        describe_histogram!(
            "studio_cache_produce_ms",
            Unit::Milliseconds,
            "Producer latency when filling a key, in milliseconds."
        );
    });
}
