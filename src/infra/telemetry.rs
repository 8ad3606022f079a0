use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

/// Register descriptions for every metric the crate emits. Safe to call more
/// than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "gateway_cache_hit_total",
            Unit::Count,
            "Total number of cache reads that found an entry."
        );
        describe_counter!(
            "gateway_cache_miss_total",
            Unit::Count,
            "Total number of cache reads that found nothing."
        );
        describe_counter!(
            "gateway_cache_unavailable_total",
            Unit::Count,
            "Total number of cache operations that failed or timed out."
        );
        describe_counter!(
            "gateway_cache_write_total",
            Unit::Count,
            "Total number of cache writes."
        );
        describe_counter!(
            "gateway_cache_flush_removed_total",
            Unit::Count,
            "Total number of entries removed by pattern flushes."
        );
        describe_counter!(
            "gateway_loader_batch_total",
            Unit::Count,
            "Total number of batched backend calls issued by loaders."
        );
        describe_histogram!(
            "gateway_loader_batch_size",
            Unit::Count,
            "Number of distinct keys per batched backend call."
        );
        describe_counter!(
            "gateway_loader_failure_total",
            Unit::Count,
            "Total number of batched backend calls that failed."
        );
    });
}
