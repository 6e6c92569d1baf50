use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::dispatcher::{METRIC_MUTATION_MS, METRIC_MUTATION_REJECTED, METRIC_RELAY};
use crate::cache::{METRIC_BUILD, METRIC_CACHE_EVICT, METRIC_CACHE_HIT, METRIC_CACHE_MISS};
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of cache lookups served by a populated slot."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of cache lookups that found no populated slot."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Total number of cache entries evicted, nested entries included."
        );
        describe_counter!(
            METRIC_BUILD,
            Unit::Count,
            "Total number of build function invocations."
        );
        describe_counter!(
            METRIC_RELAY,
            Unit::Count,
            "Total number of applied mutations relayed to peers."
        );
        describe_counter!(
            METRIC_MUTATION_REJECTED,
            Unit::Count,
            "Total number of mutations rejected for absent criteria."
        );
        describe_histogram!(
            METRIC_MUTATION_MS,
            Unit::Milliseconds,
            "Latency of applied mutations in milliseconds."
        );
    });
}
