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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "texcompiler_submissions_total",
            Unit::Count,
            "Submissions by result (accepted, terminal, in_flight)."
        );
        describe_counter!(
            "texcompiler_executions_total",
            Unit::Count,
            "Sandbox runs by outcome."
        );
        describe_histogram!(
            "texcompiler_execution_ms",
            Unit::Milliseconds,
            "Wall-clock duration of one compilation attempt in milliseconds."
        );
        describe_counter!(
            "texcompiler_retries_total",
            Unit::Count,
            "Attempts requeued after an infrastructure error or timeout."
        );
        describe_counter!(
            "texcompiler_leases_reaped_total",
            Unit::Count,
            "In-progress tasks recovered from expired leases."
        );
    });
}
