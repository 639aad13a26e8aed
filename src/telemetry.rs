//! Logging and OpenTelemetry tracing setup

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::{info, warn, Level, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::config::LogFormat;

const SERVICE_NAME: &str = "checkly-operator";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Build an OTLP tracing layer for the given subscriber
///
/// The endpoint is read from `OTEL_EXPORTER_OTLP_ENDPOINT`.
pub fn init_telemetry<S>(
    _subscriber: &S,
) -> Result<OpenTelemetryLayer<S, sdktrace::Tracer>, opentelemetry::trace::TraceError>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    global::set_text_map_propagator(TraceContextPropagator::new());

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Install the global subscriber: env filter, text or JSON output, and
/// OpenTelemetry export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
pub fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_err() {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        return;
    }

    match init_telemetry(&registry) {
        Ok(otel_layer) => {
            registry.with(otel_layer).init();
            info!("OpenTelemetry tracing initialized");
        }
        Err(e) => {
            registry.init();
            warn!("OpenTelemetry tracing disabled: {}", e);
        }
    }
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
