//! Provides helper functions for initializing telemetry collection and publication.
use anyhow::Result;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Registry};

/// Initialize tracing.
///
/// When an OTLP endpoint is provided spans are exported to it in addition to
/// the stdout logger, otherwise only the stdout logger is installed.
pub async fn init_tracing(otlp_endpoint: Option<String>) -> Result<()> {
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if let Some(otlp_endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(opentelemetry_sdk::trace::config().with_resource(Resource::new(
                vec![opentelemetry::KeyValue::new("service.name", "gantry")],
            )))
            .install_batch(runtime::Tokio)?;

        // Default to INFO if no env is specified
        let otlp_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env()?;

        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter);
        let logger = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_filter(log_filter);

        let collector = Registry::default().with(telemetry).with(logger);
        tracing::subscriber::set_global_default(collector)?;
    } else {
        let logger = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_filter(log_filter);
        tracing_subscriber::registry().with(logger).init()
    }
    Ok(())
}

/// Flush any buffered spans before process exit.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
