//! Observability glue (C10): trace initialization, W3C propagation, and the
//! canonical metric families shared by C4 through C9.
//!
//! A `MeterProvider`/`TracerProvider` is injected by the host application;
//! this crate only wires the OTLP exporter and the Prometheus registries it
//! is handed, per §1's Non-goal that metric backends are external.

use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod interceptors;
pub mod metrics;

pub use config::TracingConfig;
pub use interceptors::{http_tracing_layer, HeaderExtractor, TracingLayer};
pub use metrics::{BusMetrics, HttpTransportMetrics, RouterMetrics};

/// Initialize OpenTelemetry tracing for a service: sets the global W3C
/// trace-context propagator, builds an OTLP tracer, and installs a
/// `tracing_subscriber` registry combining an env filter, human-readable
/// formatting, and the OpenTelemetry bridge layer.
pub fn init_tracing(service_name: &str, config: TracingConfig) -> Result<Tracer, Box<dyn std::error::Error>> {
    if !config.enabled {
        tracing::info!("tracing is disabled");
        return Err("tracing disabled".into());
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let tracer = init_otlp_tracer(&config, resource)?;

    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .with(telemetry_layer)
        .init();

    tracing::info!(
        service = service_name,
        sample_rate = config.sample_rate,
        "opentelemetry tracing initialized"
    );

    Ok(tracer)
}

fn init_otlp_tracer(config: &TracingConfig, resource: Resource) -> Result<Tracer, Box<dyn std::error::Error>> {
    let endpoint = config
        .otlp_endpoint
        .clone()
        .unwrap_or_else(|| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_sampler(Sampler::TraceIdRatioBased(config.sample_rate))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .with_batch_config(
            BatchConfig::default()
                .with_max_queue_size(2048)
                .with_max_export_batch_size(512)
                .with_scheduled_delay(Duration::from_millis(5000)),
        )
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}

/// Flush and shut down the global tracer provider. Call before process exit.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
