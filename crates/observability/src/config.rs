//! Tracing configuration structures

use serde::{Deserialize, Serialize};

/// Configuration for distributed tracing. OTLP is the only supported
/// exporter; the core only ever receives an injected `TracerProvider`, so
/// exporter choice is a deployment concern rather than a core one (§1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub enabled: bool,

    /// OTLP collector endpoint, e.g. `http://otel-collector:4317`.
    pub otlp_endpoint: Option<String>,

    /// Sample rate (0.0 to 1.0).
    pub sample_rate: f64,

    pub service_version: String,
    pub environment: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: Some("http://localhost:4317".to_string()),
            sample_rate: 0.1,
            service_version: "dev".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl TracingConfig {
    /// Build configuration from environment variables.
    ///
    /// - `TRACING_ENABLED`, `OTLP_ENDPOINT`, `TRACING_SAMPLE_RATE`,
    ///   `SERVICE_VERSION`, `APP_ENV`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("TRACING_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);

        let otlp_endpoint = std::env::var("OTLP_ENDPOINT").ok();

        let sample_rate = std::env::var("TRACING_SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.1)
            .clamp(0.0, 1.0);

        let service_version = std::env::var("SERVICE_VERSION").unwrap_or_else(|_| "dev".to_string());
        let environment = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        Self {
            enabled,
            otlp_endpoint,
            sample_rate,
            service_version,
            environment,
        }
    }

    pub fn production(service_version: &str) -> Self {
        Self {
            enabled: true,
            otlp_endpoint: Some("http://otel-collector:4317".to_string()),
            sample_rate: 0.1,
            service_version: service_version.to_string(),
            environment: "production".to_string(),
        }
    }

    pub fn development() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: Some("http://localhost:4317".to_string()),
            sample_rate: 1.0,
            service_version: "dev".to_string(),
            environment: "development".to_string(),
        }
    }
}
