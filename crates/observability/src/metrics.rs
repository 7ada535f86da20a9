//! Canonical metric families shared by C4 (bus), C7 (router), and C9 (HTTP
//! transport), per §6's label-set table. Feature-gated behind `metrics`
//! with no-op fallbacks when disabled, following `resilience::metrics`.

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

#[cfg(feature = "metrics")]
static MESSAGES_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "watermill_messages_published_total",
        "Total number of messages published to a topic",
        &["topic"]
    )
    .expect("failed to register watermill_messages_published_total")
});

#[cfg(feature = "metrics")]
static MESSAGES_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "watermill_messages_consumed_total",
        "Total number of messages consumed from a topic",
        &["topic"]
    )
    .expect("failed to register watermill_messages_consumed_total")
});

#[cfg(feature = "metrics")]
static MESSAGES_FAILED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "watermill_messages_failed_total",
        "Total number of consumed messages whose handler returned an error",
        &["topic", "stage", "error"]
    )
    .expect("failed to register watermill_messages_failed_total")
});

#[cfg(feature = "metrics")]
static PUBLISH_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "watermill_publish_latency_seconds",
        "Latency of a single publish call",
        &["topic"]
    )
    .expect("failed to register watermill_publish_latency_seconds")
});

#[cfg(feature = "metrics")]
static CONSUME_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "watermill_consume_latency_seconds",
        "Latency of a single handler invocation",
        &["topic"]
    )
    .expect("failed to register watermill_consume_latency_seconds")
});

#[cfg(feature = "metrics")]
static RATE_LIMIT_WAIT_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rate_limit_wait_seconds",
        "Time spent waiting on a rate limiter before a request is admitted",
        &["client", "host", "method", "source"]
    )
    .expect("failed to register rate_limit_wait_seconds")
});

#[cfg(feature = "metrics")]
static RATE_LIMIT_429_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rate_limit_429_total",
        "Total number of 429 responses observed by the server-hint limiter",
        &["client", "host", "method"]
    )
    .expect("failed to register rate_limit_429_total")
});

#[cfg(feature = "metrics")]
static DEADLINE_CANCELED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "deadline_canceled_total",
        "Total number of requests short-circuited because the deadline was too close",
        &["client", "host", "method"]
    )
    .expect("failed to register deadline_canceled_total")
});

#[cfg(feature = "metrics")]
pub struct BusMetrics;

#[cfg(feature = "metrics")]
impl BusMetrics {
    pub fn record_published(topic: &str) {
        MESSAGES_PUBLISHED_TOTAL.with_label_values(&[topic]).inc();
    }

    pub fn observe_publish_latency(topic: &str, seconds: f64) {
        PUBLISH_LATENCY_SECONDS.with_label_values(&[topic]).observe(seconds);
    }
}

#[cfg(not(feature = "metrics"))]
pub struct BusMetrics;

#[cfg(not(feature = "metrics"))]
impl BusMetrics {
    pub fn record_published(_topic: &str) {}
    pub fn observe_publish_latency(_topic: &str, _seconds: f64) {}
}

#[cfg(feature = "metrics")]
pub struct RouterMetrics;

#[cfg(feature = "metrics")]
impl RouterMetrics {
    pub fn record_consumed(topic: &str) {
        MESSAGES_CONSUMED_TOTAL.with_label_values(&[topic]).inc();
    }

    pub fn record_failed(topic: &str, stage: &str, error: &str) {
        MESSAGES_FAILED_TOTAL.with_label_values(&[topic, stage, error]).inc();
    }

    pub fn observe_consume_latency(topic: &str, seconds: f64) {
        CONSUME_LATENCY_SECONDS.with_label_values(&[topic]).observe(seconds);
    }
}

#[cfg(not(feature = "metrics"))]
pub struct RouterMetrics;

#[cfg(not(feature = "metrics"))]
impl RouterMetrics {
    pub fn record_consumed(_topic: &str) {}
    pub fn record_failed(_topic: &str, _stage: &str, _error: &str) {}
    pub fn observe_consume_latency(_topic: &str, _seconds: f64) {}
}

#[cfg(feature = "metrics")]
pub struct HttpTransportMetrics;

#[cfg(feature = "metrics")]
impl HttpTransportMetrics {
    pub fn observe_rate_limit_wait(client: &str, host: &str, method: &str, source: &str, seconds: f64) {
        RATE_LIMIT_WAIT_SECONDS
            .with_label_values(&[client, host, method, source])
            .observe(seconds);
    }

    pub fn record_429(client: &str, host: &str, method: &str) {
        RATE_LIMIT_429_TOTAL.with_label_values(&[client, host, method]).inc();
    }

    pub fn record_deadline_canceled(client: &str, host: &str, method: &str) {
        DEADLINE_CANCELED_TOTAL.with_label_values(&[client, host, method]).inc();
    }
}

#[cfg(not(feature = "metrics"))]
pub struct HttpTransportMetrics;

#[cfg(not(feature = "metrics"))]
impl HttpTransportMetrics {
    pub fn observe_rate_limit_wait(_client: &str, _host: &str, _method: &str, _source: &str, _seconds: f64) {}
    pub fn record_429(_client: &str, _host: &str, _method: &str) {}
    pub fn record_deadline_canceled(_client: &str, _host: &str, _method: &str) {}
}
