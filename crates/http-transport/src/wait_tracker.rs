use std::time::Duration;

use parking_lot::Mutex;

/// Accumulates per-source (`server`, `bucket`) wait durations for a single
/// request and forwards each one to the shared `rate_limit_wait_seconds`
/// histogram. `total()` feeds the OTel wait span's `wait_total_ms` field.
pub struct WaitTracker {
    client: String,
    host: String,
    method: String,
    total: Mutex<Duration>,
}

impl WaitTracker {
    pub fn new(client: impl Into<String>, host: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            host: host.into(),
            method: method.into(),
            total: Mutex::new(Duration::ZERO),
        }
    }

    pub fn record(&self, source: &str, duration: Duration) {
        *self.total.lock() += duration;
        observability::HttpTransportMetrics::observe_rate_limit_wait(
            &self.client,
            &self.host,
            &self.method,
            source,
            duration.as_secs_f64(),
        );
    }

    pub fn total(&self) -> Duration {
        *self.total.lock()
    }
}
