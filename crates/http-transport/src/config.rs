use std::time::Duration;

/// `http.rate`, `http.burst`, `http.jitter`, `http.header_jitter`,
/// `http.deadline_threshold`, `http.client_name` from §6's configuration
/// table. `http.base_transport` is the injected `reqwest::Client` itself
/// rather than a config field.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub client_name: String,
    pub rate: f64,
    pub burst: f64,
    pub jitter: f64,
    pub header_jitter: f64,
    pub deadline_threshold: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            client_name: "default".to_string(),
            rate: 10.0,
            burst: 10.0,
            jitter: 0.1,
            header_jitter: 0.1,
            deadline_threshold: Duration::from_millis(100),
        }
    }
}
