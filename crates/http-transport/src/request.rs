use std::sync::Arc;

use tokio::time::Instant;

use crate::wait_tracker::WaitTracker;

/// Request type carried through the transport stack: a `reqwest::Request`
/// plus the per-call bookkeeping (client name, optional deadline, and a
/// shared wait tracker) each layer reads or contributes to. Tower's
/// `Service<Request>` is generic over this wrapper rather than the bare
/// `reqwest::Request` so the stack never needs an ambient context object.
pub struct Request {
    pub client_name: String,
    pub deadline: Option<Instant>,
    pub inner: reqwest::Request,
    pub wait_tracker: Arc<WaitTracker>,
}

impl Request {
    pub fn new(client_name: impl Into<String>, inner: reqwest::Request, deadline: Option<Instant>) -> Self {
        let client_name = client_name.into();
        let host = inner.url().host_str().unwrap_or("unknown").to_string();
        let method = inner.method().to_string();
        let wait_tracker = Arc::new(WaitTracker::new(client_name.clone(), host, method));
        Self {
            client_name,
            deadline,
            inner,
            wait_tracker,
        }
    }

    pub fn host(&self) -> String {
        self.inner.url().host_str().unwrap_or("unknown").to_string()
    }

    pub fn method(&self) -> String {
        self.inner.method().to_string()
    }
}
