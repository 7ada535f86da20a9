//! # Outbound HTTP Transport Stack (C9)
//!
//! A composable chain of `tower::Layer`/`Service` wrappers around a
//! `reqwest`-backed base transport, applied outermost-first per §4.9:
//!
//! 1. OTel wait tracker — opens a `rate_limit_wait` span and records
//!    `wait_total_ms`.
//! 2. Deadline gate — fails fast with [`HttpTransportError::DeadlineTooClose`]
//!    when the caller's deadline is closer than the configured threshold.
//! 3. Server-hint limiter — per-host `Retry-After`/`RateLimit-Reset` throttle.
//! 4. Token bucket — local steady-rate limiter with burst capacity.
//! 5. 429 accounting — counts `429` responses, innermost, closest to the
//!    base transport.
//!
//! [`HttpTransport`] assembles the stack and exposes [`HttpTransport::send`]
//! as the single entry point a caller needs; the individual layers in
//! [`layers`] are public for callers who want to compose a custom stack
//! (e.g. to drop the token bucket for a trusted internal host).

pub mod config;
pub mod error;
pub mod headers;
pub mod host_state;
pub mod layers;
pub mod request;
pub mod token_bucket;
pub mod wait_tracker;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

pub use config::HttpTransportConfig;
pub use error::{HttpTransportError, HttpTransportResult};
pub use host_state::{HostState, HostStateMap};
pub use request::Request;
pub use token_bucket::TokenBucket;
pub use wait_tracker::WaitTracker;

use layers::{DeadlineLayer, OtelWaitTrackerLayer, ServerHintLimiterLayer, StatusAccountingLayer, TokenBucketLayer};

/// The base transport: dispatches the wrapped `reqwest::Request` on the
/// supplied `reqwest::Client`. Everything above this in the stack is rate
/// limiting, deadline enforcement, and observability — this service alone
/// owns the actual network I/O.
#[derive(Clone)]
struct BaseTransportService {
    client: reqwest::Client,
}

impl Service<Request> for BaseTransportService {
    type Response = reqwest::Response;
    type Error = HttpTransportError;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move { client.execute(req.inner).await.map_err(HttpTransportError::Transport) })
    }
}

type Stack = BoxCloneService<Request, reqwest::Response, HttpTransportError>;

/// Owns the per-client host-limit map and token bucket, and the assembled
/// middleware stack. Construct one per logical outbound HTTP client (the
/// teacher convention of one `reqwest::Client` per downstream dependency
/// carries over directly: `http.client_name` labels every metric this
/// instance emits). The stack is `Clone` (every layer only holds `Arc`s and
/// a cheap `reqwest::Client` handle), so concurrent calls to [`Self::send`]
/// never serialize on a shared lock.
pub struct HttpTransport {
    config: HttpTransportConfig,
    hosts: Arc<HostStateMap>,
    stack: Stack,
}

impl HttpTransport {
    /// Builds the five-layer stack over `client`, outermost-first per §4.9.
    pub fn new(config: HttpTransportConfig, client: reqwest::Client) -> Self {
        let hosts = HostStateMap::new();
        let bucket = Arc::new(TokenBucket::new(config.rate, config.burst, config.jitter));

        let base = BaseTransportService { client };
        let with_status = StatusAccountingLayer.layer(base);
        let with_bucket = TokenBucketLayer::new(bucket).layer(with_status);
        let with_server_hint = ServerHintLimiterLayer::new(hosts.clone(), config.header_jitter).layer(with_bucket);
        let with_deadline = DeadlineLayer::new(config.deadline_threshold).layer(with_server_hint);
        let with_wait_tracker = OtelWaitTrackerLayer.layer(with_deadline);

        Self {
            config,
            hosts,
            stack: BoxCloneService::new(with_wait_tracker),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.config.client_name
    }

    /// Sends `request` through the full middleware stack. `deadline`, if
    /// set, is the absolute instant by which the caller needs a response;
    /// the deadline gate and server-hint sleep both honor it.
    pub async fn send(
        &self,
        request: reqwest::Request,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<reqwest::Response, HttpTransportError> {
        let req = Request::new(self.config.client_name.clone(), request, deadline);
        let mut stack = self.stack.clone();
        stack.ready().await?.call(req).await
    }

    /// Stops the host-state sweeper. Idempotent; callers are required to
    /// invoke this on shutdown (the finalizer, if any, is a safety net only
    /// per §9 — correctness never depends on it. `HostStateMap` itself has
    /// no `Drop`-based cleanup, so a caller that skips `close` merely leaks
    /// the sweeper task until process exit, never a correctness bug).
    pub async fn close(&self) {
        self.hosts.close().await;
    }
}
