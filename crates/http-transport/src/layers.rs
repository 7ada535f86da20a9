//! The five transport wrappers from §4.9, each a `tower::Layer`/`Service`
//! pair in the compositional style of `resilience::layer::CircuitBreakerLayer`.
//! Applied outermost-first in [`crate::HttpTransport::new`]: OTel wait
//! tracker, deadline gate, server-hint limiter, token bucket, 429 accounting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use observability::HttpTransportMetrics;
use rand::Rng;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::error::HttpTransportError;
use crate::headers::{parse_ratelimit_reset, parse_retry_after};
use crate::host_state::HostStateMap;
use crate::request::Request;
use crate::token_bucket::TokenBucket;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

fn boxed_poll_ready<S: Service<Request>>(inner: &mut S, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
    inner.poll_ready(cx)
}

// --- 1. OTel wait tracker (outermost) ---------------------------------

#[derive(Clone)]
pub struct OtelWaitTrackerLayer;

impl<S> Layer<S> for OtelWaitTrackerLayer {
    type Service = OtelWaitTrackerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OtelWaitTrackerService { inner }
    }
}

#[derive(Clone)]
pub struct OtelWaitTrackerService<S> {
    inner: S,
}

impl<S> Service<Request> for OtelWaitTrackerService<S>
where
    S: Service<Request, Response = reqwest::Response, Error = HttpTransportError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = reqwest::Response;
    type Error = HttpTransportError;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        boxed_poll_ready(&mut self.inner, cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let tracker = req.wait_tracker.clone();
        let span = tracing::info_span!(
            "rate_limit_wait",
            client = %req.client_name,
            host = %req.host(),
            method = %req.method(),
            wait_total_ms = tracing::field::Empty,
        );
        let span_for_record = span.clone();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let total_ms = tracker.total().as_secs_f64() * 1000.0;
                span_for_record.record("wait_total_ms", total_ms);
                result
            }
            .instrument(span),
        )
    }
}

// --- 2. Deadline gate ---------------------------------------------------

#[derive(Clone)]
pub struct DeadlineLayer {
    threshold: Duration,
}

impl DeadlineLayer {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            threshold: self.threshold,
        }
    }
}

#[derive(Clone)]
pub struct DeadlineService<S> {
    inner: S,
    threshold: Duration,
}

impl<S> Service<Request> for DeadlineService<S>
where
    S: Service<Request, Response = reqwest::Response, Error = HttpTransportError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = reqwest::Response;
    type Error = HttpTransportError;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        boxed_poll_ready(&mut self.inner, cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let threshold = self.threshold;
        if let Some(deadline) = req.deadline {
            if deadline.saturating_duration_since(tokio::time::Instant::now()) < threshold {
                let client = req.client_name.clone();
                let host = req.host();
                let method = req.method();
                HttpTransportMetrics::record_deadline_canceled(&client, &host, &method);
                return Box::pin(async move { Err(HttpTransportError::DeadlineTooClose) });
            }
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}

// --- 3. Server-hint limiter ---------------------------------------------

#[derive(Clone)]
pub struct ServerHintLimiterLayer {
    hosts: Arc<HostStateMap>,
    jitter: f64,
}

impl ServerHintLimiterLayer {
    pub fn new(hosts: Arc<HostStateMap>, jitter: f64) -> Self {
        Self {
            hosts,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }
}

impl<S> Layer<S> for ServerHintLimiterLayer {
    type Service = ServerHintLimiterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServerHintLimiterService {
            inner,
            hosts: self.hosts.clone(),
            jitter: self.jitter,
        }
    }
}

#[derive(Clone)]
pub struct ServerHintLimiterService<S> {
    inner: S,
    hosts: Arc<HostStateMap>,
    jitter: f64,
}

impl<S> Service<Request> for ServerHintLimiterService<S>
where
    S: Service<Request, Response = reqwest::Response, Error = HttpTransportError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = reqwest::Response;
    type Error = HttpTransportError;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        boxed_poll_ready(&mut self.inner, cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let hosts = self.hosts.clone();
        let jitter = self.jitter;
        let deadline = req.deadline;
        let tracker = req.wait_tracker.clone();

        Box::pin(async move {
            let host_state = hosts.get_or_create(&req.host());
            host_state.touch();

            let not_before = host_state.not_before();
            let now = tokio::time::Instant::now();
            if not_before > now {
                let wait = jittered_duration(not_before - now, jitter);
                let sleep = tokio::time::sleep(wait);
                match deadline {
                    Some(d) => {
                        if tokio::time::timeout_at(d, sleep).await.is_err() {
                            return Err(HttpTransportError::ContextCanceled);
                        }
                    }
                    None => sleep.await,
                }
                tracker.record("server", wait);
            }

            let result = inner.call(req).await;

            if let Ok(response) = &result {
                if let Some(candidate) = next_not_before(response, now) {
                    host_state.advance_not_before(candidate);
                }
            }

            result
        })
    }
}

fn jittered_duration(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

fn next_not_before(response: &reqwest::Response, now: tokio::time::Instant) -> Option<tokio::time::Instant> {
    let headers = response.headers();
    let retry_after = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let ratelimit_reset = headers
        .get("ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_ratelimit_reset);

    retry_after.into_iter().chain(ratelimit_reset).max().map(|d| now + d)
}

// --- 4. Token bucket -----------------------------------------------------

#[derive(Clone)]
pub struct TokenBucketLayer {
    bucket: Arc<TokenBucket>,
}

impl TokenBucketLayer {
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket }
    }
}

impl<S> Layer<S> for TokenBucketLayer {
    type Service = TokenBucketService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TokenBucketService {
            inner,
            bucket: self.bucket.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TokenBucketService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
}

impl<S> Service<Request> for TokenBucketService<S>
where
    S: Service<Request, Response = reqwest::Response, Error = HttpTransportError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = reqwest::Response;
    type Error = HttpTransportError;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        boxed_poll_ready(&mut self.inner, cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let bucket = self.bucket.clone();
        let tracker = req.wait_tracker.clone();
        let deadline = req.deadline;

        Box::pin(async move {
            // Races the bucket wait against the caller's deadline the same
            // way the server-hint limiter above it does: a request queued
            // behind the bucket must fail fast with `ContextCanceled` rather
            // than sleep past a deadline that already expired.
            let waited = match deadline {
                Some(d) => match tokio::time::timeout_at(d, bucket.wait()).await {
                    Ok(waited) => waited,
                    Err(_) => return Err(HttpTransportError::ContextCanceled),
                },
                None => bucket.wait().await,
            };
            if !waited.is_zero() {
                tracker.record("bucket", waited);
            }
            inner.call(req).await
        })
    }
}

// --- 5. 429 accounting (innermost, wraps the base transport) ------------

#[derive(Clone)]
pub struct StatusAccountingLayer;

impl<S> Layer<S> for StatusAccountingLayer {
    type Service = StatusAccountingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StatusAccountingService { inner }
    }
}

#[derive(Clone)]
pub struct StatusAccountingService<S> {
    inner: S,
}

impl<S> Service<Request> for StatusAccountingService<S>
where
    S: Service<Request, Response = reqwest::Response, Error = HttpTransportError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = reqwest::Response;
    type Error = HttpTransportError;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        boxed_poll_ready(&mut self.inner, cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let mut inner = self.inner.clone();
        let client = req.client_name.clone();
        let host = req.host();
        let method = req.method();

        Box::pin(async move {
            let result = inner.call(req).await;
            if let Ok(response) = &result {
                if response.status().as_u16() == 429 {
                    HttpTransportMetrics::record_429(&client, &host, &method);
                }
            }
            result
        })
    }
}
