//! Tower tracing middleware shared by the message bus and HTTP transport.
//!
//! gRPC session interceptors are explicitly out of scope (§1 Non-goals);
//! this module only carries the HTTP-side trace-context glue C9 and C4 both
//! need: extracting an inbound W3C trace context and opening a server span.

use opentelemetry::{global, propagation::Extractor, trace::SpanKind};
use std::task::{Context as TaskContext, Poll};
use tower::{Layer, Service};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// HTTP header extractor for W3C trace-context propagation, shared by any
/// hyper/tower-based transport.
pub struct HeaderExtractor<'a>(pub &'a hyper::HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Opens a server span for an inbound HTTP request, parented to the
/// extracted trace context.
pub fn http_tracing_layer() -> TracingLayer {
    TracingLayer
}

#[derive(Clone)]
pub struct TracingLayer;

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TracingService { inner: service }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S, B> Service<hyper::Request<B>> for TracingService<S>
where
    S: Service<hyper::Request<B>>,
    S::Error: std::fmt::Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: hyper::Request<B>) -> Self::Future {
        let parent_context =
            global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(req.headers())));

        let span = tracing::info_span!(
            "http_request",
            otel.kind = ?SpanKind::Server,
            http.method = %req.method(),
            http.target = %req.uri().path(),
        );
        span.set_parent(parent_context);
        let _enter = span.enter();

        self.inner.call(req)
    }
}
