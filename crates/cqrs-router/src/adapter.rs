//! Turns a typed `Handler<T>` into an `(envelope) -> Result<(), RouterError>`
//! dispatch target, decorated outermost-first with Recover, CircuitBreaker,
//! Timeout, and Retry.
//!
//! CircuitBreaker gates the whole retry sequence as one call (so a tripped
//! circuit fails fast before the first attempt, never starting a retry
//! storm); Timeout bounds each individual attempt inside that sequence.
//! This mirrors the teacher's own `grpc::resilience::execute_with_retry`,
//! which checks the breaker once before looping over attempts.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use cqrs_envelope::{Envelope, Marshal};
use cqrs_registry::TypeRegistry;
use futures::FutureExt;
use parking_lot::Mutex as PMutex;
use resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use resilience::retry::{with_retry, RetryConfig, RetryError};
use resilience::timeout::{with_timeout_result, TimeoutConfig};
use serde::de::DeserializeOwned;

use crate::context::HandlerContext;
use crate::error::RouterError;
use crate::router::EnvelopeHandler;

/// A typed message handler. `Error` need only be `Display`-able: the router
/// collapses every decorator's failure into [`RouterError`], which carries
/// the stringified cause rather than the original type.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    type Error: std::fmt::Display + Send + Sync + 'static;

    async fn handle(&self, ctx: &HandlerContext, message: T) -> Result<(), Self::Error>;
}

/// Per-adapter decorator configuration. Each layer is optional; omitting it
/// makes that layer the identity, per §4.7.
#[derive(Clone)]
pub struct HandlerDecoratorConfig {
    pub recover_enabled: bool,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub retry: Option<RetryConfig>,
}

impl Default for HandlerDecoratorConfig {
    fn default() -> Self {
        Self {
            recover_enabled: true,
            circuit_breaker: None,
            timeout: None,
            retry: None,
        }
    }
}

/// Internal, non-`Display`-specialized failure shape produced by the
/// retry/timeout/circuit-breaker chain before it is translated into a
/// [`RouterError`] at the adapter boundary.
#[derive(Debug)]
enum AttemptError {
    Handler(String),
    CircuitOpen,
    RetryExhausted(u32),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Handler(msg) => write!(f, "{msg}"),
            AttemptError::CircuitOpen => write!(f, "circuit breaker is open"),
            AttemptError::RetryExhausted(n) => write!(f, "exceeded retry budget after {n} attempts"),
        }
    }
}

impl AttemptError {
    fn into_router_error(self, last_error: &PMutex<String>) -> RouterError {
        match self {
            AttemptError::Handler(msg) => RouterError::Handler(msg),
            AttemptError::CircuitOpen => RouterError::CircuitOpen,
            AttemptError::RetryExhausted(attempts) => RouterError::RetryExhausted {
                attempts,
                last_error: last_error.lock().clone(),
            },
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

async fn run_retry_timeout<T, H>(
    handler: Arc<H>,
    ctx: HandlerContext,
    message: T,
    retry_cfg: Option<RetryConfig>,
    timeout_cfg: Option<TimeoutConfig>,
    last_error: Arc<PMutex<String>>,
) -> Result<(), AttemptError>
where
    H: Handler<T> + 'static,
    T: Clone + Send + 'static,
{
    let attempt = {
        let handler = handler.clone();
        let ctx = ctx.clone();
        move || -> std::pin::Pin<Box<dyn Future<Output = Result<(), String>> + Send>> {
            let handler = handler.clone();
            let ctx = ctx.clone();
            let message = message.clone();
            let timeout_cfg = timeout_cfg.clone();
            let last_error = last_error.clone();
            Box::pin(async move {
                let result = match timeout_cfg {
                    Some(tc) => with_timeout_result(tc.duration, handler.handle(&ctx, message))
                        .await
                        .map_err(|e| e.to_string()),
                    None => handler.handle(&ctx, message).await.map_err(|e| e.to_string()),
                };
                if let Err(msg) = &result {
                    *last_error.lock() = msg.clone();
                }
                result
            })
        }
    };

    match retry_cfg {
        Some(rc) => with_retry(rc, attempt).await.map_err(|e| match e {
            RetryError::MaxRetriesExceeded(n) => AttemptError::RetryExhausted(n),
            RetryError::OperationFailed(msg) => AttemptError::Handler(msg),
        }),
        None => attempt().await.map_err(AttemptError::Handler),
    }
}

/// Adapts a typed [`Handler<T>`] into an [`EnvelopeHandler`]: resolves the
/// envelope's canonical name via the registry, instantiates and
/// type-asserts against it, unmarshals into `T`, then runs the decorator
/// chain around the handler invocation.
pub struct HandlerAdapter<T, M, H> {
    registry: Arc<TypeRegistry>,
    marshaler: M,
    handler: Arc<H>,
    decorators: HandlerDecoratorConfig,
    circuit_breaker: Option<CircuitBreaker>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, M, H> HandlerAdapter<T, M, H> {
    pub fn new(registry: Arc<TypeRegistry>, marshaler: M, handler: H, decorators: HandlerDecoratorConfig) -> Self {
        let circuit_breaker = decorators.circuit_breaker.clone().map(CircuitBreaker::new);
        Self {
            registry,
            marshaler,
            handler: Arc::new(handler),
            decorators,
            circuit_breaker,
            _marker: std::marker::PhantomData,
        }
    }

    async fn execute(&self, ctx: HandlerContext, message: T) -> Result<(), RouterError>
    where
        T: Clone + Send + 'static,
        H: Handler<T> + 'static,
    {
        let handler = self.handler.clone();
        let retry_cfg = self.decorators.retry.clone();
        let timeout_cfg = self.decorators.timeout.clone();
        let last_error = Arc::new(PMutex::new(String::new()));
        let circuit_breaker = self.circuit_breaker.clone();
        let recover_enabled = self.decorators.recover_enabled;

        let body = {
            let last_error = last_error.clone();
            async move {
                let guarded = run_retry_timeout(handler, ctx, message, retry_cfg, timeout_cfg, last_error.clone());

                if let Some(cb) = circuit_breaker {
                    cb.call(|| guarded).await.map_err(|e| match e {
                        CircuitBreakerError::Open => AttemptError::CircuitOpen,
                        CircuitBreakerError::CallFailed(msg) => AttemptError::Handler(msg),
                    })
                } else {
                    guarded.await
                }
            }
        };

        let outcome: Result<Result<(), AttemptError>, Box<dyn std::any::Any + Send>> = if recover_enabled {
            AssertUnwindSafe(body).catch_unwind().await
        } else {
            Ok(body.await)
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into_router_error(&last_error)),
            Err(panic) => Err(RouterError::Recovered(panic_message(panic.as_ref()))),
        }
    }
}

#[async_trait]
impl<T, M, H> EnvelopeHandler for HandlerAdapter<T, M, H>
where
    T: Default + DeserializeOwned + Clone + Send + Sync + 'static,
    M: Marshal<T> + Send + Sync,
    H: Handler<T> + Send + Sync + 'static,
{
    async fn handle_envelope(&self, envelope: Envelope) -> Result<(), RouterError> {
        let name = envelope
            .name_from_envelope()
            .ok_or(RouterError::Envelope(cqrs_envelope::EnvelopeError::MissingMetadata("type_name")))?;

        let factory = self
            .registry
            .resolve_by_name(&name)
            .map_err(|_| RouterError::NotRegistered(name.to_string()))?;

        let instance = factory();
        if instance.downcast::<T>().is_err() {
            return Err(RouterError::TypeMismatch { name: name.to_string() });
        }

        let message: T = self.marshaler.unmarshal(&envelope)?;
        let ctx = HandlerContext::from_envelope(&envelope);
        self.execute(ctx, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrs_envelope::{JsonMarshaler, Marshal, MarshalContext};
    use cqrs_naming::{CanonicalName, MessageKind, Nameable};
    use cqrs_registry::TypeRegistry;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
    struct Ping {
        id: String,
    }

    impl Nameable for Ping {
        fn type_name() -> &'static str {
            "Ping"
        }
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct OtherShape {
        unrelated_field: u32,
    }

    impl Nameable for OtherShape {
        fn type_name() -> &'static str {
            "Ping"
        }
    }

    fn envelope_for(value: &Ping) -> Envelope {
        let name = CanonicalName::new("cqrs-integration-test", "event", "ping", "v1").unwrap();
        let ctx = MarshalContext {
            name: &name,
            service_name: "cqrs-integration-test",
            kind: MessageKind::Event,
        };
        JsonMarshaler.marshal(value, ctx).unwrap()
    }

    struct CountingHandler {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler<Ping> for CountingHandler {
        type Error = String;

        async fn handle(&self, _ctx: &HandlerContext, _message: Ping) -> Result<(), String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(format!("transient failure #{call}"))
            } else {
                Ok(())
            }
        }
    }

    struct AlwaysFailHandler;

    #[async_trait]
    impl Handler<Ping> for AlwaysFailHandler {
        type Error = String;

        async fn handle(&self, _ctx: &HandlerContext, _message: Ping) -> Result<(), String> {
            Err("permanent failure".to_string())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl Handler<Ping> for PanickingHandler {
        type Error = String;

        async fn handle(&self, _ctx: &HandlerContext, _message: Ping) -> Result<(), String> {
            panic!("boom");
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl Handler<Ping> for SlowHandler {
        type Error = String;

        async fn handle(&self, _ctx: &HandlerContext, _message: Ping) -> Result<(), String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    fn registry_with_ping() -> Arc<TypeRegistry> {
        let registry = TypeRegistry::new();
        let namer = cqrs_naming::CanonicalNamer::new("cqrs-integration-test").unwrap();
        registry.register(MessageKind::Event, &namer, &Ping::default()).unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn dispatches_to_handler_with_no_decorators() {
        let registry = registry_with_ping();
        let handler = CountingHandler { fail_times: 0, calls: AtomicU32::new(0) };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, handler, HandlerDecoratorConfig::default());

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        adapter.handle_envelope(envelope).await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_name_fails_not_registered() {
        let registry = Arc::new(TypeRegistry::new());
        let handler = CountingHandler { fail_times: 0, calls: AtomicU32::new(0) };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, handler, HandlerDecoratorConfig::default());

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        let err = adapter.handle_envelope(envelope).await.unwrap_err();
        assert!(matches!(err, RouterError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn mismatched_registered_type_fails_type_mismatch() {
        let registry = TypeRegistry::new();
        let namer = cqrs_naming::CanonicalNamer::new("cqrs-integration-test").unwrap();
        registry.register(MessageKind::Event, &namer, &OtherShape::default()).unwrap();
        let registry = Arc::new(registry);

        let handler = CountingHandler { fail_times: 0, calls: AtomicU32::new(0) };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, handler, HandlerDecoratorConfig::default());

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        let err = adapter.handle_envelope(envelope).await.unwrap_err();
        assert!(matches!(err, RouterError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let registry = registry_with_ping();
        let handler = CountingHandler { fail_times: 2, calls: AtomicU32::new(0) };
        let decorators = HandlerDecoratorConfig {
            retry: Some(RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            }),
            ..Default::default()
        };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, handler, decorators);

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        adapter.handle_envelope(envelope).await.unwrap();
    }

    #[tokio::test]
    async fn retry_exhausted_reports_last_error() {
        let registry = registry_with_ping();
        let handler = AlwaysFailHandler;
        let decorators = HandlerDecoratorConfig {
            retry: Some(RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                jitter: false,
            }),
            ..Default::default()
        };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, handler, decorators);

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        let err = adapter.handle_envelope(envelope).await.unwrap_err();
        match err {
            RouterError::RetryExhausted { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "permanent failure");
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_before_invoking_handler() {
        let registry = registry_with_ping();
        let handler = AlwaysFailHandler;
        let decorators = HandlerDecoratorConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            }),
            ..Default::default()
        };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, handler, decorators);

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        let first = adapter.handle_envelope(envelope.clone()).await.unwrap_err();
        assert!(matches!(first, RouterError::Handler(_)));

        let second = adapter.handle_envelope(envelope).await.unwrap_err();
        assert!(matches!(second, RouterError::CircuitOpen));
    }

    #[tokio::test]
    async fn panic_is_recovered_into_router_error() {
        let registry = registry_with_ping();
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, PanickingHandler, HandlerDecoratorConfig::default());

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        let err = adapter.handle_envelope(envelope).await.unwrap_err();
        assert!(matches!(err, RouterError::Recovered(_)));
    }

    #[tokio::test]
    async fn timeout_bounds_a_single_attempt() {
        let registry = registry_with_ping();
        let decorators = HandlerDecoratorConfig {
            timeout: Some(TimeoutConfig { duration: Duration::from_millis(20) }),
            ..Default::default()
        };
        let adapter = HandlerAdapter::new(registry, JsonMarshaler, SlowHandler, decorators);

        let envelope = envelope_for(&Ping { id: "ping-1".into() });
        let err = adapter.handle_envelope(envelope).await.unwrap_err();
        match err {
            RouterError::Handler(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected Handler timeout error, got {other:?}"),
        }
    }
}
