//! Binds subscriber topics to dispatch targets and runs one cooperative
//! worker task per binding, following the one-shot-guard/shutdown pattern
//! used for the single-worker outbox relay, generalized to N concurrent
//! workers that all report into a single completion signal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cqrs_bus::Subscriber;
use cqrs_envelope::Envelope;
use dlq::PoisonMiddleware;
use futures_util::StreamExt;
use observability::RouterMetrics;
use tokio::sync::{watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};

/// Object-safe dispatch target a [`crate::adapter::HandlerAdapter`]
/// implements. Kept separate from `Handler<T>` so [`Router`] can hold a
/// heterogeneous collection of bindings without being generic over every
/// message type it routes.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle_envelope(&self, envelope: Envelope) -> RouterResult<()>;
}

struct Binding {
    topic: String,
    handler: Arc<dyn EnvelopeHandler>,
    dlq: Option<Arc<PoisonMiddleware>>,
}

pub struct RouterBuilder {
    subscriber: Arc<dyn Subscriber>,
    bindings: Vec<Binding>,
}

impl RouterBuilder {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            bindings: Vec::new(),
        }
    }

    /// Binds `topic` to `handler`. When `dlq` is set, a handler failure is
    /// routed through it; the envelope is acked once the DLQ publish
    /// succeeds (or no `dlq` is bound), but if `dlq.poison()` itself cannot
    /// resolve the failure the router calls [`Subscriber::nack`] to request
    /// redelivery instead of silently dropping the envelope.
    pub fn bind(mut self, topic: impl Into<String>, handler: Arc<dyn EnvelopeHandler>, dlq: Option<Arc<PoisonMiddleware>>) -> Self {
        self.bindings.push(Binding {
            topic: topic.into(),
            handler,
            dlq,
        });
        self
    }

    pub fn build(self) -> Router {
        let (done_tx, done_rx) = watch::channel(false);
        Router {
            inner: Arc::new(Inner {
                subscriber: self.subscriber,
                bindings: self.bindings,
                shutdown: Notify::new(),
                shutdown_requested: AtomicBool::new(false),
                started: OnceCell::new(),
                remaining_workers: AtomicUsize::new(0),
                done_tx,
                done_rx,
                workers: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }
}

struct Inner {
    subscriber: Arc<dyn Subscriber>,
    bindings: Vec<Binding>,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
    started: OnceCell<()>,
    remaining_workers: AtomicUsize,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Routes inbound envelopes on each bound topic to its decorated handler.
/// `run`/`close` may be called concurrently; the worker set is started
/// exactly once via a one-shot guard.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub fn builder(subscriber: Arc<dyn Subscriber>) -> RouterBuilder {
        RouterBuilder::new(subscriber)
    }

    /// On the first call, spawns one worker per bound topic. Blocks until
    /// every worker has exited (i.e. until [`Router::close`] is called, or
    /// every subscriber stream ends on its own).
    pub async fn run(&self) -> RouterResult<()> {
        let inner = self.inner.clone();
        inner
            .started
            .get_or_init(|| async {
                inner.remaining_workers.store(inner.bindings.len(), Ordering::SeqCst);
                if inner.bindings.is_empty() {
                    let _ = inner.done_tx.send(true);
                    return;
                }
                let mut handles = Vec::with_capacity(inner.bindings.len());
                for index in 0..inner.bindings.len() {
                    let worker_inner = inner.clone();
                    handles.push(tokio::spawn(async move { worker_inner.worker_loop(index).await }));
                }
                *inner.workers.lock().await = handles;
            })
            .await;

        let mut done_rx = self.inner.done_rx.clone();
        let _ = done_rx.wait_for(|done| *done).await;
        Ok(())
    }

    /// Idempotent. Signals every worker to stop and waits up to `timeout`
    /// for all of them to drain. If the timeout elapses first, returns
    /// [`RouterError::CloseTimedOut`] but the workers keep running in the
    /// background to completion.
    pub async fn close(&self, timeout: Duration) -> RouterResult<()> {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();

        if self.inner.started.get().is_none() {
            return Ok(());
        }

        let mut done_rx = self.inner.done_rx.clone();
        match tokio::time::timeout(timeout, done_rx.wait_for(|done| *done)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RouterError::CloseTimedOut),
        }
    }
}

impl Inner {
    async fn worker_loop(self: Arc<Self>, binding_index: usize) {
        let binding = &self.bindings[binding_index];
        let topic = binding.topic.clone();

        if !self.shutdown_requested.load(Ordering::SeqCst) {
            match self.subscriber.subscribe(&topic).await {
                Ok(mut stream) => loop {
                    if self.shutdown_requested.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        item = stream.next() => {
                            match item {
                                Some(envelope) => self.handle_one(binding, envelope).await,
                                None => break,
                            }
                        }
                    }
                },
                Err(source) => {
                    warn!(topic = %topic, error = %source, "router failed to subscribe");
                }
            }
        }

        if self.remaining_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.done_tx.send(true);
        }
    }

    async fn handle_one(&self, binding: &Binding, envelope: Envelope) {
        let topic = &binding.topic;
        RouterMetrics::record_consumed(topic);
        let started_at = Instant::now();

        let result = binding.handler.handle_envelope(envelope.clone()).await;
        RouterMetrics::observe_consume_latency(topic, started_at.elapsed().as_secs_f64());

        if let Err(err) = result {
            let stage = failure_stage(&err);
            RouterMetrics::record_failed(topic, stage, &err.to_string());
            warn!(topic = %topic, stage, error = %err, "handler dispatch failed");

            if let Some(dlq) = &binding.dlq {
                match dlq.poison(topic, &envelope, err).await {
                    Ok(()) => {
                        debug!(topic = %topic, "poisoned message published to DLQ, acking original");
                    }
                    Err(unrecovered) => {
                        warn!(topic = %topic, error = %unrecovered, "DLQ did not resolve the failure, requesting redelivery");
                        self.subscriber.nack(&envelope).await;
                    }
                }
            } else {
                debug!(topic = %topic, "no DLQ bound for this topic, dropping failed envelope");
            }
        }
    }
}

fn failure_stage(err: &RouterError) -> &'static str {
    match err {
        RouterError::Envelope(_) => "envelope",
        RouterError::NotRegistered(_) => "registry",
        RouterError::TypeMismatch { .. } => "registry",
        RouterError::Recovered(_) => "panic",
        RouterError::CircuitOpen => "circuit_breaker",
        RouterError::RetryExhausted { .. } => "retry",
        RouterError::Handler(_) => "handler",
        RouterError::CloseTimedOut => "close",
    }
}
