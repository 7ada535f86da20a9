//! # Outbox Forwarder (C6)
//!
//! Long-running relay that moves committed rows out of the transactional
//! outbox store (`transactional-outbox`) onto the real transport, exposed
//! as an ordinary `cqrs_bus::Publisher`. The forwarder itself is transport-
//! agnostic: it is handed a [`cqrs_bus::Subscriber`] over the outbox's
//! staging topic and a real `Publisher` to re-publish to, per §1's non-goal
//! that concrete broker drivers stay out of this core.
//!
//! [`PollingOutboxSubscriber`] is the concrete `Subscriber` shipped here: it
//! adapts `OutboxStore::poll_committed` into the stream shape the forwarder
//! expects, stamping each envelope's intended re-publish topic into a
//! reserved metadata key (a real Kafka/SQS-backed `Subscriber` would instead
//! carry it in the broker message's own headers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cqrs_bus::{Publisher, Subscriber};
use cqrs_envelope::Envelope;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use transactional_outbox::OutboxStore;

mod error;
pub mod metrics;

pub use error::{ForwarderError, ForwarderResult};
pub use metrics::ForwarderMetrics;

/// Reserved metadata key carrying a polled row's real target topic, since
/// [`cqrs_envelope::Envelope`] has no topic field of its own — topic is a
/// `Publisher::publish` argument, not part of the wire envelope.
pub const TARGET_TOPIC_KEY: &str = "_outbox_target_topic";

/// Adapts an [`OutboxStore`] into a `Subscriber` by polling
/// `poll_committed` on a fixed interval. `subscribe`'s `topic` argument is
/// accepted for trait-shape parity with a real broker `Subscriber` but is
/// otherwise unused: a SQL outbox table has no independent notion of topic,
/// all committed rows across all their target topics are multiplexed onto
/// the single polling stream.
pub struct PollingOutboxSubscriber<S: OutboxStore> {
    store: Arc<S>,
    poll_interval: Duration,
    batch_size: i64,
    /// Rows older than this, or with at least this many failed forward
    /// attempts, are discarded rather than polled forever.
    max_age: Duration,
    max_retries: i32,
    metrics: ForwarderMetrics,
}

impl<S: OutboxStore + 'static> PollingOutboxSubscriber<S> {
    pub fn new(store: Arc<S>, poll_interval: Duration, batch_size: i64) -> Self {
        Self::with_expiry(store, poll_interval, batch_size, Duration::from_secs(24 * 3600), 10, "outbox-forwarder")
    }

    /// As [`new`](Self::new), but with explicit bounded-retry discard
    /// parameters and a metrics label, matching the teacher's
    /// `OutboxProcessor::process_batch` behavior of skipping rows that
    /// exceeded `max_retries` instead of retrying them forever.
    pub fn with_expiry(
        store: Arc<S>,
        poll_interval: Duration,
        batch_size: i64,
        max_age: Duration,
        max_retries: i32,
        forwarder_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            poll_interval,
            batch_size,
            max_age,
            max_retries,
            metrics: ForwarderMetrics::new(forwarder_name),
        }
    }
}

#[async_trait]
impl<S: OutboxStore + 'static> Subscriber for PollingOutboxSubscriber<S> {
    async fn subscribe(&self, _topic: &str) -> Result<BoxStream<'static, Envelope>, cqrs_bus::PublisherError> {
        let store = self.store.clone();
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;
        let max_age = self.max_age;
        let max_retries = self.max_retries;
        let metrics = self.metrics.clone();

        let stream = futures::stream::unfold(
            (store, Vec::<Envelope>::new().into_iter()),
            move |(store, mut pending)| {
                let metrics = metrics.clone();
                async move {
                    loop {
                        if let Some(envelope) = pending.next() {
                            return Some((envelope, (store, pending)));
                        }

                        match store.poll_committed(batch_size).await {
                            Ok(rows) if !rows.is_empty() => {
                                let mut envelopes = Vec::with_capacity(rows.len());
                                for row in rows {
                                    if row.is_expired(max_age, max_retries) {
                                        warn!(message_id = %row.id, retry_count = row.retry_count, "discarding outbox row: exceeded max age or max retries");
                                        metrics.record_expired();
                                        if let Err(e) = store.mark_forwarded(row.id).await {
                                            warn!(message_id = %row.id, error = %e, "failed to mark expired outbox row closed");
                                        }
                                        continue;
                                    }
                                    envelopes.push(row_to_envelope(row));
                                }
                                pending = envelopes.into_iter();
                            }
                            Ok(_) => {
                                tokio::time::sleep(poll_interval).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "outbox poll failed, retrying after interval");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

fn row_to_envelope(row: transactional_outbox::OutboxRow) -> Envelope {
    let mut metadata = row.metadata;
    metadata.entry(TARGET_TOPIC_KEY.to_string()).or_insert_with(|| row.topic.clone());
    Envelope {
        uuid: row.id,
        payload: row.payload,
        metadata,
    }
}

/// Configuration recognized per §6: `outbox.forwarder_topic`,
/// `outbox.subscriber`, `outbox.real_publisher` (injected directly as
/// constructor arguments rather than config-loaded, per the "CLI/config
/// loading is an external collaborator" non-goal).
pub struct ForwarderConfig {
    pub forwarder_name: String,
    pub forwarder_topic: String,
}

impl ForwarderConfig {
    pub fn new(forwarder_name: impl Into<String>, forwarder_topic: impl Into<String>) -> ForwarderResult<Self> {
        let forwarder_topic = forwarder_topic.into();
        if forwarder_topic.trim().is_empty() {
            return Err(ForwarderError::ForwarderTopicRequired);
        }
        Ok(Self {
            forwarder_name: forwarder_name.into(),
            forwarder_topic,
        })
    }
}

struct Inner {
    subscriber: Arc<dyn Subscriber>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn OutboxStoreDyn>,
    config: ForwarderConfig,
    metrics: ForwarderMetrics,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
    started: OnceCell<()>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Object-safe subset of [`OutboxStore`] the forwarder needs for ack/nack
/// bookkeeping, so [`OutboxForwarder`] can hold it as `Arc<dyn ...>` without
/// becoming generic over the concrete store type.
#[async_trait]
pub trait OutboxStoreDyn: Send + Sync {
    async fn mark_forwarded(&self, row_id: uuid::Uuid) -> Result<(), String>;
    async fn mark_failed(&self, row_id: uuid::Uuid, error: &str) -> Result<(), String>;
}

#[async_trait]
impl<S: OutboxStore + Send + Sync> OutboxStoreDyn for S {
    async fn mark_forwarded(&self, row_id: uuid::Uuid) -> Result<(), String> {
        OutboxStore::mark_forwarded(self, row_id).await.map_err(|e| e.to_string())
    }

    async fn mark_failed(&self, row_id: uuid::Uuid, error: &str) -> Result<(), String> {
        OutboxStore::mark_failed(self, row_id, error).await.map_err(|e| e.to_string())
    }
}

/// The relay itself. `Run`/`Close` may be called concurrently; the worker is
/// started exactly once via a one-shot guard (§4.6's "one-shot guard").
#[derive(Clone)]
pub struct OutboxForwarder {
    inner: Arc<Inner>,
}

impl OutboxForwarder {
    pub fn new(
        config: ForwarderConfig,
        subscriber: Arc<dyn Subscriber>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn OutboxStoreDyn>,
    ) -> Self {
        let metrics = ForwarderMetrics::new(config.forwarder_name.clone());
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                subscriber,
                publisher,
                store,
                config,
                metrics,
                shutdown: Notify::new(),
                shutdown_requested: AtomicBool::new(false),
                started: OnceCell::new(),
                done_tx,
                done_rx,
                worker: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// On the first call, constructs exactly one underlying worker and
    /// subscribes to the outbox topic; subsequent calls observe the same
    /// worker. Blocks until the relay is closed.
    pub async fn run(&self) -> ForwarderResult<()> {
        let inner = self.inner.clone();
        inner
            .started
            .get_or_init(|| async {
                let worker_inner = inner.clone();
                let handle = tokio::spawn(async move { worker_inner.worker_loop().await });
                *inner.worker.lock().await = Some(handle);
            })
            .await;

        let mut done_rx = self.inner.done_rx.clone();
        let _ = done_rx.wait_for(|done| *done).await;
        Ok(())
    }

    /// Idempotent. Signals the worker to stop and waits up to `timeout` for
    /// it to drain. If `timeout` elapses first, returns
    /// [`ForwarderError::CloseTimedOut`] but the worker keeps running in the
    /// background to completion — `close` never leaks a task, it only stops
    /// waiting for one.
    pub async fn close(&self, timeout: Duration) -> ForwarderResult<()> {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();

        if self.inner.started.get().is_none() {
            return Ok(());
        }

        let mut done_rx = self.inner.done_rx.clone();
        match tokio::time::timeout(timeout, done_rx.wait_for(|done| *done)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ForwarderError::CloseTimedOut),
        }
    }
}

impl Inner {
    async fn worker_loop(self: Arc<Self>) {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            let _ = self.done_tx.send(true);
            return;
        }

        let topic = self.config.forwarder_topic.clone();
        let mut stream = match self.subscriber.subscribe(&topic).await {
            Ok(s) => s,
            Err(source) => {
                warn!(topic = %topic, error = %source, "outbox forwarder failed to subscribe");
                let _ = self.done_tx.send(true);
                return;
            }
        };

        loop {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                item = stream.next() => {
                    match item {
                        Some(envelope) => self.forward_one(envelope).await,
                        None => break,
                    }
                }
            }
        }

        let _ = self.done_tx.send(true);
    }

    async fn forward_one(&self, envelope: Envelope) {
        let row_id = envelope.uuid;
        let target_topic = envelope
            .get(TARGET_TOPIC_KEY)
            .unwrap_or(&self.config.forwarder_topic)
            .to_string();

        let mut envelope = envelope;
        envelope.metadata.shift_remove(TARGET_TOPIC_KEY);

        match self.publisher.publish(&target_topic, envelope).await {
            Ok(()) => {
                self.metrics.record_forwarded();
                debug!(message_id = %row_id, topic = %target_topic, "forwarded outbox row");
                if let Err(e) = self.store.mark_forwarded(row_id).await {
                    warn!(message_id = %row_id, error = %e, "failed to mark outbox row forwarded");
                }
            }
            Err(e) => {
                self.metrics.record_failed();
                warn!(message_id = %row_id, topic = %target_topic, error = %e, "failed to forward outbox row");
                if let Err(mark_err) = self.store.mark_failed(row_id, &e.to_string()).await {
                    warn!(message_id = %row_id, error = %mark_err, "failed to mark outbox row failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrs_bus::PublisherError;
    use futures::stream;
    use indexmap::IndexMap;
    use parking_lot::Mutex as PMutex;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    struct FakeSubscriber {
        envelopes: PMutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl Subscriber for FakeSubscriber {
        async fn subscribe(&self, _topic: &str) -> Result<BoxStream<'static, Envelope>, PublisherError> {
            let items = std::mem::take(&mut *self.envelopes.lock());
            Ok(Box::pin(stream::iter(items)))
        }
    }

    struct RecordingPublisher {
        calls: PMutex<Vec<(String, Envelope)>>,
        fail_topics: Vec<String>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), PublisherError> {
            if self.fail_topics.iter().any(|t| t == topic) {
                return Err(PublisherError::new("simulated transport failure"));
            }
            self.calls.lock().push((topic.to_string(), envelope));
            Ok(())
        }
    }

    struct FakeStore {
        forwarded: AtomicUsize,
        failed: AtomicUsize,
    }

    #[async_trait]
    impl OutboxStoreDyn for FakeStore {
        async fn mark_forwarded(&self, _row_id: Uuid) -> Result<(), String> {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn mark_failed(&self, _row_id: Uuid, _error: &str) -> Result<(), String> {
            self.failed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope_for(topic: &str) -> Envelope {
        let mut metadata = IndexMap::new();
        metadata.insert(TARGET_TOPIC_KEY.to_string(), topic.to_string());
        Envelope {
            uuid: Uuid::new_v4(),
            payload: b"{}".to_vec(),
            metadata,
        }
    }

    #[tokio::test]
    async fn forwards_committed_envelope_to_target_topic_and_acks() {
        let envelope = envelope_for("svc.event.order_created.v1");
        let subscriber = Arc::new(FakeSubscriber {
            envelopes: PMutex::new(vec![envelope]),
        });
        let publisher = Arc::new(RecordingPublisher {
            calls: PMutex::new(Vec::new()),
            fail_topics: Vec::new(),
        });
        let store = Arc::new(FakeStore {
            forwarded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let config = ForwarderConfig::new("test-forwarder", "shortlink_cqrs_outbox_test").unwrap();
        let forwarder = OutboxForwarder::new(config, subscriber, publisher.clone(), store.clone());

        forwarder.run().await.unwrap();

        assert_eq!(publisher.calls.lock().len(), 1);
        assert_eq!(publisher.calls.lock()[0].0, "svc.event.order_created.v1");
        assert_eq!(store.forwarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_republish_is_counted_and_relay_keeps_running() {
        let e1 = envelope_for("svc.event.a.v1");
        let e2 = envelope_for("svc.event.b.v1");
        let subscriber = Arc::new(FakeSubscriber {
            envelopes: PMutex::new(vec![e1, e2]),
        });
        let publisher = Arc::new(RecordingPublisher {
            calls: PMutex::new(Vec::new()),
            fail_topics: vec!["svc.event.a.v1".to_string()],
        });
        let store = Arc::new(FakeStore {
            forwarded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let config = ForwarderConfig::new("test-forwarder", "shortlink_cqrs_outbox_test").unwrap();
        let forwarder = OutboxForwarder::new(config, subscriber, publisher.clone(), store.clone());

        let run_handle = tokio::spawn({
            let forwarder = forwarder.clone();
            async move { forwarder.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        forwarder.close(Duration::from_secs(1)).await.unwrap();
        run_handle.await.unwrap().unwrap();

        assert_eq!(store.failed.load(Ordering::SeqCst), 1);
        assert_eq!(store.forwarded.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_before_run() {
        let subscriber = Arc::new(FakeSubscriber {
            envelopes: PMutex::new(Vec::new()),
        });
        let publisher = Arc::new(RecordingPublisher {
            calls: PMutex::new(Vec::new()),
            fail_topics: Vec::new(),
        });
        let store = Arc::new(FakeStore {
            forwarded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });
        let config = ForwarderConfig::new("test-forwarder", "shortlink_cqrs_outbox_test").unwrap();
        let forwarder = OutboxForwarder::new(config, subscriber, publisher, store);

        forwarder.close(Duration::from_millis(50)).await.unwrap();
        forwarder.close(Duration::from_millis(50)).await.unwrap();
    }

    struct FakePollableStore {
        rows: PMutex<Vec<transactional_outbox::OutboxRow>>,
        forwarded_ids: PMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl OutboxStore for FakePollableStore {
        async fn write(
            &self,
            _tx: &transactional_outbox::PgTransactionHandle,
            _topic: &str,
            _envelope: &Envelope,
            _priority: u8,
        ) -> transactional_outbox::OutboxResult<()> {
            unimplemented!("not exercised by the polling subscriber")
        }

        async fn poll_committed(&self, limit: i64) -> transactional_outbox::OutboxResult<Vec<transactional_outbox::OutboxRow>> {
            let forwarded = self.forwarded_ids.lock().clone();
            let rows: Vec<_> = self
                .rows
                .lock()
                .iter()
                .filter(|r| !forwarded.contains(&r.id))
                .take(limit as usize)
                .cloned()
                .collect();
            Ok(rows)
        }

        async fn mark_forwarded(&self, row_id: Uuid) -> transactional_outbox::OutboxResult<()> {
            self.forwarded_ids.lock().push(row_id);
            Ok(())
        }

        async fn mark_failed(&self, _row_id: Uuid, _error: &str) -> transactional_outbox::OutboxResult<()> {
            Ok(())
        }

        async fn pending_stats(&self) -> transactional_outbox::OutboxResult<(i64, i64)> {
            Ok((self.rows.lock().len() as i64, 0))
        }
    }

    fn row(id: Uuid, created_at: chrono::DateTime<chrono::Utc>, retry_count: i32) -> transactional_outbox::OutboxRow {
        transactional_outbox::OutboxRow {
            id,
            topic: "svc.event.order_created.v1".to_string(),
            payload: b"{}".to_vec(),
            metadata: IndexMap::new(),
            sequence: 0,
            priority: transactional_outbox::priority::NORMAL,
            created_at,
            forwarded_at: None,
            retry_count,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn polling_subscriber_discards_expired_rows_without_yielding_them() {
        let fresh_id = Uuid::new_v4();
        let expired_by_age_id = Uuid::new_v4();
        let expired_by_retries_id = Uuid::new_v4();

        let store = Arc::new(FakePollableStore {
            rows: PMutex::new(vec![
                row(fresh_id, chrono::Utc::now(), 0),
                row(expired_by_age_id, chrono::Utc::now() - chrono::Duration::hours(2), 0),
                row(expired_by_retries_id, chrono::Utc::now(), 10),
            ]),
            forwarded_ids: PMutex::new(Vec::new()),
        });

        let subscriber = PollingOutboxSubscriber::with_expiry(
            store.clone(),
            Duration::from_millis(10),
            10,
            Duration::from_secs(3600),
            5,
            "test-forwarder",
        );

        let mut stream = subscriber.subscribe("unused").await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap().unwrap();

        assert_eq!(first.uuid, fresh_id);
        assert!(store.forwarded_ids.lock().contains(&expired_by_age_id));
        assert!(store.forwarded_ids.lock().contains(&expired_by_retries_id));
        assert!(!store.forwarded_ids.lock().contains(&fresh_id));
    }

    #[test]
    fn forwarder_topic_required_rejects_empty() {
        assert!(matches!(
            ForwarderConfig::new("f", ""),
            Err(ForwarderError::ForwarderTopicRequired)
        ));
    }

    #[tokio::test]
    async fn run_and_close_may_race_without_deadlock() {
        let subscriber = Arc::new(FakeSubscriber {
            envelopes: PMutex::new(vec![envelope_for("svc.event.a.v1")]),
        });
        let publisher = Arc::new(RecordingPublisher {
            calls: PMutex::new(Vec::new()),
            fail_topics: Vec::new(),
        });
        let store = Arc::new(FakeStore {
            forwarded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });
        let config = ForwarderConfig::new("test-forwarder", "shortlink_cqrs_outbox_test").unwrap();
        let forwarder = OutboxForwarder::new(config, subscriber, publisher, store);

        let a = {
            let f = forwarder.clone();
            tokio::spawn(async move { f.run().await })
        };
        let b = {
            let f = forwarder.clone();
            tokio::spawn(async move { f.close(Duration::from_secs(1)).await })
        };

        let (run_res, close_res) = tokio::join!(a, b);
        run_res.unwrap().unwrap();
        close_res.unwrap().unwrap();
    }
}
