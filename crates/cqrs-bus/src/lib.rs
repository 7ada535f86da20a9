//! Public publishing surface for the CQRS message bus (C4).
//!
//! Composes the canonical namer (C1) and envelope marshaler (C2), resolves
//! the active [`Publisher`] for a given call, and dispatches the marshaled
//! envelope to it. Transport concerns (Kafka, the transactional outbox, an
//! in-memory channel) are external collaborators named only by the
//! [`Publisher`]/[`Subscriber`] capability traits.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cqrs_envelope::{Envelope, EnvelopeError, Marshal, MarshalContext};
use cqrs_naming::{CanonicalNamer, MessageKind, Nameable, NamingError};
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is configured in transaction-only mode but no transaction is present in context")]
    PublishRequiresTx,
    #[error("no publisher resolved for this call: no override, no transactional publisher, and no default publisher configured")]
    NilPublisher,
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("publish of {canonical_name} ({payload_type}) failed: {source}")]
    Transport {
        canonical_name: String,
        payload_type: &'static str,
        #[source]
        source: PublisherError,
    },
}

#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct PublisherError(pub String);

impl PublisherError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A handle to an in-flight caller transaction. Concrete transport crates
/// (e.g. the transactional outbox) downcast this back to their own
/// connection/transaction type via [`TransactionContext::as_any`]. Kept
/// opaque here so C4 never depends on a concrete database driver.
pub trait TransactionContext: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Explicit call context, replacing ambient thread-locals per the design
/// note in §9: carries the tenant service name and an optional transaction
/// handle. Cloning is cheap (the transaction handle is reference-counted).
#[derive(Clone)]
pub struct BusContext {
    pub service_name: String,
    pub transaction: Option<Arc<dyn TransactionContext>>,
}

impl BusContext {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            transaction: None,
        }
    }

    pub fn with_transaction(mut self, tx: Arc<dyn TransactionContext>) -> Self {
        self.transaction = Some(tx);
        self
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

impl fmt::Debug for BusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusContext")
            .field("service_name", &self.service_name)
            .field("has_transaction", &self.has_transaction())
            .finish()
    }
}

/// External transport collaborator: publishes an already-marshaled envelope
/// to a resolved topic. Implemented by the transactional outbox publisher
/// (C5), a direct broker client, or an in-memory test double.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), PublisherError>;
}

/// External transport collaborator: yields envelopes delivered on a topic.
/// Implemented by the outbox forwarder's source and by real broker
/// consumers.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Envelope>, PublisherError>;

    /// Signals that `envelope` should be considered for redelivery rather
    /// than treated as acked — the router's hook for "let the broker
    /// redeliver" outcomes (e.g. a DLQ publish that itself failed, or the
    /// poison middleware's `always_return_original_error` policy). Default
    /// no-op: a subscriber with no redelivery mechanism (e.g. a bounded
    /// in-memory test double, or the outbox poller, which has no broker to
    /// redeliver from) simply drops the request and the envelope is
    /// implicitly acked either way.
    async fn nack(&self, _envelope: &Envelope) {}
}

/// Factory producing a per-call transactional [`Publisher`] from a
/// transaction handle. Stored by value in [`Bus`] rather than as a
/// back-reference, breaking the cycle called out in §9: the transactional
/// publisher logically depends on the bus, which depends on this factory,
/// not on the publisher itself.
pub type TxPublisherFactory = Arc<dyn Fn(Arc<dyn TransactionContext>) -> Arc<dyn Publisher> + Send + Sync>;

/// Per-call override of the publish-target resolution.
#[derive(Default, Clone)]
pub struct PublishOptions {
    pub publisher_override: Option<Arc<dyn Publisher>>,
    /// Outbox priority band for this call (see `transactional_outbox::priority`).
    /// `None` leaves the envelope unmarked; the transactional publisher then
    /// falls back to `priority::NORMAL`.
    pub priority: Option<u8>,
}

impl PublishOptions {
    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher_override: Some(publisher),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

pub struct BusBuilder<M> {
    service_name: String,
    marshaler: M,
    default_publisher: Option<Arc<dyn Publisher>>,
    tx_publisher_factory: Option<TxPublisherFactory>,
    tx_only: bool,
}

impl<M> BusBuilder<M> {
    pub fn new(service_name: impl Into<String>, marshaler: M) -> Self {
        Self {
            service_name: service_name.into(),
            marshaler,
            default_publisher: None,
            tx_publisher_factory: None,
            tx_only: false,
        }
    }

    pub fn default_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.default_publisher = Some(publisher);
        self
    }

    pub fn tx_publisher_factory(mut self, factory: TxPublisherFactory) -> Self {
        self.tx_publisher_factory = Some(factory);
        self
    }

    /// When set, [`Bus::publish`] fails with [`BusError::PublishRequiresTx`]
    /// unless the call context carries a transaction.
    pub fn tx_only(mut self, tx_only: bool) -> Self {
        self.tx_only = tx_only;
        self
    }

    pub fn build(self) -> Result<Bus<M>, BusError> {
        Ok(Bus {
            namer: CanonicalNamer::new(&self.service_name)?,
            service_name: self.service_name,
            marshaler: self.marshaler,
            default_publisher: self.default_publisher,
            tx_publisher_factory: self.tx_publisher_factory,
            tx_only: self.tx_only,
        })
    }
}

/// The bus itself. Generic over the marshaler implementation ([`cqrs_envelope::JsonMarshaler`]
/// or the protobuf marshaler) but not over any particular message type —
/// that genericity lives on [`Bus::publish`].
pub struct Bus<M> {
    namer: CanonicalNamer,
    service_name: String,
    marshaler: M,
    default_publisher: Option<Arc<dyn Publisher>>,
    tx_publisher_factory: Option<TxPublisherFactory>,
    tx_only: bool,
}

impl<M> Bus<M> {
    pub fn builder(service_name: impl Into<String>, marshaler: M) -> BusBuilder<M> {
        BusBuilder::new(service_name, marshaler)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// `Publish(ctx, value, [options])` per §4.4.
    pub async fn publish<T>(
        &self,
        ctx: &BusContext,
        kind: MessageKind,
        value: &T,
        opts: PublishOptions,
    ) -> Result<(), BusError>
    where
        M: Marshal<T>,
        T: Nameable,
    {
        if self.tx_only && !ctx.has_transaction() {
            return Err(BusError::PublishRequiresTx);
        }

        let name = self.namer.name_for(kind, value)?;
        let topic = self.namer.topic_for(&name);

        let mut envelope = self.marshaler.marshal(
            value,
            MarshalContext {
                name: &name,
                service_name: &self.service_name,
                kind,
            },
        )?;

        if let Some(priority) = opts.priority {
            envelope
                .metadata
                .insert(cqrs_envelope::KEY_PRIORITY.to_string(), priority.to_string());
        }

        let publisher = self.resolve_publisher(ctx, &opts)?;

        tracing::debug!(canonical_name = %name, topic = %topic, "publishing message");

        publisher
            .publish(&topic, envelope)
            .await
            .map_err(|source| BusError::Transport {
                canonical_name: name.to_string(),
                payload_type: std::any::type_name::<T>(),
                source,
            })
    }

    /// Convenience wrapper for `Publish(ctx, value)` with `kind = command`.
    pub async fn send<T>(&self, ctx: &BusContext, value: &T, opts: PublishOptions) -> Result<(), BusError>
    where
        M: Marshal<T>,
        T: Nameable,
    {
        self.publish(ctx, MessageKind::Command, value, opts).await
    }

    /// Convenience wrapper for `Publish(ctx, value)` with `kind = event`.
    pub async fn publish_event<T>(&self, ctx: &BusContext, value: &T, opts: PublishOptions) -> Result<(), BusError>
    where
        M: Marshal<T>,
        T: Nameable,
    {
        self.publish(ctx, MessageKind::Event, value, opts).await
    }

    fn resolve_publisher(&self, ctx: &BusContext, opts: &PublishOptions) -> Result<Arc<dyn Publisher>, BusError> {
        if let Some(publisher) = &opts.publisher_override {
            return Ok(publisher.clone());
        }
        if let (Some(tx), Some(factory)) = (&ctx.transaction, &self.tx_publisher_factory) {
            return Ok(factory(tx.clone()));
        }
        self.default_publisher.clone().ok_or(BusError::NilPublisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrs_envelope::JsonMarshaler;
    use cqrs_naming::{NameHint, SchemaHint};
    use futures::stream;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, Clone)]
    struct TestCommand {
        id: String,
    }

    impl Nameable for TestCommand {
        fn type_name() -> &'static str {
            "TestCommand"
        }
    }

    struct RecordingPublisher {
        calls: Mutex<Vec<(String, Envelope)>>,
    }

    impl RecordingPublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), PublisherError> {
            self.calls.lock().push((topic.to_string(), envelope));
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, _topic: &str, _envelope: Envelope) -> Result<(), PublisherError> {
            Err(PublisherError::new("broker unreachable"))
        }
    }

    struct FakeTransaction;
    impl TransactionContext for FakeTransaction {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test]
    async fn send_with_default_publisher_resolves_topic_and_metadata() {
        let publisher = RecordingPublisher::new();
        let bus = Bus::builder("cqrs-integration-test", JsonMarshaler)
            .default_publisher(publisher.clone())
            .build()
            .unwrap();

        let ctx = BusContext::new("cqrs-integration-test");
        let value = TestCommand { id: "cmd-1".into() };
        bus.send(&ctx, &value, PublishOptions::default()).await.unwrap();

        let calls = publisher.calls.lock();
        assert_eq!(calls.len(), 1);
        let (topic, envelope) = &calls[0];
        assert_eq!(topic, "cqrs-integration-test.command.test_command.v1");
        assert_eq!(envelope.get(cqrs_envelope::KEY_MESSAGE_KIND), Some("command"));
        assert_eq!(envelope.get(cqrs_envelope::KEY_SERVICE_NAME), Some("cqrs-integration-test"));
    }

    #[tokio::test]
    async fn with_priority_stamps_envelope_metadata() {
        let publisher = RecordingPublisher::new();
        let bus = Bus::builder("cqrs-integration-test", JsonMarshaler)
            .default_publisher(publisher.clone())
            .build()
            .unwrap();

        let ctx = BusContext::new("cqrs-integration-test");
        let value = TestCommand { id: "cmd-1".into() };
        bus.send(&ctx, &value, PublishOptions::default().with_priority(0)).await.unwrap();

        let calls = publisher.calls.lock();
        assert_eq!(calls[0].1.get(cqrs_envelope::KEY_PRIORITY), Some("0"));
    }

    #[tokio::test]
    async fn tx_only_bus_rejects_publish_without_transaction() {
        let publisher = RecordingPublisher::new();
        let bus = Bus::builder("cqrs-integration-test", JsonMarshaler)
            .default_publisher(publisher)
            .tx_only(true)
            .build()
            .unwrap();

        let ctx = BusContext::new("cqrs-integration-test");
        let value = TestCommand { id: "cmd-1".into() };
        let err = bus.send(&ctx, &value, PublishOptions::default()).await.unwrap_err();
        assert!(matches!(err, BusError::PublishRequiresTx));
    }

    #[tokio::test]
    async fn transactional_publisher_is_chosen_when_transaction_present() {
        let default_publisher = RecordingPublisher::new();
        let tx_publisher = RecordingPublisher::new();
        let tx_publisher_for_factory = tx_publisher.clone();

        let bus = Bus::builder("cqrs-integration-test", JsonMarshaler)
            .default_publisher(default_publisher.clone())
            .tx_publisher_factory(Arc::new(move |_tx| tx_publisher_for_factory.clone() as Arc<dyn Publisher>))
            .build()
            .unwrap();

        let ctx = BusContext::new("cqrs-integration-test").with_transaction(Arc::new(FakeTransaction));
        let value = TestCommand { id: "cmd-1".into() };
        bus.send(&ctx, &value, PublishOptions::default()).await.unwrap();

        assert_eq!(tx_publisher.calls.lock().len(), 1);
        assert_eq!(default_publisher.calls.lock().len(), 0);
    }

    #[tokio::test]
    async fn per_call_override_wins_over_transactional_publisher() {
        let default_publisher = RecordingPublisher::new();
        let tx_publisher = RecordingPublisher::new();
        let override_publisher = RecordingPublisher::new();
        let override_for_factory = override_publisher.clone();

        let bus = Bus::builder("cqrs-integration-test", JsonMarshaler)
            .default_publisher(default_publisher)
            .tx_publisher_factory(Arc::new({
                let tx_publisher = tx_publisher.clone();
                move |_tx| tx_publisher.clone() as Arc<dyn Publisher>
            }))
            .build()
            .unwrap();

        let ctx = BusContext::new("cqrs-integration-test").with_transaction(Arc::new(FakeTransaction));
        let value = TestCommand { id: "cmd-1".into() };
        bus.send(
            &ctx,
            &value,
            PublishOptions::with_publisher(override_for_factory.clone() as Arc<dyn Publisher>),
        )
        .await
        .unwrap();

        assert_eq!(override_publisher.calls.lock().len(), 1);
        assert_eq!(tx_publisher.calls.lock().len(), 0);
    }

    #[tokio::test]
    async fn transport_error_is_wrapped_with_canonical_name_and_payload_type() {
        let bus = Bus::builder("cqrs-integration-test", JsonMarshaler)
            .default_publisher(Arc::new(FailingPublisher))
            .build()
            .unwrap();

        let ctx = BusContext::new("cqrs-integration-test");
        let value = TestCommand { id: "cmd-1".into() };
        let err = bus.send(&ctx, &value, PublishOptions::default()).await.unwrap_err();
        match err {
            BusError::Transport { canonical_name, payload_type, .. } => {
                assert_eq!(canonical_name, "cqrs-integration-test.command.test_command.v1");
                assert!(payload_type.contains("TestCommand"));
            }
            other => panic!("expected Transport error, got {other:?}"),
        }
    }

    #[allow(dead_code)]
    struct NameHinted;
    impl Nameable for NameHinted {
        fn type_name() -> &'static str {
            "NameHinted"
        }
        fn name_hint(&self) -> NameHint {
            NameHint::default()
        }
        fn schema_hint() -> Option<SchemaHint> {
            None
        }
    }

    #[allow(dead_code)]
    async fn _ensure_subscriber_is_object_safe(s: Arc<dyn Subscriber>) {
        let _ = s.subscribe("topic").await;
    }

    #[allow(dead_code)]
    fn _stream_smoke() -> BoxStream<'static, Envelope> {
        Box::pin(stream::empty())
    }
}
