//! Envelope marshaling for the CQRS message bus (C2).
//!
//! An [`Envelope`] is the transport-level record: an id, opaque payload
//! bytes, and an ordered metadata map. [`JsonMarshaler`] and
//! [`BinaryMarshaler`] (behind the `protobuf` feature) implement [`Marshal`]
//! for any message type that satisfies their respective encoding bounds.

use chrono::{SecondsFormat, Utc};
use cqrs_naming::{CanonicalName, MessageKind};
use indexmap::IndexMap;
use opentelemetry::propagation::Injector;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const KEY_TYPE_NAME: &str = "type_name";
pub const KEY_TYPE_VERSION: &str = "type_version";
pub const KEY_CONTENT_TYPE: &str = "content_type";
pub const KEY_SERVICE_NAME: &str = "service_name";
pub const KEY_MESSAGE_KIND: &str = "message_kind";
pub const KEY_OCCURRED_AT: &str = "occurred_at";
pub const KEY_TRACE_ID: &str = "trace_id";
pub const KEY_SPAN_ID: &str = "span_id";
pub const KEY_TRACEPARENT: &str = "traceparent";
pub const KEY_TRACESTATE: &str = "tracestate";
/// Caller-chosen outbox priority band (§3 `OutboxRow::priority`), carried in
/// metadata rather than as a `Publisher::publish` parameter so it survives
/// any transport, not just the transactional outbox.
pub const KEY_PRIORITY: &str = "priority";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("failed to encode payload: {0}")]
    MarshalError(String),
    #[error("failed to decode payload: {0}")]
    DecodeError(String),
    #[error("required metadata key '{0}' is missing")]
    MissingMetadata(&'static str),
}

/// The transport envelope: id, opaque payload, ordered metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub uuid: Uuid,
    pub payload: Vec<u8>,
    pub metadata: IndexMap<String, String>,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            payload,
            metadata: IndexMap::new(),
        }
    }

    /// Set a metadata entry only if it is not already present. Per spec:
    /// "metadata fields never silently overwrite caller-supplied values
    /// already present."
    pub fn set_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Reconstruct the canonical name from envelope metadata
    /// (`service_name` + `message_kind` + `type_name` + `type_version`).
    /// Callers without all four keys should fall back to C1 directly.
    pub fn name_from_envelope(&self) -> Option<CanonicalName> {
        let service = self.get(KEY_SERVICE_NAME)?;
        let kind = self.get(KEY_MESSAGE_KIND)?;
        let name = self.get(KEY_TYPE_NAME)?;
        let version = self.get(KEY_TYPE_VERSION)?;
        CanonicalName::new(service, kind, name, version).ok()
    }
}

/// Context supplied by the bus at marshal time.
#[derive(Debug, Clone)]
pub struct MarshalContext<'a> {
    pub name: &'a CanonicalName,
    pub service_name: &'a str,
    pub kind: MessageKind,
}

/// Marker trait implemented by each concrete marshaler (JSON, binary).
/// Kept separate from [`Marshal<T>`] so a `Bus<M>` can be generic over the
/// marshaler without also being generic over every message type it ever
/// publishes.
pub trait Marshaler: Send + Sync + 'static {
    fn marshaler_content_type(&self) -> &'static str;
}

/// Per-message-type (de)serialization, implemented generically for any `T`
/// that satisfies the marshaler's encoding bounds.
pub trait Marshal<T>: Marshaler {
    fn marshal(&self, value: &T, ctx: MarshalContext<'_>) -> Result<Envelope, EnvelopeError>;
    fn unmarshal(&self, envelope: &Envelope) -> Result<T, EnvelopeError>;
}

fn base_metadata(ctx: &MarshalContext<'_>, content_type: &'static str) -> IndexMap<String, String> {
    let mut metadata = IndexMap::new();
    metadata.insert(KEY_TYPE_NAME.to_string(), ctx.name.name.clone());
    metadata.insert(KEY_TYPE_VERSION.to_string(), ctx.name.version.clone());
    metadata.insert(KEY_CONTENT_TYPE.to_string(), content_type.to_string());
    metadata.insert(KEY_SERVICE_NAME.to_string(), ctx.service_name.to_string());
    metadata.insert(KEY_MESSAGE_KIND.to_string(), ctx.kind.to_string());
    metadata.insert(
        KEY_OCCURRED_AT.to_string(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    inject_trace_context(&mut metadata);
    metadata
}

struct MetadataInjector<'a>(&'a mut IndexMap<String, String>);

impl<'a> Injector for MetadataInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        self.0.entry(key.to_string()).or_insert(value);
    }
}

/// Inject the current W3C trace context (`traceparent`/`tracestate`) into
/// metadata via the process-global text-map propagator, plus convenience
/// `trace_id`/`span_id` fields for log correlation.
fn inject_trace_context(metadata: &mut IndexMap<String, String>) {
    let cx = opentelemetry::Context::current();
    let span = cx.span();
    let span_context = span.span_context();
    if span_context.is_valid() {
        metadata
            .entry(KEY_TRACE_ID.to_string())
            .or_insert_with(|| span_context.trace_id().to_string());
        metadata
            .entry(KEY_SPAN_ID.to_string())
            .or_insert_with(|| span_context.span_id().to_string());
    }
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut MetadataInjector(metadata));
    });
}

use opentelemetry::trace::TraceContextExt;

/// JSON marshaler backed by `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct JsonMarshaler;

impl Marshaler for JsonMarshaler {
    fn marshaler_content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }
}

impl<T> Marshal<T> for JsonMarshaler
where
    T: Serialize + DeserializeOwned,
{
    fn marshal(&self, value: &T, ctx: MarshalContext<'_>) -> Result<Envelope, EnvelopeError> {
        let payload = serde_json::to_vec(value).map_err(|e| EnvelopeError::MarshalError(e.to_string()))?;
        if payload.is_empty() || payload == b"null" {
            return Err(EnvelopeError::EmptyPayload);
        }
        Ok(Envelope {
            uuid: Uuid::new_v4(),
            metadata: base_metadata(&ctx, CONTENT_TYPE_JSON),
            payload,
        })
    }

    fn unmarshal(&self, envelope: &Envelope) -> Result<T, EnvelopeError> {
        if envelope.payload.is_empty() {
            return Err(EnvelopeError::EmptyPayload);
        }
        serde_json::from_slice(&envelope.payload).map_err(|e| EnvelopeError::DecodeError(e.to_string()))
    }
}

/// Protobuf-backed marshaler, gated behind the `protobuf` feature.
#[cfg(feature = "protobuf")]
#[derive(Debug, Clone, Default)]
pub struct BinaryMarshaler;

#[cfg(feature = "protobuf")]
impl Marshaler for BinaryMarshaler {
    fn marshaler_content_type(&self) -> &'static str {
        CONTENT_TYPE_PROTOBUF
    }
}

#[cfg(feature = "protobuf")]
impl<T> Marshal<T> for BinaryMarshaler
where
    T: prost::Message + Default,
{
    fn marshal(&self, value: &T, ctx: MarshalContext<'_>) -> Result<Envelope, EnvelopeError> {
        let payload = value.encode_to_vec();
        if payload.is_empty() {
            return Err(EnvelopeError::EmptyPayload);
        }
        Ok(Envelope {
            uuid: Uuid::new_v4(),
            metadata: base_metadata(&ctx, CONTENT_TYPE_PROTOBUF),
            payload,
        })
    }

    fn unmarshal(&self, envelope: &Envelope) -> Result<T, EnvelopeError> {
        if envelope.payload.is_empty() {
            return Err(EnvelopeError::EmptyPayload);
        }
        T::decode(envelope.payload.as_slice()).map_err(|e| EnvelopeError::DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrs_naming::CanonicalName;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
    struct OrderCreated {
        id: String,
    }

    fn ctx(name: &CanonicalName) -> MarshalContext<'_> {
        MarshalContext {
            name,
            service_name: "cqrs-integration-test",
            kind: MessageKind::Event,
        }
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let name = CanonicalName::new("shortlink", "event", "order_created", "v1").unwrap();
        let value = OrderCreated { id: "evt-1".into() };
        let marshaler = JsonMarshaler;
        let envelope = marshaler.marshal(&value, ctx(&name)).unwrap();
        let decoded: OrderCreated = marshaler.unmarshal(&envelope).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn marshal_sets_required_metadata_without_overwriting() {
        let name = CanonicalName::new("shortlink", "command", "test_command", "v1").unwrap();
        let value = OrderCreated { id: "cmd-1".into() };
        let marshaler = JsonMarshaler;
        let envelope = marshaler
            .marshal(&value, MarshalContext { name: &name, service_name: "cqrs-integration-test", kind: MessageKind::Command })
            .unwrap();

        assert_eq!(envelope.get(KEY_TYPE_NAME), Some("test_command"));
        assert_eq!(envelope.get(KEY_TYPE_VERSION), Some("v1"));
        assert_eq!(envelope.get(KEY_CONTENT_TYPE), Some(CONTENT_TYPE_JSON));
        assert_eq!(envelope.get(KEY_SERVICE_NAME), Some("cqrs-integration-test"));
        assert_eq!(envelope.get(KEY_MESSAGE_KIND), Some("command"));
        assert!(envelope.get(KEY_OCCURRED_AT).is_some());
    }

    #[test]
    fn set_if_absent_never_overwrites_caller_value() {
        let mut envelope = Envelope::new(vec![1]);
        envelope.metadata.insert(KEY_SERVICE_NAME.to_string(), "caller-set".to_string());
        envelope.set_if_absent(KEY_SERVICE_NAME, "marshaler-set");
        assert_eq!(envelope.get(KEY_SERVICE_NAME), Some("caller-set"));
    }

    #[test]
    fn empty_payload_fails_unmarshal() {
        let envelope = Envelope::new(vec![]);
        let marshaler = JsonMarshaler;
        let result: Result<OrderCreated, _> = marshaler.unmarshal(&envelope);
        assert!(matches!(result, Err(EnvelopeError::EmptyPayload)));
    }

    #[test]
    fn decode_error_on_schema_mismatch() {
        let name = CanonicalName::new("shortlink", "event", "order_created", "v1").unwrap();
        let marshaler = JsonMarshaler;
        let envelope = marshaler.marshal(&serde_json::json!({"unexpected": 1}), ctx(&name)).unwrap();
        let result: Result<OrderCreated, _> = marshaler.unmarshal(&envelope);
        assert!(matches!(result, Err(EnvelopeError::DecodeError(_))));
    }

    #[test]
    fn name_from_envelope_reconstructs_canonical_name() {
        let name = CanonicalName::new("shortlink", "event", "order_created", "v1").unwrap();
        let value = OrderCreated { id: "evt-1".into() };
        let marshaler = JsonMarshaler;
        let envelope = marshaler.marshal(&value, ctx(&name)).unwrap();
        assert_eq!(envelope.name_from_envelope(), Some(name));
    }
}
