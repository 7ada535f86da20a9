//! # DLQ / Poison Middleware (C8)
//!
//! When a handler's retry budget is exhausted (or the circuit declares a
//! message "poisoned"), builds a DLQ envelope per §3/§6 and publishes it to
//! `<received_topic>.DLQ` (or an explicitly configured topic). The original
//! handler error is swallowed once the DLQ publish succeeds; it is returned
//! to the caller only if the DLQ publish itself fails, per §4.8 — unless
//! [`DlqConfig::always_return_original_error`] opts into the alternate
//! policy discussed in `spec.md` §9 (always let the broker redeliver).

use std::fmt;

use base64::Engine;
use chrono::{SecondsFormat, Utc};
use cqrs_bus::{Publisher, PublisherError};
use cqrs_envelope::Envelope;
use indexmap::IndexMap;
use opentelemetry::propagation::Injector;
use opentelemetry::trace::TraceContextExt;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const DLQ_TOPIC_SUFFIX: &str = "DLQ";
pub const KEY_POISON_REASON: &str = "poison_reason";
pub const KEY_POISON_STACKTRACE: &str = "poison_stacktrace";
pub const KEY_SERVICE_NAME: &str = "service_name";
pub const KEY_DLQ_VERSION: &str = "dlq_version";
pub const KEY_ORIGINAL_RECEIVED_TOPIC: &str = "original_received_topic";
pub const ORIGINAL_METADATA_PREFIX: &str = "original_";

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("DLQ topic could not be derived: no explicit topic configured and received topic is empty")]
    TopicRequired,

    #[error("failed to build DLQ envelope: {0}")]
    BuildError(String),

    #[error("failed to publish DLQ envelope: {0}")]
    PublishError(#[source] PublisherError),
}

/// `dlq.enabled`, `dlq.topic` from §6's configuration table.
#[derive(Debug, Clone, Default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub topic: Option<String>,
    /// Open Question (spec.md §9): when true, the original handler error is
    /// always returned to the caller after a successful DLQ publish too,
    /// letting the broker redeliver instead of acking. Decision recorded in
    /// DESIGN.md: defaults to `false` (swallow on success), matching the
    /// literal §4.8 text.
    pub always_return_original_error: bool,
}

impl DlqConfig {
    pub fn enabled(topic: impl Into<String>) -> Self {
        Self {
            enabled: true,
            topic: Some(topic.into()),
            always_return_original_error: false,
        }
    }
}

/// JSON shape of the DLQ event body, per §6.
#[derive(Debug, Serialize)]
pub struct DlqEnvelopeBody {
    pub failed_at: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub original_message: OriginalMessage,
}

#[derive(Debug, Serialize)]
pub struct OriginalMessage {
    pub uuid: String,
    pub metadata: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_base64: Option<String>,
}

/// Wraps a `Publisher` used as the DLQ transport. Holds no reference back
/// to the router/bus (per §9's cycle-breaking guidance): callers invoke
/// [`PoisonMiddleware::poison`] directly from wherever the retry budget is
/// observed to be exhausted.
pub struct PoisonMiddleware {
    publisher: std::sync::Arc<dyn Publisher>,
    config: DlqConfig,
    service_name: String,
}

impl PoisonMiddleware {
    pub fn new(publisher: std::sync::Arc<dyn Publisher>, config: DlqConfig, service_name: impl Into<String>) -> Self {
        Self {
            publisher,
            config,
            service_name: service_name.into(),
        }
    }

    fn target_topic(&self, received_topic: &str) -> Result<String, DlqError> {
        if let Some(topic) = self.config.topic.as_ref().filter(|t| !t.trim().is_empty()) {
            return Ok(topic.clone());
        }
        if received_topic.trim().is_empty() {
            return Err(DlqError::TopicRequired);
        }
        Ok(format!("{received_topic}.{DLQ_TOPIC_SUFFIX}"))
    }

    /// Builds the DLQ envelope, publishes it, and applies the swallow-vs-
    /// return policy. Returns `Ok(())` when the original error is swallowed,
    /// `Err(original_err)` when the caller should still observe it (either
    /// because DLQ publish failed, or because
    /// `always_return_original_error` is set).
    pub async fn poison<E>(&self, received_topic: &str, original: &Envelope, original_err: E) -> Result<(), E>
    where
        E: fmt::Display,
    {
        if !self.config.enabled {
            return Err(original_err);
        }

        let reason = original_err.to_string();
        match self.publish(received_topic, original, &reason, None).await {
            Ok(()) => {
                tracing::info!(topic = %received_topic, reason = %reason, "published poisoned message to DLQ");
                if self.config.always_return_original_error {
                    Err(original_err)
                } else {
                    Ok(())
                }
            }
            Err(dlq_err) => {
                tracing::warn!(topic = %received_topic, reason = %reason, error = %dlq_err, "DLQ publish failed, returning original error");
                Err(original_err)
            }
        }
    }

    async fn publish(
        &self,
        received_topic: &str,
        original: &Envelope,
        reason: &str,
        stacktrace: Option<String>,
    ) -> Result<(), DlqError> {
        let target_topic = self.target_topic(received_topic)?;
        let envelope = build_dlq_envelope(original, reason, stacktrace, &self.service_name, received_topic)
            .map_err(DlqError::BuildError)?;
        self.publisher
            .publish(&target_topic, envelope)
            .await
            .map_err(DlqError::PublishError)
    }
}

/// Builds the DLQ envelope (§3/§6): JSON body plus metadata carrying every
/// original entry under an `original_` prefix and the poison bookkeeping
/// keys.
pub fn build_dlq_envelope(
    original: &Envelope,
    reason: &str,
    stacktrace: Option<String>,
    service_name: &str,
    received_topic: &str,
) -> Result<Envelope, String> {
    let (payload, payload_base64) = match serde_json::from_slice::<serde_json::Value>(&original.payload) {
        Ok(value) => (Some(value), None),
        Err(_) => (None, Some(base64::engine::general_purpose::STANDARD.encode(&original.payload))),
    };

    let body = DlqEnvelopeBody {
        failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        reason: reason.to_string(),
        stacktrace: stacktrace.clone(),
        service_name: Some(service_name.to_string()),
        original_message: OriginalMessage {
            uuid: original.uuid.to_string(),
            metadata: original.metadata.clone(),
            payload,
            payload_base64,
        },
    };

    let payload_bytes = serde_json::to_vec(&body).map_err(|e| e.to_string())?;

    let mut metadata = IndexMap::new();
    for (k, v) in &original.metadata {
        metadata.insert(format!("{ORIGINAL_METADATA_PREFIX}{k}"), v.clone());
    }
    metadata.insert(KEY_POISON_REASON.to_string(), reason.to_string());
    if let Some(stack) = stacktrace {
        metadata.insert(KEY_POISON_STACKTRACE.to_string(), stack);
    }
    metadata.insert(KEY_SERVICE_NAME.to_string(), service_name.to_string());
    metadata.insert(KEY_DLQ_VERSION.to_string(), "1".to_string());
    metadata.insert(KEY_ORIGINAL_RECEIVED_TOPIC.to_string(), received_topic.to_string());
    inject_trace_context(&mut metadata);

    Ok(Envelope {
        uuid: Uuid::new_v4(),
        payload: payload_bytes,
        metadata,
    })
}

struct MetadataInjector<'a>(&'a mut IndexMap<String, String>);

impl<'a> Injector for MetadataInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        self.0.entry(key.to_string()).or_insert(value);
    }
}

/// Propagates the current span context into the DLQ envelope's metadata so
/// downstream consumers of `<topic>.DLQ` can continue the original trace.
fn inject_trace_context(metadata: &mut IndexMap<String, String>) {
    let cx = opentelemetry::Context::current();
    if cx.span().span_context().is_valid() {
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut MetadataInjector(metadata));
        });
    }
}
