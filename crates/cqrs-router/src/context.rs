use cqrs_envelope::{Envelope, KEY_SERVICE_NAME, KEY_SPAN_ID, KEY_TRACE_ID};

/// Carried alongside a dispatched message in place of ambient thread-locals.
/// Built from the envelope's own trace/service metadata; falls back to a
/// fresh correlation id when the envelope carries none of its own.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub service_name: Option<String>,
    pub correlation_id: String,
}

impl HandlerContext {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            trace_id: envelope.get(KEY_TRACE_ID).map(str::to_string),
            span_id: envelope.get(KEY_SPAN_ID).map(str::to_string),
            service_name: envelope.get(KEY_SERVICE_NAME).map(str::to_string),
            correlation_id: envelope.uuid.to_string(),
        }
    }

    pub fn fresh() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }
}
