//! Canonical naming for the CQRS message bus.
//!
//! Maps a message value to a canonical name `service.kind.name.version` and
//! to a sanitized transport topic. See the component design for C1.

use std::fmt;
use thiserror::Error;

/// The two message kinds the bus ever publishes. Events may additionally be
/// scoped by an aggregate name, carried in [`CanonicalName::kind`] instead of
/// a fixed `"event"` literal, matching the original spec's allowance for
/// `kind` to be an aggregate name for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Event,
}

impl MessageKind {
    fn default_segment(self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("canonical name segment '{0}' is empty after trimming")]
    EmptySegment(&'static str),
    #[error("service name is not configured")]
    MissingService,
}

/// The four-segment canonical name `service.kind.name.version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalName {
    pub service: String,
    pub kind: String,
    pub name: String,
    pub version: String,
}

impl CanonicalName {
    pub fn new(
        service: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, NamingError> {
        let service = normalize_segment(service.into(), "service")?;
        let kind = normalize_segment(kind.into(), "kind")?;
        let name = normalize_segment(name.into(), "name")?;
        let version = normalize_segment(version.into(), "version")?;
        Ok(Self {
            service,
            kind,
            name,
            version,
        })
    }

    /// `TopicFor`: lowercase canonical name, spaces replaced with `_`. No
    /// other transformation is applied — the segments are already
    /// lowercased and trimmed by construction, so this is idempotent.
    pub fn topic(&self) -> String {
        self.to_string().replace(' ', "_").to_lowercase()
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.service, self.kind, self.name, self.version)
    }
}

fn normalize_segment(raw: String, field: &'static str) -> Result<String, NamingError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NamingError::EmptySegment(field));
    }
    Ok(trimmed.to_lowercase())
}

/// Explicit name/version carried by a message value (e.g. from envelope
/// metadata on a redelivered message, or set by the caller). Metadata-supplied
/// values always win over reflection-derived ones.
#[derive(Debug, Clone, Default)]
pub struct NameHint {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Reflection-equivalent data a message type can supply about itself, since
/// Rust has no runtime package-path reflection. A message type implements
/// [`Nameable`] to describe itself the way a `domain.<aggregate>.vN.<Type>`
/// package path would in a reflective language.
pub trait Nameable {
    /// The in-memory type name, used as the ultimate snake_case fallback.
    fn type_name() -> &'static str;

    /// Structured schema hint, if the type is described by one (the
    /// `domain.<aggregate>.vN.<Type>` equivalent). Returns `None` to fall
    /// back to snake_case(type_name) at version `v1`.
    fn schema_hint() -> Option<SchemaHint> {
        None
    }

    /// Explicit metadata override, if the concrete value carries one (e.g.
    /// it was deserialized from an envelope that already had `type_name`/
    /// `type_version` set). Default: no override.
    fn name_hint(&self) -> NameHint {
        NameHint::default()
    }
}

/// The reflective-path equivalent: `aggregate`, `version`, `name`.
#[derive(Debug, Clone)]
pub struct SchemaHint {
    pub aggregate: Option<String>,
    pub version: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CanonicalNamer {
    service: String,
}

impl CanonicalNamer {
    pub fn new(service: impl Into<String>) -> Result<Self, NamingError> {
        let service = service.into();
        let trimmed = service.trim();
        if trimmed.is_empty() {
            return Err(NamingError::MissingService);
        }
        Ok(Self {
            service: trimmed.to_lowercase(),
        })
    }

    /// `NameFor(kind, value)`. Precedence, per spec: explicit metadata wins
    /// over reflection, which wins over the snake_case(type_name)/v1
    /// fallback.
    pub fn name_for<T: Nameable>(&self, kind: MessageKind, value: &T) -> Result<CanonicalName, NamingError> {
        let hint = value.name_hint();
        if let Some(name) = hint.name {
            let version = hint.version.unwrap_or_else(|| "v1".to_string());
            return CanonicalName::new(&self.service, kind.default_segment(), name, version);
        }

        if let Some(schema) = T::schema_hint() {
            let kind_segment = match (kind, schema.aggregate) {
                (MessageKind::Event, Some(aggregate)) => aggregate,
                _ => kind.default_segment().to_string(),
            };
            let name = strip_aggregate_prefix(&schema.name, &kind_segment);
            return CanonicalName::new(&self.service, kind_segment, name, schema.version);
        }

        let name = to_snake_case(T::type_name());
        CanonicalName::new(&self.service, kind.default_segment(), name, "v1")
    }

    pub fn topic_for(&self, name: &CanonicalName) -> String {
        name.topic()
    }
}

/// For events, strip a leading aggregate prefix from the snake_case name if
/// present (`order_created` under aggregate `order` becomes `created`'s
/// sibling naming is avoided — spec says "strip... if present", so we only
/// strip an exact `aggregate_` prefix).
fn strip_aggregate_prefix(name: &str, aggregate: &str) -> String {
    let snake = to_snake_case(name);
    let prefix = format!("{}_", to_snake_case(aggregate));
    snake.strip_prefix(&prefix).map(str::to_string).unwrap_or(snake)
}

/// Convert `PascalCase`/`camelCase`/mixed identifiers to `snake_case`.
pub fn to_snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_is_lower_or_digit = false;
    for ch in input.chars() {
        if ch.is_uppercase() {
            if prev_is_lower_or_digit {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_is_lower_or_digit = false;
        } else if ch == ' ' || ch == '-' {
            out.push('_');
            prev_is_lower_or_digit = false;
        } else {
            out.push(ch);
            prev_is_lower_or_digit = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}
