//! Thread-safe canonical-name → constructor registry (C3).
//!
//! Used by the router (C7) to instantiate a fresh, zero-initialized value of
//! the correct concrete type before unmarshaling an inbound envelope into it.

use cqrs_naming::{CanonicalName, CanonicalNamer, MessageKind, Nameable};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no type is registered for canonical name '{0}'")]
    NotRegistered(String),
    #[error("refusing to register a nil factory for canonical name '{0}'")]
    NilType(String),
    #[error(transparent)]
    Naming(#[from] cqrs_naming::NamingError),
}

/// Produces a fresh, zero-initialized instance, type-erased as `Box<dyn Any + Send>`.
/// The router performs the narrowing downcast back to the handler's declared type.
pub type Factory = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Many-readers/many-writers registry guarded by a single reader-writer
/// lock. All operations are finite and non-blocking beyond lock acquisition.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    entries: Arc<RwLock<HashMap<CanonicalName, Factory>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Register(kind, value)`: computes the canonical name via the namer
    /// from a representative `value`, then stores a factory that produces
    /// `T::default()` on every resolution. Registration is idempotent: a
    /// second registration for the same canonical name simply replaces the
    /// factory (which, for the same `T`, is behaviorally identical).
    pub fn register<T>(
        &self,
        kind: MessageKind,
        namer: &CanonicalNamer,
        value: &T,
    ) -> Result<CanonicalName, RegistryError>
    where
        T: Nameable + Default + Any + Send + 'static,
    {
        let name = namer.name_for(kind, value)?;
        let factory: Factory = Arc::new(|| Box::new(T::default()) as Box<dyn Any + Send>);
        self.entries.write().insert(name.clone(), factory);
        tracing::debug!(canonical_name = %name, "registered message type");
        Ok(name)
    }

    /// Lower-level registration path used by callers that already hold a
    /// type-erased [`Factory`] (e.g. a dynamic plugin loader resolving a
    /// handler by name at startup) rather than a `T: Default` value to probe
    /// [`register`](Self::register) with. Unlike `register`, `factory` is
    /// `Option` so a genuinely absent constructor — the Rust equivalent of
    /// registering a nil factory function — is rejected with
    /// [`RegistryError::NilType`] instead of silently storing nothing.
    pub fn register_factory(&self, name: CanonicalName, factory: Option<Factory>) -> Result<CanonicalName, RegistryError> {
        let factory = factory.ok_or_else(|| RegistryError::NilType(name.to_string()))?;
        self.entries.write().insert(name.clone(), factory);
        tracing::debug!(canonical_name = %name, "registered message type via explicit factory");
        Ok(name)
    }

    /// `Resolve(kind, name) -> (factory, ok)`. `kind` is accepted for parity
    /// with the spec signature but is already encoded in `name.kind`; a
    /// lookup mismatch between the two is treated as "not found" rather than
    /// a separate error, since a mismatched kind can never have been
    /// registered under this `name`.
    pub fn resolve(&self, kind: MessageKind, name: &CanonicalName) -> Option<Factory> {
        if name.kind != kind.to_string() && !matches!(kind, MessageKind::Event) {
            // Events may be keyed by an aggregate name rather than "event";
            // only commands are required to match the literal segment.
            return None;
        }
        self.entries.read().get(name).cloned()
    }

    pub fn resolve_by_name(&self, name: &CanonicalName) -> Result<Factory, RegistryError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct OrderCreated {
        #[allow(dead_code)]
        id: String,
    }

    impl Nameable for OrderCreated {
        fn type_name() -> &'static str {
            "OrderCreated"
        }
    }

    #[test]
    fn register_then_resolve_round_trips() {
        let registry = TypeRegistry::new();
        let namer = CanonicalNamer::new("shortlink").unwrap();
        let name = registry
            .register(MessageKind::Event, &namer, &OrderCreated::default())
            .unwrap();

        let factory = registry.resolve_by_name(&name).unwrap();
        let instance = factory();
        assert!(instance.downcast::<OrderCreated>().is_ok());
    }

    #[test]
    fn resolve_unknown_name_fails_not_registered() {
        let registry = TypeRegistry::new();
        let name = CanonicalName::new("shortlink", "event", "unknown", "v1").unwrap();
        assert!(matches!(
            registry.resolve_by_name(&name),
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[test]
    fn register_factory_rejects_nil_factory() {
        let registry = TypeRegistry::new();
        let name = CanonicalName::new("shortlink", "event", "order_created", "v1").unwrap();
        assert!(matches!(
            registry.register_factory(name, None),
            Err(RegistryError::NilType(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn register_factory_accepts_explicit_factory() {
        let registry = TypeRegistry::new();
        let name = CanonicalName::new("shortlink", "event", "order_created", "v1").unwrap();
        let factory: Factory = Arc::new(|| Box::new(OrderCreated::default()) as Box<dyn Any + Send>);
        registry.register_factory(name.clone(), Some(factory)).unwrap();

        let resolved = registry.resolve_by_name(&name).unwrap();
        assert!(resolved().downcast::<OrderCreated>().is_ok());
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = TypeRegistry::new();
        let namer = CanonicalNamer::new("shortlink").unwrap();
        let name1 = registry.register(MessageKind::Event, &namer, &OrderCreated::default()).unwrap();
        let name2 = registry.register(MessageKind::Event, &namer, &OrderCreated::default()).unwrap();
        assert_eq!(name1, name2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_register_and_resolve_is_linearizable() {
        let registry = TypeRegistry::new();
        let namer = Arc::new(CanonicalNamer::new("shortlink").unwrap());
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let namer = namer.clone();
                let successes = successes.clone();
                thread::spawn(move || {
                    let name = registry
                        .register(MessageKind::Event, &namer, &OrderCreated::default())
                        .unwrap();
                    if registry.resolve_by_name(&name).is_ok() {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 8);
        assert_eq!(registry.len(), 1);
    }
}
