//! # Service Context
//!
//! A [`Context`] maps types to shared service instances. Every fiber carries
//! one in a built-in fiber ref: forks start with the parent's context, and
//! joins keep the parent's, so a child providing a service never leaks it
//! back into the caller.
//!
//! ```rust,ignore
//! use skein::Effect;
//!
//! struct Db { url: String }
//!
//! let query = Effect::service::<Db>().map(|db| db.url.len());
//! let program = Effect::provide_service(Db { url: "mem://".into() }, query);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::effect::Effect;
use crate::error::RuntimeError;
use crate::fiber_ref::FiberRef;
use crate::value::Value;

type Service = Arc<dyn Any + Send + Sync>;

/// Services keyed by type.
#[derive(Clone, Default)]
pub struct Context {
    services: Arc<HashMap<TypeId, (&'static str, Service)>>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `service`, replacing any previous service of the same type.
    pub fn add<S: Send + Sync + 'static>(self, service: S) -> Self {
        self.add_arc(Arc::new(service))
    }

    /// Add a shared service.
    pub fn add_arc<S: Send + Sync + 'static>(mut self, service: Arc<S>) -> Self {
        Arc::make_mut(&mut self.services).insert(
            TypeId::of::<S>(),
            (std::any::type_name::<S>(), service as Service),
        );
        self
    }

    /// The service of type `S`, if present.
    pub fn get<S: Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        let (_, service) = self.services.get(&TypeId::of::<S>())?;
        service.clone().downcast::<S>().ok()
    }

    /// Whether a service of type `S` is present.
    pub fn contains<S: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Services in `other` are added to (and override) this context's.
    pub fn merge(mut self, other: &Context) -> Self {
        if !other.services.is_empty() {
            let services = Arc::make_mut(&mut self.services);
            for (id, entry) in other.services.iter() {
                services.insert(*id, entry.clone());
            }
        }
        self
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is present.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.services.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        f.debug_struct("Context").field("services", &names).finish()
    }
}

fn context_ref() -> &'static FiberRef<Context> {
    static CONTEXT: OnceLock<FiberRef<Context>> = OnceLock::new();
    CONTEXT.get_or_init(|| {
        FiberRef::with_policies(Context::new(), Context::clone, |parent, _| parent.clone())
    })
}

impl Effect<()> {
    /// Run `effect` with `service` available to [`Effect::service`].
    pub fn provide_service<S, A, E>(service: S, effect: Effect<A, E>) -> Effect<A, E>
    where
        S: Send + Sync + 'static,
        A: Value,
        E: Value,
    {
        let service = Arc::new(service);
        context_ref().locally_with(move |ctx| ctx.add_arc(service.clone()), effect)
    }

    /// Run `effect` with every service of `context` added.
    pub fn provide_context<A: Value, E: Value>(context: Context, effect: Effect<A, E>) -> Effect<A, E> {
        context_ref().locally_with(move |ctx| ctx.merge(&context), effect)
    }

    /// The running fiber's context.
    pub fn context() -> Effect<Context> {
        context_ref().get()
    }

    /// Look up the service of type `S`.
    pub fn service<S: Send + Sync + 'static>() -> Effect<Arc<S>, RuntimeError> {
        Effect::context().widen().flat_map(|ctx: Context| match ctx.get::<S>() {
            Some(service) => Effect::succeed(service),
            None => Effect::fail(RuntimeError::MissingService(std::any::type_name::<S>())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Port(u16);

    #[test]
    fn test_add_and_get() {
        let ctx = Context::new().add(Port(80)).add("name");
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.get::<Port>().as_deref(), Some(&Port(80)));
        assert_eq!(ctx.get::<&str>().as_deref(), Some(&"name"));
        assert!(ctx.get::<u8>().is_none());
    }

    #[test]
    fn test_add_replaces_same_type() {
        let ctx = Context::new().add(Port(80)).add(Port(443));
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get::<Port>().as_deref(), Some(&Port(443)));
    }

    #[test]
    fn test_merge_overrides() {
        let base = Context::new().add(Port(80)).add(1u8);
        let extra = Context::new().add(Port(8080));
        let merged = base.clone().merge(&extra);
        assert_eq!(merged.get::<Port>().as_deref(), Some(&Port(8080)));
        assert_eq!(merged.get::<u8>().as_deref(), Some(&1));
        assert_eq!(base.get::<Port>().as_deref(), Some(&Port(80)));
    }

    #[test]
    fn test_debug_lists_names() {
        let ctx = Context::new().add(Port(1));
        assert!(format!("{:?}", ctx).contains("Port"));
    }
}
