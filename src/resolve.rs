//! Dependency resolution for handlers.
//!
//! The event bus never constructs handlers itself. For every delivered message
//! it asks a `ServiceProvider` for a fresh `ResolutionScope` and resolves each
//! registered handler type from it. `ServiceContainer` is the bundled provider.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A resolved service instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Creates isolated resolution scopes.
pub trait ServiceProvider: Send + Sync {
    /// Open a new scope. Scoped services are never shared between scopes.
    fn create_scope(&self) -> Box<dyn ResolutionScope + '_>;
}

/// Resolves service instances by type.
pub trait ResolutionScope: Send + Sync {
    /// Return an instance of the service identified by `service`, or `None`
    /// when nothing is registered for it.
    fn resolve_any(&self, service: TypeId) -> Option<Instance>;
}

impl dyn ResolutionScope + '_ {
    /// Typed resolve.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve_any(TypeId::of::<T>())?.downcast::<T>().ok()
    }
}

type Factory = Arc<dyn Fn(&dyn ResolutionScope) -> Instance + Send + Sync>;

#[derive(Clone)]
enum Registration {
    /// New instance on every resolve.
    Transient(Factory),
    /// One instance per scope.
    Scoped(Factory),
    /// One instance for the container's lifetime.
    Singleton(Instance),
}

/// Service container with transient, scoped and singleton lifetimes.
///
/// Populated during startup, then handed to the event bus as its provider.
///
/// ```ignore
/// let mut services = ServiceContainer::new();
/// services.add_singleton(InMemoryTransferRepository::default());
/// services.add_transient(|scope| TransferLogHandler::new(
///     scope.resolve::<InMemoryTransferRepository>().expect("repository registered"),
/// ));
/// ```
#[derive(Clone, Default)]
pub struct ServiceContainer {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, built by `factory` on every resolve.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ResolutionScope) -> T + Send + Sync + 'static,
    {
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration::Transient(Arc::new(move |scope| Arc::new(factory(scope)) as Instance)),
        );
        self
    }

    /// Register `T`, built by `factory` once per scope.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ResolutionScope) -> T + Send + Sync + 'static,
    {
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration::Scoped(Arc::new(move |scope| Arc::new(factory(scope)) as Instance)),
        );
        self
    }

    /// Register a shared `T` instance.
    pub fn add_singleton<T: Send + Sync + 'static>(&mut self, instance: T) -> &mut Self {
        self.add_singleton_arc(Arc::new(instance))
    }

    /// Register an already shared `T` instance.
    pub fn add_singleton_arc<T: Send + Sync + 'static>(&mut self, instance: Arc<T>) -> &mut Self {
        self.registrations
            .insert(TypeId::of::<T>(), Registration::Singleton(instance));
        self
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }
}

impl ServiceProvider for ServiceContainer {
    fn create_scope(&self) -> Box<dyn ResolutionScope + '_> {
        Box::new(ContainerScope {
            container: self,
            scoped: Mutex::new(HashMap::new()),
        })
    }
}

/// Scope over a `ServiceContainer`, caching scoped instances.
struct ContainerScope<'a> {
    container: &'a ServiceContainer,
    scoped: Mutex<HashMap<TypeId, Instance>>,
}

impl ResolutionScope for ContainerScope<'_> {
    fn resolve_any(&self, service: TypeId) -> Option<Instance> {
        match self.container.registrations.get(&service)? {
            Registration::Transient(factory) => Some(factory(self)),
            Registration::Singleton(instance) => Some(Arc::clone(instance)),
            Registration::Scoped(factory) => {
                if let Some(existing) = self
                    .scoped
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&service)
                {
                    return Some(Arc::clone(existing));
                }

                // Built without holding the lock; the factory may resolve
                // other scoped services.
                let instance = factory(self);
                let mut scoped = self.scoped.lock().unwrap_or_else(PoisonError::into_inner);
                Some(Arc::clone(scoped.entry(service).or_insert(instance)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Repository {
        id: usize,
    }

    struct Handler {
        repository: Arc<Repository>,
    }

    struct Clock;

    fn counting_container() -> (ServiceContainer, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut container = ServiceContainer::new();
        container
            .add_scoped(move |_| Repository {
                id: counter.fetch_add(1, Ordering::SeqCst),
            })
            .add_transient(|scope| Handler {
                repository: scope.resolve::<Repository>().unwrap(),
            });
        (container, built)
    }

    #[test]
    fn test_unregistered_service_resolves_to_none() {
        let container = ServiceContainer::new();
        let scope = container.create_scope();
        assert!(scope.resolve::<Clock>().is_none());
    }

    #[test]
    fn test_transient_builds_new_instance_each_time() {
        let (container, _) = counting_container();
        let scope = container.create_scope();

        let first = scope.resolve::<Handler>().unwrap();
        let second = scope.resolve::<Handler>().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_scoped_is_shared_within_scope() {
        let (container, built) = counting_container();
        let scope = container.create_scope();

        let first = scope.resolve::<Handler>().unwrap();
        let second = scope.resolve::<Handler>().unwrap();

        assert!(Arc::ptr_eq(&first.repository, &second.repository));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scoped_is_not_shared_across_scopes() {
        let (container, built) = counting_container();

        let first = container.create_scope().resolve::<Repository>().unwrap();
        let second = container.create_scope().resolve::<Repository>().unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_singleton_is_shared_across_scopes() {
        let mut container = ServiceContainer::new();
        container.add_singleton(Clock);

        let first = container.create_scope().resolve::<Clock>().unwrap();
        let second = container.create_scope().resolve::<Clock>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(container.contains::<Clock>());
    }
}
