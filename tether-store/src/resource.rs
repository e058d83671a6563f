//! Resource containers
//!
//! A resource container is the per-tenant home of one store's state: a
//! state cell plus a one-time initialization side effect and its
//! teardown. Containers are created lazily by the router and owned by
//! its registry; callers only ever borrow them.

use crate::cell::StateCell;
use crate::tenant::TenantHandle;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cleanup hook returned by a resource initializer, invoked exactly once
/// on container disposal
pub type Teardown = Box<dyn FnOnce() + Send>;

/// `TypeId`-keyed storage for runtime extensions
///
/// Initializers stash handles here (e.g. a sync controller) for actions
/// and sources to retrieve later without re-deriving them.
pub struct ExtensionMap {
    entries: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ExtensionMap {
    fn new() -> Self {
        ExtensionMap {
            entries: DashMap::new(),
        }
    }

    /// Store an extension value, replacing any previous one of the same type
    pub fn insert<E: Send + Sync + 'static>(&self, extension: E) {
        self.entries.insert(TypeId::of::<E>(), Arc::new(extension));
    }

    /// Retrieve an extension by type
    pub fn get<E: Send + Sync + 'static>(&self) -> Option<Arc<E>> {
        self.entries.get(&TypeId::of::<E>()).map(|entry| {
            // Entries are keyed by their own TypeId, so the downcast holds
            entry
                .value()
                .clone()
                .downcast::<E>()
                .expect("type mismatch in extension map")
        })
    }
}

/// The resolved environment an action or selector runs in: the
/// container's state cell, the tenant it serves, and its extensions
pub struct StoreContext<S> {
    state: Arc<StateCell<S>>,
    tenant: TenantHandle,
    extensions: Arc<ExtensionMap>,
}

impl<S> Clone for StoreContext<S> {
    fn clone(&self) -> Self {
        StoreContext {
            state: self.state.clone(),
            tenant: self.tenant.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> StoreContext<S> {
    /// The container's state cell
    pub fn state(&self) -> &Arc<StateCell<S>> {
        &self.state
    }

    /// The tenant this container serves
    pub fn tenant(&self) -> &TenantHandle {
        &self.tenant
    }

    /// Runtime extensions stashed by the initializer
    pub fn extensions(&self) -> &ExtensionMap {
        &self.extensions
    }
}

type InitialState<S> = Box<dyn Fn(&TenantHandle) -> S + Send + Sync>;
type Initialize<S> = Box<dyn Fn(&StoreContext<S>) -> Teardown + Send + Sync>;

/// Definition of a resource: how to build its initial state and which
/// side effects to start when a container is created
pub struct ResourceSpec<S> {
    name: &'static str,
    initial: InitialState<S>,
    initialize: Option<Initialize<S>>,
}

impl<S: Send + Sync + 'static> ResourceSpec<S> {
    /// Define a resource with the given name and initial state
    pub fn new(
        name: &'static str,
        initial: impl Fn(&TenantHandle) -> S + Send + Sync + 'static,
    ) -> Self {
        ResourceSpec {
            name,
            initial: Box::new(initial),
            initialize: None,
        }
    }

    /// Attach a one-time initialization side effect.
    ///
    /// It runs exactly once per container and must return the teardown
    /// that undoes it.
    pub fn with_initialize(
        mut self,
        initialize: impl Fn(&StoreContext<S>) -> Teardown + Send + Sync + 'static,
    ) -> Self {
        self.initialize = Some(Box::new(initialize));
        self
    }

    /// Resource name, used as part of the registry key
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A live container: one per distinct store key per resource name
pub struct ResourceContainer<S> {
    name: &'static str,
    context: StoreContext<S>,
    teardown: Mutex<Option<Teardown>>,
    disposed: AtomicBool,
}

impl<S: Send + Sync + 'static> ResourceContainer<S> {
    /// Build a container for `tenant`, running the spec's initializer
    pub(crate) fn create(spec: &ResourceSpec<S>, tenant: TenantHandle) -> Arc<Self> {
        let state = Arc::new(StateCell::new((spec.initial)(&tenant)));
        let context = StoreContext {
            state,
            tenant,
            extensions: Arc::new(ExtensionMap::new()),
        };
        let container = Arc::new(ResourceContainer {
            name: spec.name,
            context,
            teardown: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        if let Some(initialize) = &spec.initialize {
            let teardown = initialize(&container.context);
            *container.teardown.lock() = Some(teardown);
        }
        debug!(resource = spec.name, "container created");
        container
    }

    /// The container's resolved context
    pub fn context(&self) -> &StoreContext<S> {
        &self.context
    }

    /// The container's state cell
    pub fn state(&self) -> &Arc<StateCell<S>> {
        self.context.state()
    }

    /// Run the teardown and close the state cell. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let teardown = self.teardown.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
        self.context.state.close();
        debug!(resource = self.name, "container disposed");
    }

    /// Whether the container has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<S> Drop for ResourceContainer<S> {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            if let Some(teardown) = self.teardown.lock().take() {
                teardown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tether_types::TenantConfig;

    fn handle() -> TenantHandle {
        TenantHandle::new(TenantConfig::new())
    }

    #[test]
    fn test_initialize_runs_once_and_teardown_once() {
        let inits = Arc::new(AtomicU32::new(0));
        let teardowns = Arc::new(AtomicU32::new(0));

        let init_count = inits.clone();
        let teardown_count = teardowns.clone();
        let spec = ResourceSpec::new("counter", |_| 0u32).with_initialize(move |_ctx| {
            init_count.fetch_add(1, Ordering::SeqCst);
            let teardown_count = teardown_count.clone();
            Box::new(move || {
                teardown_count.fetch_add(1, Ordering::SeqCst);
            })
        });

        let container = ResourceContainer::create(&spec, handle());
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        container.dispose();
        container.dispose();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(container.is_disposed());
    }

    #[test]
    fn test_disposed_container_state_is_closed() {
        let spec = ResourceSpec::new("counter", |_| 0u32);
        let container = ResourceContainer::create(&spec, handle());
        container.dispose();
        assert!(container.state().is_closed());
    }

    #[test]
    fn test_extension_roundtrip() {
        let spec = ResourceSpec::new("counter", |_| 0u32);
        let container = ResourceContainer::create(&spec, handle());

        container.context().extensions().insert(42u64);
        assert_eq!(container.context().extensions().get::<u64>().as_deref(), Some(&42));
        assert!(container.context().extensions().get::<String>().is_none());
    }
}
