//! Multi-tenancy routing
//!
//! The router maps tenant configurations onto shared container
//! instances. Two partition functions control the mapping: the instance
//! key decides which tenants are counted together for disposal, the
//! store key decides which tenants share one container. The split lets
//! several sub-stores (e.g. one per perspective) live under a single
//! disposal scope.
//!
//! Registries are explicit maps owned by the router instance; one router
//! per resource family, constructed at startup and passed to bound
//! callables.

use crate::action::Action;
use crate::error::StoreError;
use crate::resource::{ResourceContainer, ResourceSpec};
use crate::source::{SourceSpec, StateSource};
use crate::tenant::TenantHandle;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Synchronous partition over a tenant configuration.
///
/// Returns an error when a required identifying field is absent;
/// callers must handle it or guarantee configuration.
pub type PartitionFn = fn(&tether_types::TenantConfig) -> Result<String, StoreError>;

/// Pre-built partition functions
pub mod partition {
    use crate::error::StoreError;
    use tether_types::TenantConfig;

    /// One instance per `project_id.dataset` pair
    pub fn by_dataset(config: &TenantConfig) -> Result<String, StoreError> {
        let project_id = config
            .project_id
            .as_deref()
            .ok_or(StoreError::MissingTenantField {
                field: "project_id",
                partition: "dataset",
            })?;
        let dataset = config
            .dataset
            .as_deref()
            .ok_or(StoreError::MissingTenantField {
                field: "dataset",
                partition: "dataset",
            })?;
        Ok(format!("{project_id}.{dataset}"))
    }

    /// One instance per external library id
    pub fn by_library(config: &TenantConfig) -> Result<String, StoreError> {
        config
            .library_id
            .clone()
            .ok_or(StoreError::MissingTenantField {
                field: "library_id",
                partition: "library",
            })
    }

    /// One instance per addressable resource: dataset when configured,
    /// library otherwise
    pub fn by_resource(config: &TenantConfig) -> Result<String, StoreError> {
        if config.project_id.is_some() && config.dataset.is_some() {
            return by_dataset(config);
        }
        config
            .library_id
            .clone()
            .ok_or(StoreError::MissingTenantField {
                field: "project_id.dataset or library_id",
                partition: "resource",
            })
    }

    /// A single shared instance regardless of tenant
    pub fn global(_config: &TenantConfig) -> Result<String, StoreError> {
        Ok("global".to_string())
    }
}

struct RegistryEntry {
    container: Arc<dyn Any + Send + Sync>,
    dispose: Arc<dyn Fn() + Send + Sync>,
}

struct RouterInner {
    instance_key: PartitionFn,
    store_key: PartitionFn,
    /// Live tenant handles per instance key
    members: Mutex<HashMap<String, HashSet<u64>>>,
    /// Registry keys created under each instance key
    owned: Mutex<HashMap<String, HashSet<String>>>,
    /// Shared container instances per registry key
    containers: Mutex<HashMap<String, RegistryEntry>>,
}

impl RouterInner {
    fn release(&self, instance_key: &str, handle_id: u64) {
        let emptied = {
            let mut members = self.members.lock();
            match members.get_mut(instance_key) {
                Some(handles) => {
                    handles.remove(&handle_id);
                    if handles.is_empty() {
                        members.remove(instance_key);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if !emptied {
            return;
        }

        let registry_keys = self.owned.lock().remove(instance_key).unwrap_or_default();
        let entries: Vec<RegistryEntry> = {
            let mut containers = self.containers.lock();
            registry_keys
                .iter()
                .filter_map(|key| containers.remove(key))
                .collect()
        };
        debug!(
            instance_key,
            count = entries.len(),
            "last tenant detached; disposing shared containers"
        );
        // Disposal runs outside the registry locks so teardowns may call
        // back into the store layer
        for entry in entries {
            (entry.dispose)();
        }
    }
}

/// Maps tenant configurations to shared, reference-counted container
/// instances
#[derive(Clone)]
pub struct StoreRouter {
    inner: Arc<RouterInner>,
}

impl StoreRouter {
    /// Router whose disposal scope and container sharing use the same
    /// partition
    pub fn new(instance_key: PartitionFn) -> Self {
        Self::with_store_key(instance_key, instance_key)
    }

    /// Router with distinct disposal (`instance_key`) and sharing
    /// (`store_key`) partitions.
    ///
    /// The store key must partition at least as finely as the instance
    /// key, so that every container belongs to exactly one disposal
    /// scope.
    pub fn with_store_key(instance_key: PartitionFn, store_key: PartitionFn) -> Self {
        StoreRouter {
            inner: Arc::new(RouterInner {
                instance_key,
                store_key,
                members: Mutex::new(HashMap::new()),
                owned: Mutex::new(HashMap::new()),
                containers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve (or lazily create) the shared container for `handle`.
    ///
    /// Registers the handle for disposal tracking; when the last handle
    /// of an instance key disposes, every container owned by that key is
    /// disposed with it.
    pub fn resolve<S: Send + Sync + 'static>(
        &self,
        spec: &Arc<ResourceSpec<S>>,
        handle: &TenantHandle,
    ) -> Result<Arc<ResourceContainer<S>>, StoreError> {
        if handle.is_disposed() {
            return Err(StoreError::HandleDisposed);
        }
        let instance_key = (self.inner.instance_key)(handle.config())?;
        let store_key = (self.inner.store_key)(handle.config())?;
        let registry_key = format!("{}:{}", spec.name(), store_key);

        {
            let mut members = self.inner.members.lock();
            let handles = members.entry(instance_key.clone()).or_default();
            if handles.insert(handle.id()) {
                // First sight of this handle under this instance key
                let router = self.inner.clone();
                let key = instance_key.clone();
                let handle_id = handle.id();
                handle.on_dispose(move || router.release(&key, handle_id));
            }
        }
        self.inner
            .owned
            .lock()
            .entry(instance_key)
            .or_default()
            .insert(registry_key.clone());

        let mut containers = self.inner.containers.lock();
        if let Some(entry) = containers.get(&registry_key) {
            return entry
                .container
                .clone()
                .downcast::<ResourceContainer<S>>()
                .map_err(|_| StoreError::StateTypeMismatch { name: spec.name() });
        }

        // The initializer runs under the registry lock; it must not
        // resolve through the router
        let container = ResourceContainer::create(spec, handle.clone());
        let dispose = {
            let container = container.clone();
            Arc::new(move || container.dispose())
        };
        containers.insert(
            registry_key,
            RegistryEntry {
                container: container.clone(),
                dispose,
            },
        );
        Ok(container)
    }

    /// Bind an action for ambient calls through this router
    pub fn bind<S, A, R>(&self, action: Action<S, A, R>) -> BoundAction<S, A, R>
    where
        S: Send + Sync + 'static,
    {
        BoundAction {
            router: self.clone(),
            action,
        }
    }

    /// Bind a source definition for ambient instantiation through this
    /// router
    pub fn bind_source<S, P, U>(
        &self,
        spec: Arc<ResourceSpec<S>>,
        source: SourceSpec<S, P, U>,
    ) -> BoundSource<S, P, U>
    where
        S: Send + Sync + 'static,
    {
        BoundSource {
            router: self.clone(),
            spec,
            source,
        }
    }

    /// Number of live container instances (for diagnostics and tests)
    pub fn container_count(&self) -> usize {
        self.inner.containers.lock().len()
    }
}

/// An action callable with a bare tenant handle
pub struct BoundAction<S, A, R> {
    router: StoreRouter,
    action: Action<S, A, R>,
}

impl<S, A, R> Clone for BoundAction<S, A, R> {
    fn clone(&self) -> Self {
        BoundAction {
            router: self.router.clone(),
            action: self.action.clone(),
        }
    }
}

impl<S, A, R> BoundAction<S, A, R>
where
    S: Send + Sync + 'static,
{
    /// Resolve the tenant's container and run the action against it
    pub fn call(&self, handle: &TenantHandle, args: A) -> Result<R, StoreError> {
        let container = self.router.resolve(self.action.spec(), handle)?;
        Ok(self.action.call_in(container.context(), args))
    }

    /// Run against an already-resolved context
    pub fn call_in(&self, context: &crate::resource::StoreContext<S>, args: A) -> R {
        self.action.call_in(context, args)
    }
}

/// A source definition instantiable with a bare tenant handle
pub struct BoundSource<S, P, U> {
    router: StoreRouter,
    spec: Arc<ResourceSpec<S>>,
    source: SourceSpec<S, P, U>,
}

impl<S, P, U> Clone for BoundSource<S, P, U> {
    fn clone(&self) -> Self {
        BoundSource {
            router: self.router.clone(),
            spec: self.spec.clone(),
            source: self.source.clone(),
        }
    }
}

impl<S, P, U> BoundSource<S, P, U>
where
    S: Send + Sync + 'static,
    P: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    /// Resolve the tenant's container and build a source over it
    pub fn get(&self, handle: &TenantHandle, params: P) -> Result<StateSource<S, P, U>, StoreError> {
        let container = self.router.resolve(&self.spec, handle)?;
        Ok(StateSource::new(
            container.context().clone(),
            params,
            self.source.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::TenantConfig;

    fn dataset_handle(project: &str, dataset: &str) -> TenantHandle {
        TenantHandle::new(TenantConfig::new().with_project(project, dataset))
    }

    #[test]
    fn test_partition_by_dataset() {
        let config = TenantConfig::new().with_project("p1", "blog");
        assert_eq!(partition::by_dataset(&config).unwrap(), "p1.blog");

        let missing = TenantConfig::new();
        assert!(matches!(
            partition::by_dataset(&missing),
            Err(StoreError::MissingTenantField { field: "project_id", .. })
        ));
    }

    #[test]
    fn test_partition_by_resource_prefers_dataset() {
        let both = TenantConfig::new().with_project("p1", "blog").with_library("lib9");
        assert_eq!(partition::by_resource(&both).unwrap(), "p1.blog");

        let library = TenantConfig::new().with_library("lib9");
        assert_eq!(partition::by_resource(&library).unwrap(), "lib9");

        assert!(partition::by_resource(&TenantConfig::new()).is_err());
    }

    #[test]
    fn test_same_dataset_shares_container() {
        let router = StoreRouter::new(partition::by_dataset);
        let spec = Arc::new(ResourceSpec::new("counter", |_| 0u32));

        let first = dataset_handle("p1", "blog");
        let second = dataset_handle("p1", "blog");

        let a = router.resolve(&spec, &first).unwrap();
        let b = router.resolve(&spec, &second).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(router.container_count(), 1);

        let other = dataset_handle("p1", "staging");
        let c = router.resolve(&spec, &other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(router.container_count(), 2);
    }

    #[test]
    fn test_last_handle_disposes_shared_container() {
        let router = StoreRouter::new(partition::by_dataset);
        let spec = Arc::new(ResourceSpec::new("counter", |_| 0u32));

        let first = dataset_handle("p1", "blog");
        let second = dataset_handle("p1", "blog");
        let container = router.resolve(&spec, &first).unwrap();
        router.resolve(&spec, &second).unwrap();

        first.dispose();
        assert!(!container.is_disposed());
        assert_eq!(router.container_count(), 1);

        second.dispose();
        assert!(container.is_disposed());
        assert_eq!(router.container_count(), 0);
    }

    #[test]
    fn test_store_key_split_scopes_disposal_to_instance() {
        // Same disposal scope (dataset), separate containers per
        // perspective
        fn by_perspective(config: &TenantConfig) -> Result<String, StoreError> {
            let base = partition::by_dataset(config)?;
            Ok(match &config.perspective {
                Some(perspective) => format!("{base}/{perspective}"),
                None => base,
            })
        }

        let router = StoreRouter::with_store_key(partition::by_dataset, by_perspective);
        let spec = Arc::new(ResourceSpec::new("counter", |_| 0u32));

        let published = TenantHandle::new(
            TenantConfig::new()
                .with_project("p1", "blog")
                .with_perspective("published"),
        );
        let drafts = TenantHandle::new(
            TenantConfig::new()
                .with_project("p1", "blog")
                .with_perspective("drafts"),
        );

        let a = router.resolve(&spec, &published).unwrap();
        let b = router.resolve(&spec, &drafts).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(router.container_count(), 2);

        // Both containers share the dataset disposal scope
        published.dispose();
        assert_eq!(router.container_count(), 2);
        drafts.dispose();
        assert_eq!(router.container_count(), 0);
        assert!(a.is_disposed());
        assert!(b.is_disposed());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let router = StoreRouter::new(partition::global);
        let spec_u32 = Arc::new(ResourceSpec::new("shared", |_| 0u32));
        let spec_string = Arc::new(ResourceSpec::<String>::new("shared", |_| String::new()));

        let handle = TenantHandle::new(TenantConfig::new());
        router.resolve(&spec_u32, &handle).unwrap();
        assert!(matches!(
            router.resolve(&spec_string, &handle),
            Err(StoreError::StateTypeMismatch { name: "shared" })
        ));
    }

    #[test]
    fn test_disposed_handle_is_rejected() {
        let router = StoreRouter::new(partition::global);
        let spec = Arc::new(ResourceSpec::new("counter", |_| 0u32));
        let handle = TenantHandle::new(TenantConfig::new());
        handle.dispose();
        assert!(matches!(
            router.resolve(&spec, &handle),
            Err(StoreError::HandleDisposed)
        ));
    }
}
