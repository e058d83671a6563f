//! Consumer-facing sync store
//!
//! Wires the store substrate and the engine together: a resource spec
//! whose initializer starts one engine per container, a snapshot
//! selector with the subscriber-bookkeeping hook, and the two calls
//! consumers see — `get_state` and `resolve`.

use crate::engine::{self, SyncConfig, SyncController};
use crate::error::SyncError;
use crate::state::{EntrySnapshot, SyncState};
use crate::transport::Transport;
use std::sync::Arc;
use tether_store::{
    ResourceSpec, SelectorContext, SourceSpec, StateSource, StoreContext, StoreError, StoreRouter,
    Teardown, TenantHandle,
};
use tether_types::{EntryKey, ShapeId, SubscriberId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Addressing for one cache entry: its key, the shape it batches under,
/// and the opaque params its query needs
#[derive(Debug, Clone)]
pub struct KeyParams {
    pub key: EntryKey,
    pub shape: ShapeId,
    pub params: serde_json::Value,
}

impl KeyParams {
    pub fn new(key: impl Into<String>, shape: impl Into<String>) -> Self {
        KeyParams {
            key: EntryKey::new(key),
            shape: ShapeId::new(shape),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Options for a resolve-once call
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Abort signal; firing it settles the call with
    /// [`SyncError::Aborted`] and clears the registration
    pub signal: Option<CancellationToken>,
}

impl ResolveOptions {
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Source type handed to consumers of a sync store
pub type EntrySource<V> = StateSource<SyncState<V>, KeyParams, EntrySnapshot<V>>;

fn entry_selector<V: Clone + Send + Sync + 'static>(
    ctx: &SelectorContext<SyncState<V>>,
    params: &KeyParams,
) -> Result<EntrySnapshot<V>, StoreError> {
    let state = ctx.state();
    if let Some(fatal) = &state.fatal {
        return Err(StoreError::from_shared(fatal.clone()));
    }
    match state.entries.get(&params.key) {
        Some(entry) => {
            if let Some(error) = &entry.error {
                return Err(StoreError::from_shared(error.clone()));
            }
            Ok(EntrySnapshot {
                data: entry.data.clone(),
                pending: entry.pending,
                last_fetch_at: entry.last_fetch_at,
            })
        }
        None => Ok(EntrySnapshot::untracked()),
    }
}

fn subscribe_hook<V: Clone + Send + Sync + 'static>(
    ctx: &StoreContext<SyncState<V>>,
    params: &KeyParams,
) -> Teardown {
    let id = SubscriberId::next();
    let state = ctx.state().clone();
    state.set("sync/subscribe", |s| {
        s.added_subscriber(&params.key, &params.shape, &params.params, id)
    });
    let key = params.key.clone();
    Box::new(move || {
        state.set("sync/unsubscribe", |s| s.removed_subscriber(&key, id));
    })
}

/// A remote-backed store: shared entries per tenant, batched fetches,
/// push-feed reconciliation, grace-delayed reclamation
pub struct SyncStore<T: Transport> {
    router: StoreRouter,
    spec: Arc<ResourceSpec<SyncState<T::Value>>>,
    source: SourceSpec<SyncState<T::Value>, KeyParams, EntrySnapshot<T::Value>>,
    transport_tx: Arc<watch::Sender<Arc<T>>>,
}

impl<T: Transport> SyncStore<T>
where
    T::Value: PartialEq,
{
    /// Build a store named `name` over `transport`, routed by `router`
    pub fn new(name: &'static str, transport: T, router: StoreRouter, config: SyncConfig) -> Self {
        let (transport_tx, transport_rx) = watch::channel(Arc::new(transport));
        let spec = {
            let transport_rx = transport_rx.clone();
            Arc::new(
                ResourceSpec::new(name, |_| SyncState::<T::Value>::default()).with_initialize(move |ctx| {
                    let (controller, shutdown) =
                        engine::start(ctx.state().clone(), transport_rx.clone(), config.clone());
                    ctx.extensions().insert(controller);
                    Box::new(move || shutdown.cancel())
                }),
            )
        };
        let source = SourceSpec::new(entry_selector::<T::Value>)
            .with_on_subscribe(subscribe_hook::<T::Value>);
        SyncStore {
            router,
            spec,
            source,
            transport_tx: Arc::new(transport_tx),
        }
    }

    /// A derived view of one entry for `tenant`.
    ///
    /// Two calls with identical tenant and params observe the same
    /// underlying entry; the first observer of a source starts the
    /// entry's subscription bookkeeping.
    pub fn get_state(
        &self,
        tenant: &TenantHandle,
        params: KeyParams,
    ) -> Result<EntrySource<T::Value>, StoreError> {
        let container = self.router.resolve(&self.spec, tenant)?;
        Ok(StateSource::new(
            container.context().clone(),
            params,
            self.source.clone(),
        ))
    }

    /// One-shot read: joins the next batch like a subscription but
    /// settles on the first non-empty value and leaves no observation
    /// behind.
    pub async fn resolve(
        &self,
        tenant: &TenantHandle,
        params: KeyParams,
        options: ResolveOptions,
    ) -> Result<T::Value, SyncError> {
        let container = self.router.resolve(&self.spec, tenant)?;
        let controller = container
            .context()
            .extensions()
            .get::<SyncController<T::Value>>()
            .ok_or(SyncError::EngineStopped)?;
        controller
            .resolve(params.key, params.shape, params.params, options.signal)
            .await
    }

    /// Swap in a reconfigured transport (e.g. after a token refresh).
    /// Engines pick it up at their next dispatch.
    pub fn set_transport(&self, transport: T) {
        self.transport_tx.send_replace(Arc::new(transport));
    }

    /// The router this store shares containers through
    pub fn router(&self) -> &StoreRouter {
        &self.router
    }
}
