//! Derived state sources
//!
//! A state source is a selector-based view over a container's state:
//! memoized, change-deduplicated, and shared between all observers of
//! the same source instance. Stores attach an `on_subscribe` hook to
//! perform per-key bookkeeping (subscriber counts, batch admission) when
//! a source gains its first observer.

use crate::error::StoreError;
use crate::resource::{StoreContext, Teardown};
use crate::tenant::TenantHandle;
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

/// The environment a selector runs in.
///
/// Contexts are memoized per `(state version, tenant)` so that
/// memoization downstream of a selector sees a stable reference while
/// the state has not changed.
pub struct SelectorContext<S> {
    state: Arc<S>,
    version: u64,
    tenant: TenantHandle,
}

impl<S> SelectorContext<S> {
    /// The state snapshot this selection is computed from
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Version of the snapshot
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The tenant the container serves
    pub fn tenant(&self) -> &TenantHandle {
        &self.tenant
    }
}

type Selector<S, P, U> =
    Arc<dyn Fn(&SelectorContext<S>, &P) -> Result<U, StoreError> + Send + Sync>;
type EqualFn<U> = Arc<dyn Fn(&U, &U) -> bool + Send + Sync>;
type OnSubscribe<S, P> = Arc<dyn Fn(&StoreContext<S>, &P) -> Teardown + Send + Sync>;
type Callback = Arc<dyn Fn() + Send + Sync>;
type Selected<U> = Result<U, StoreError>;

/// Definition of a derived view: the selector plus its equality and
/// subscription hooks
pub struct SourceSpec<S, P, U> {
    selector: Selector<S, P, U>,
    is_equal: EqualFn<U>,
    on_subscribe: Option<OnSubscribe<S, P>>,
}

impl<S, P, U> Clone for SourceSpec<S, P, U> {
    fn clone(&self) -> Self {
        SourceSpec {
            selector: self.selector.clone(),
            is_equal: self.is_equal.clone(),
            on_subscribe: self.on_subscribe.clone(),
        }
    }
}

impl<S, P, U> SourceSpec<S, P, U>
where
    U: PartialEq + 'static,
{
    /// Define a source with the default equality (`==`) on selections
    pub fn new(
        selector: impl Fn(&SelectorContext<S>, &P) -> Result<U, StoreError> + Send + Sync + 'static,
    ) -> Self {
        SourceSpec {
            selector: Arc::new(selector),
            is_equal: Arc::new(|a: &U, b: &U| a == b),
            on_subscribe: None,
        }
    }
}

impl<S, P, U> SourceSpec<S, P, U> {
    /// Replace the equality used for change deduplication
    pub fn with_equality(mut self, is_equal: impl Fn(&U, &U) -> bool + Send + Sync + 'static) -> Self {
        self.is_equal = Arc::new(is_equal);
        self
    }

    /// Attach the hook invoked when a source instance gains its first
    /// observer; its teardown runs when the last observer leaves
    pub fn with_on_subscribe(
        mut self,
        hook: impl Fn(&StoreContext<S>, &P) -> Teardown + Send + Sync + 'static,
    ) -> Self {
        self.on_subscribe = Some(Arc::new(hook));
        self
    }
}

struct SourceRuntime {
    next_observer: u64,
    active: HashSet<u64>,
    teardown: Option<Teardown>,
    driver: Option<JoinHandle<()>>,
}

struct SourceInner<S, P, U> {
    ctx: StoreContext<S>,
    params: P,
    spec: SourceSpec<S, P, U>,
    selected: watch::Sender<Selected<U>>,
    runtime: Mutex<SourceRuntime>,
    callbacks: Mutex<HashMap<u64, Callback>>,
    ctx_cache: Mutex<Option<(u64, Arc<SelectorContext<S>>)>>,
}

/// A live derived view for one `(tenant, params)` pair.
///
/// Clones share the same underlying selection, so the selector runs at
/// most once per state change regardless of observer count.
pub struct StateSource<S, P, U> {
    inner: Arc<SourceInner<S, P, U>>,
}

impl<S, P, U> Clone for StateSource<S, P, U> {
    fn clone(&self) -> Self {
        StateSource {
            inner: self.inner.clone(),
        }
    }
}

fn selected_eq<U>(prev: &Selected<U>, next: &Selected<U>, is_equal: &dyn Fn(&U, &U) -> bool) -> bool {
    match (prev, next) {
        (Ok(a), Ok(b)) => is_equal(a, b),
        // An errored selection stays errored until a successful read
        // replaces it
        (Err(_), Err(_)) => true,
        _ => false,
    }
}

impl<S, P, U> StateSource<S, P, U>
where
    S: Send + Sync + 'static,
    P: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    /// Build a source over `ctx` for the given params
    pub fn new(ctx: StoreContext<S>, params: P, spec: SourceSpec<S, P, U>) -> Self {
        let initial = {
            let context = SelectorContext {
                state: ctx.state().get(),
                version: ctx.state().version(),
                tenant: ctx.tenant().clone(),
            };
            (spec.selector)(&context, &params)
        };
        let (selected, _) = watch::channel(initial);
        StateSource {
            inner: Arc::new(SourceInner {
                ctx,
                params,
                spec,
                selected,
                runtime: Mutex::new(SourceRuntime {
                    next_observer: 1,
                    active: HashSet::new(),
                    teardown: None,
                    driver: None,
                }),
                callbacks: Mutex::new(HashMap::new()),
                ctx_cache: Mutex::new(None),
            }),
        }
    }

    /// Synchronously recompute the selection for the current state.
    ///
    /// Errors recorded in the state (per-key or container-level) are
    /// surfaced here as `Err`.
    pub fn get_current(&self) -> Result<U, StoreError> {
        self.inner.compute()
    }

    /// Register an observer without a callback; useful when only the
    /// subscription lifecycle (and its side effects) is wanted
    pub fn subscribe(&self) -> SubscriptionGuard {
        self.subscribe_inner(None)
    }

    /// Register an observer notified whenever the selection changes per
    /// the source's equality
    pub fn subscribe_with(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionGuard {
        self.subscribe_inner(Some(Arc::new(callback)))
    }

    /// Stream of selections: the current one immediately, then only
    /// changed values. The stream holds an observer registration for its
    /// whole lifetime.
    pub fn changes(&self) -> SourceChanges<U> {
        let guard = self.subscribe();
        SourceChanges {
            stream: WatchStream::new(self.inner.selected.subscribe()),
            _guard: guard,
        }
    }

    fn subscribe_inner(&self, callback: Option<Callback>) -> SubscriptionGuard {
        let (id, first) = {
            let mut runtime = self.inner.runtime.lock();
            let id = runtime.next_observer;
            runtime.next_observer += 1;
            let first = runtime.active.is_empty();
            runtime.active.insert(id);
            (id, first)
        };
        if let Some(callback) = callback {
            self.inner.callbacks.lock().insert(id, callback);
        }
        if first {
            SourceInner::start(&self.inner);
        }
        let inner = self.inner.clone();
        SubscriptionGuard {
            unsub: Some(Box::new(move || SourceInner::remove_observer(&inner, id))),
        }
    }
}

impl<S, P, U> SourceInner<S, P, U>
where
    S: Send + Sync + 'static,
    P: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    fn selector_context(&self) -> Arc<SelectorContext<S>> {
        let version = self.ctx.state().version();
        {
            let cache = self.ctx_cache.lock();
            if let Some((cached_version, cached)) = &*cache {
                if *cached_version == version {
                    return cached.clone();
                }
            }
        }
        let fresh = Arc::new(SelectorContext {
            state: self.ctx.state().get(),
            version,
            tenant: self.ctx.tenant().clone(),
        });
        *self.ctx_cache.lock() = Some((version, fresh.clone()));
        fresh
    }

    fn compute(&self) -> Selected<U> {
        let context = self.selector_context();
        (self.spec.selector)(&context, &self.params)
    }

    fn recompute(&self, notify: bool) {
        let next = self.compute();
        let is_equal = self.spec.is_equal.clone();
        let changed = self.selected.send_if_modified(|current| {
            if selected_eq(current, &next, &*is_equal) {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed && notify {
            // Snapshot callbacks so a re-entrant subscribe cannot deadlock
            let callbacks: Vec<Callback> = self.callbacks.lock().values().cloned().collect();
            for callback in callbacks {
                callback();
            }
        }
    }

    fn start(inner: &Arc<Self>) {
        // Bookkeeping side effect first, so stores see the observer
        // before the first recompute reads their state
        let teardown = inner
            .spec
            .on_subscribe
            .as_ref()
            .map(|hook| hook(&inner.ctx, &inner.params));
        inner.recompute(false);
        let driver = tokio::spawn(Self::drive(inner.clone()));
        let mut runtime = inner.runtime.lock();
        if runtime.active.is_empty() {
            // The first observer already left; undo the start
            driver.abort();
            drop(runtime);
            if let Some(teardown) = teardown {
                teardown();
            }
            return;
        }
        runtime.teardown = teardown;
        runtime.driver = Some(driver);
    }

    async fn drive(inner: Arc<Self>) {
        let mut state_rx = inner.ctx.state().watch();
        loop {
            if state_rx.changed().await.is_err() {
                break;
            }
            state_rx.borrow_and_update();
            inner.recompute(true);
        }
    }

    fn remove_observer(inner: &Arc<Self>, id: u64) {
        let stopped = {
            let mut runtime = inner.runtime.lock();
            if !runtime.active.remove(&id) {
                return;
            }
            if runtime.active.is_empty() {
                Some((runtime.driver.take(), runtime.teardown.take()))
            } else {
                None
            }
        };
        inner.callbacks.lock().remove(&id);
        if let Some((driver, teardown)) = stopped {
            if let Some(driver) = driver {
                driver.abort();
            }
            if let Some(teardown) = teardown {
                teardown();
            }
        }
    }
}

/// Observer registration; dropping it (or calling `unsubscribe`)
/// releases the observer and, for the last one, runs the source's
/// teardown
pub struct SubscriptionGuard {
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    /// Release the registration explicitly
    pub fn unsubscribe(mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
    }
}

/// Stream returned by [`StateSource::changes`]
pub struct SourceChanges<U> {
    stream: WatchStream<Selected<U>>,
    _guard: SubscriptionGuard,
}

impl<U: Clone + Send + Sync + 'static> Stream for SourceChanges<U> {
    type Item = Result<U, StoreError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stream).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceContainer, ResourceSpec};
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_types::TenantConfig;

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        title: String,
        body: String,
    }

    fn container() -> Arc<ResourceContainer<Doc>> {
        let spec = Arc::new(ResourceSpec::new("doc", |_| Doc {
            title: "draft".into(),
            body: String::new(),
        }));
        ResourceContainer::create(
            &spec,
            crate::tenant::TenantHandle::new(TenantConfig::new()),
        )
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_callback_fires_only_on_selected_change() {
        let container = container();
        let source = StateSource::new(
            container.context().clone(),
            (),
            SourceSpec::new(|ctx: &SelectorContext<Doc>, _: &()| Ok(ctx.state().title.clone())),
        );

        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let _guard = source.subscribe_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;

        // Body changes do not affect the selected title
        container.state().set("body", |prev| {
            Some(Doc {
                body: "text".into(),
                ..prev.clone()
            })
        });
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        container.state().set("title", |prev| {
            Some(Doc {
                title: "final".into(),
                ..prev.clone()
            })
        });
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(source.get_current().unwrap(), "final");
    }

    #[tokio::test]
    async fn test_on_subscribe_teardown_lifecycle() {
        let container = container();
        let subscribes = Arc::new(AtomicU32::new(0));
        let teardowns = Arc::new(AtomicU32::new(0));

        let sub_count = subscribes.clone();
        let td_count = teardowns.clone();
        let spec = SourceSpec::new(|ctx: &SelectorContext<Doc>, _: &()| {
            Ok(ctx.state().title.clone())
        })
        .with_on_subscribe(move |_ctx, _params| {
            sub_count.fetch_add(1, Ordering::SeqCst);
            let td_count = td_count.clone();
            Box::new(move || {
                td_count.fetch_add(1, Ordering::SeqCst);
            })
        });
        let source = StateSource::new(container.context().clone(), (), spec);

        let first = source.subscribe();
        let second = source.subscribe();
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);

        first.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        second.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        // A fresh observer re-runs the hook
        let _third = source.subscribe();
        assert_eq!(subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_changes_yields_current_then_distinct() {
        let container = container();
        let source = StateSource::new(
            container.context().clone(),
            (),
            SourceSpec::new(|ctx: &SelectorContext<Doc>, _: &()| Ok(ctx.state().title.clone())),
        );

        let mut changes = source.changes();
        assert_eq!(changes.next().await.unwrap().unwrap(), "draft");

        container.state().set("title", |prev| {
            Some(Doc {
                title: "v2".into(),
                ..prev.clone()
            })
        });
        assert_eq!(changes.next().await.unwrap().unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_selector_context_memoized_per_version() {
        let container = container();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let addresses = seen.clone();
        let source = StateSource::new(
            container.context().clone(),
            (),
            SourceSpec::new(move |ctx: &SelectorContext<Doc>, _: &()| {
                addresses.lock().push(ctx as *const _ as usize);
                Ok(ctx.state().title.clone())
            }),
        );

        source.get_current().unwrap();
        source.get_current().unwrap();
        container.state().set("title", |prev| {
            Some(Doc {
                title: "v2".into(),
                ..prev.clone()
            })
        });
        source.get_current().unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0], seen[1], "same version must reuse the context");
        assert_ne!(seen[1], seen[2], "new version must rebuild the context");
    }

    #[tokio::test]
    async fn test_selector_error_surfaces_on_read() {
        let container = container();
        let source = StateSource::new(
            container.context().clone(),
            (),
            SourceSpec::new(|ctx: &SelectorContext<Doc>, _: &()| {
                if ctx.state().title == "broken" {
                    Err(StoreError::Source(Arc::new(std::io::Error::other("boom"))))
                } else {
                    Ok(ctx.state().title.clone())
                }
            }),
        );

        assert!(source.get_current().is_ok());
        container.state().set("break", |prev| {
            Some(Doc {
                title: "broken".into(),
                ..prev.clone()
            })
        });
        assert!(matches!(source.get_current(), Err(StoreError::Source(_))));
    }
}
