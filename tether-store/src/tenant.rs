//! Tenant handles
//!
//! A tenant handle represents one live caller of the store layer (a
//! binding instance, a framework hook, a script). Handles carry the
//! tenant configuration and a disposal hook list; the router uses
//! disposal to reference-count shared container instances.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tether_types::TenantConfig;
use tracing::debug;

type Disposer = Box<dyn FnOnce() + Send>;

struct HandleInner {
    id: u64,
    config: TenantConfig,
    disposers: Mutex<Vec<Disposer>>,
    disposed: AtomicBool,
}

/// A live, disposable caller identity bound to a tenant configuration
#[derive(Clone)]
pub struct TenantHandle {
    inner: Arc<HandleInner>,
}

impl TenantHandle {
    /// Create a handle for the given configuration
    pub fn new(config: TenantConfig) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TenantHandle {
            inner: Arc::new(HandleInner {
                id: NEXT.fetch_add(1, Ordering::Relaxed),
                config,
                disposers: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique id of this handle
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The tenant configuration this handle was created with
    pub fn config(&self) -> &TenantConfig {
        &self.inner.config
    }

    /// Register a hook to run when the handle is disposed.
    ///
    /// A hook registered after disposal runs immediately.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
        if self.inner.disposed.load(Ordering::Acquire) {
            hook();
            return;
        }
        self.inner.disposers.lock().push(Box::new(hook));
    }

    /// Dispose the handle, running every registered hook exactly once.
    /// Subsequent calls are no-ops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.disposers.lock());
        debug!(handle = self.inner.id, hooks = hooks.len(), "tenant handle disposed");
        for hook in hooks {
            hook();
        }
    }

    /// Whether the handle has been disposed
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_dispose_runs_hooks_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let handle = TenantHandle::new(TenantConfig::new());

        let counter = calls.clone();
        handle.on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.dispose();
        handle.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_hook_after_dispose_runs_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let handle = TenantHandle::new(TenantConfig::new());
        handle.dispose();

        let counter = calls.clone();
        handle.on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_identity() {
        let handle = TenantHandle::new(TenantConfig::new());
        let clone = handle.clone();
        assert_eq!(handle.id(), clone.id());

        clone.dispose();
        assert!(handle.is_disposed());
    }
}
