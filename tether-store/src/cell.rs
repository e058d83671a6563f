//! Versioned state cell with change notification
//!
//! The state cell is the single mutable resource every container owns.
//! All mutation goes through one setter whose update closure may decline
//! to produce a new value; declined updates bump no version and wake no
//! listener, which is what keeps the sync engine from feeding back into
//! the state it observes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

/// A single mutable, versioned value with a change stream
pub struct StateCell<T> {
    tx: watch::Sender<Arc<T>>,
    version: AtomicU64,
    closed: AtomicBool,
}

impl<T: Send + Sync + 'static> StateCell<T> {
    /// Create a cell holding `initial`
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        StateCell {
            tx,
            version: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Current value
    pub fn get(&self) -> Arc<T> {
        self.tx.borrow().clone()
    }

    /// Monotonic version, bumped once per accepted update
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Apply a functional update.
    ///
    /// `update` receives the current value and returns the next one, or
    /// `None` when nothing changed. A `None` result is the structural
    /// no-op guard: no version bump, no notification. Returns whether
    /// the update was accepted.
    pub fn set<F>(&self, label: &'static str, update: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        if self.closed.load(Ordering::Acquire) {
            trace!(label, "set on closed state cell ignored");
            return false;
        }
        let changed = self.tx.send_if_modified(|current| match update(current) {
            Some(next) => {
                *current = Arc::new(next);
                true
            }
            None => false,
        });
        if changed {
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            trace!(label, version, "state cell updated");
        }
        changed
    }

    /// Change stream: yields the current value immediately, then every
    /// accepted update
    pub fn changes(&self) -> WatchStream<Arc<T>> {
        WatchStream::new(self.tx.subscribe())
    }

    /// Raw watch receiver over the cell's value
    pub fn watch(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }

    /// Stop accepting updates; listeners are never notified again
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the cell has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        count: u32,
    }

    #[test]
    fn test_set_and_get() {
        let cell = StateCell::new(Counter { count: 0 });
        assert_eq!(cell.version(), 1);

        let accepted = cell.set("bump", |prev| Some(Counter { count: prev.count + 1 }));
        assert!(accepted);
        assert_eq!(cell.get().count, 1);
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn test_noop_guard_suppresses_version_bump() {
        let cell = StateCell::new(Counter { count: 0 });
        let accepted = cell.set("noop", |_| None);
        assert!(!accepted);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn test_closed_cell_ignores_updates() {
        let cell = StateCell::new(Counter { count: 0 });
        cell.close();
        assert!(!cell.set("bump", |prev| Some(Counter { count: prev.count + 1 })));
        assert_eq!(cell.get().count, 0);
    }

    #[tokio::test]
    async fn test_changes_yields_current_then_updates() {
        let cell = StateCell::new(Counter { count: 0 });
        let mut changes = cell.changes();

        // Current value is delivered immediately on subscribe
        let first = changes.next().await.unwrap();
        assert_eq!(first.count, 0);

        cell.set("bump", |prev| Some(Counter { count: prev.count + 1 }));
        let second = changes.next().await.unwrap();
        assert_eq!(second.count, 1);
    }

    #[tokio::test]
    async fn test_rejected_update_wakes_no_stream() {
        let cell = StateCell::new(Counter { count: 0 });
        let mut changes = cell.changes();
        let _ = changes.next().await;

        cell.set("noop", |_| None);
        cell.set("bump", |prev| Some(Counter { count: prev.count + 1 }));

        // The rejected update is invisible: the next item is the bump
        let next = changes.next().await.unwrap();
        assert_eq!(next.count, 1);
    }
}
