//! Batched fetch-and-sync engine
//!
//! One engine task runs per sync-backed container and manages every key
//! of that container. It watches the container's state cell for
//! membership changes in the tracked key set, coalesces them through a
//! debounce window into one fetch per shape group, applies results back
//! into the per-key slots, reconciles against the remote push feed by
//! tag intersection, and reclaims idle entries after a grace delay.
//!
//! The engine is the single writer for batch, garbage-collection, and
//! live-feed mutations; subscriber bookkeeping and resolve registration
//! reach it through the same state cell it watches, so every mutation is
//! ordered by the cell's one setter.

use crate::error::{SyncError, TransportError};
use crate::state::SyncState;
use crate::transport::{BatchRequest, BatchResponse, KeyRequest, Transport};
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_store::StateCell;
use tether_types::{EntryKey, LiveEvent, ShapeId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Timing configuration for one sync-backed store.
///
/// Different stores want different windows: projection/preview-style
/// stores debounce around 50ms, query-style stores flush on the next
/// scheduler tick (`Duration::ZERO`), and grace delays range up to
/// several seconds. There is no canonical value; both are configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Debounce window during which newly tracked keys accumulate
    /// before one fetch is issued
    pub batch_window: Duration,
    /// How long an entry without subscribers keeps its cached value
    /// before it is removed
    pub gc_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            batch_window: Duration::from_millis(50),
            gc_grace: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    pub fn with_batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    pub fn with_gc_grace(mut self, gc_grace: Duration) -> Self {
        self.gc_grace = gc_grace;
        self
    }
}

pub(crate) enum Command<V> {
    Resolve {
        waiter: u64,
        key: EntryKey,
        shape: ShapeId,
        params: serde_json::Value,
        reply: oneshot::Sender<Result<V, SyncError>>,
    },
    CancelResolve {
        waiter: u64,
        key: EntryKey,
    },
}

/// Handle for request/response interactions with a running engine
pub struct SyncController<V> {
    tx: mpsc::UnboundedSender<Command<V>>,
    next_waiter: Arc<AtomicU64>,
}

impl<V> Clone for SyncController<V> {
    fn clone(&self) -> Self {
        SyncController {
            tx: self.tx.clone(),
            next_waiter: self.next_waiter.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> SyncController<V> {
    /// Register interest in `key` and wait for its first non-empty
    /// value, without registering a lasting subscriber.
    ///
    /// The key joins the next batch like any subscription would, but it
    /// never influences another caller's lifecycle. Firing `signal`
    /// returns [`SyncError::Aborted`] and clears the registration; an
    /// entry created only for this call is removed with it.
    pub async fn resolve(
        &self,
        key: EntryKey,
        shape: ShapeId,
        params: serde_json::Value,
        signal: Option<CancellationToken>,
    ) -> Result<V, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Command::Resolve {
                waiter,
                key: key.clone(),
                shape,
                params,
                reply: reply_tx,
            })
            .map_err(|_| SyncError::EngineStopped)?;
        match signal {
            None => reply_rx.await.map_err(|_| SyncError::EngineStopped)?,
            Some(signal) => tokio::select! {
                result = reply_rx => result.map_err(|_| SyncError::EngineStopped)?,
                _ = signal.cancelled() => {
                    let _ = self.tx.send(Command::CancelResolve { waiter, key });
                    Err(SyncError::Aborted)
                }
            },
        }
    }
}

struct Waiter<V> {
    id: u64,
    reply: oneshot::Sender<Result<V, SyncError>>,
}

struct FetchOutcome<V> {
    generation: u64,
    shape: ShapeId,
    keys: Vec<EntryKey>,
    result: Result<BatchResponse<V>, TransportError>,
}

struct InFlight {
    keys: Vec<EntryKey>,
    handle: JoinHandle<()>,
}

/// Start the engine for `state`, returning its controller and the
/// shutdown token a container teardown cancels.
pub fn start<T: Transport>(
    state: Arc<StateCell<SyncState<T::Value>>>,
    transport: watch::Receiver<Arc<T>>,
    config: SyncConfig,
) -> (SyncController<T::Value>, CancellationToken) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let engine = Engine {
        state,
        transport,
        config,
        results_tx,
        watched_keys: BTreeSet::new(),
        stable_keys: BTreeSet::new(),
        refetch: HashSet::new(),
        cursor: None,
        generation: 0,
        inflight: Vec::new(),
        debounce_until: None,
        gc_queue: BinaryHeap::new(),
        gc_marked: HashMap::new(),
        waiters: HashMap::new(),
        resolve_owned: HashSet::new(),
    };
    tokio::spawn(run(engine, cmd_rx, results_rx, shutdown.clone()));

    (
        SyncController {
            tx: cmd_tx,
            next_waiter: Arc::new(AtomicU64::new(1)),
        },
        shutdown,
    )
}

struct Engine<T: Transport> {
    state: Arc<StateCell<SyncState<T::Value>>>,
    transport: watch::Receiver<Arc<T>>,
    config: SyncConfig,
    results_tx: mpsc::UnboundedSender<FetchOutcome<T::Value>>,
    /// Latest observed tracked key set
    watched_keys: BTreeSet<EntryKey>,
    /// Key set as of the last batch flush; the diff against it yields
    /// newly tracked keys
    stable_keys: BTreeSet<EntryKey>,
    /// Keys flagged by live events for the next batch
    refetch: HashSet<EntryKey>,
    /// Id of the latest intersecting live event, read at dispatch time
    cursor: Option<String>,
    /// Batch generation; outcomes from older generations are discarded
    generation: u64,
    inflight: Vec<InFlight>,
    debounce_until: Option<Instant>,
    gc_queue: BinaryHeap<Reverse<(Instant, EntryKey)>>,
    gc_marked: HashMap<EntryKey, Instant>,
    waiters: HashMap<EntryKey, Vec<Waiter<T::Value>>>,
    /// Keys whose entries exist only because of a resolve-once call
    resolve_owned: HashSet<EntryKey>,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

async fn run<T: Transport>(
    mut engine: Engine<T>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command<T::Value>>,
    mut results_rx: mpsc::UnboundedReceiver<FetchOutcome<T::Value>>,
    shutdown: CancellationToken,
) {
    let mut state_rx = engine.state.watch();
    let mut transport_rx = engine.transport.clone();
    let mut live = engine.transport.borrow().events();
    let mut commands_open = true;
    let mut transport_open = true;

    // Honor entries that were tracked before the engine started
    let initial = state_rx.borrow().clone();
    engine.observe_state(&initial);

    loop {
        let debounce_at = engine.debounce_until.unwrap_or_else(far_future);
        let gc_at = engine.next_gc_deadline().unwrap_or_else(far_future);

        tokio::select! {
            _ = shutdown.cancelled() => break,

            changed = state_rx.changed() => match changed {
                Ok(()) => {
                    let snapshot = state_rx.borrow_and_update().clone();
                    engine.observe_state(&snapshot);
                }
                // The cell is gone with its container
                Err(_) => break,
            },

            command = cmd_rx.recv(), if commands_open => match command {
                Some(command) => engine.handle_command(command),
                None => commands_open = false,
            },

            event = live.recv() => match event {
                Ok(event) => engine.handle_live_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "live feed lagged; refetching all tracked keys");
                    engine.refetch_all();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    engine.fail(SyncError::FeedClosed);
                    break;
                }
            },

            changed = transport_rx.changed(), if transport_open => match changed {
                Ok(()) => {
                    live = transport_rx.borrow_and_update().events();
                    debug!("transport handle replaced; live feed resubscribed");
                }
                Err(_) => {
                    transport_open = false;
                }
            },

            _ = time::sleep_until(debounce_at), if engine.debounce_until.is_some() => {
                engine.flush();
            }

            outcome = results_rx.recv() => {
                if let Some(outcome) = outcome {
                    engine.handle_outcome(outcome);
                }
            }

            _ = time::sleep_until(gc_at), if !engine.gc_queue.is_empty() => {
                engine.collect_garbage();
            }
        }
    }
    engine.stop();
}

impl<T: Transport> Engine<T> {
    /// React to a new state snapshot: schedule or cancel GC per entry,
    /// and treat key-set membership changes as batch input.
    fn observe_state(&mut self, state: &SyncState<T::Value>) {
        let now = Instant::now();
        for (key, entry) in &state.entries {
            if entry.subscribers.is_empty() {
                let held = self.waiters.contains_key(key) || self.resolve_owned.contains(key);
                if !held && !self.gc_marked.contains_key(key) {
                    let deadline = now + self.config.gc_grace;
                    self.gc_marked.insert(key.clone(), deadline);
                    self.gc_queue.push(Reverse((deadline, key.clone())));
                    trace!(%key, "entry idle; scheduled for removal after grace");
                }
            } else {
                if self.gc_marked.remove(key).is_some() {
                    trace!(%key, "removal cancelled; key resubscribed within grace");
                }
                self.resolve_owned.remove(key);
            }
        }

        let keys = state.key_set();
        if keys != self.watched_keys {
            self.watched_keys = keys;
            self.supersede();
            self.arm_debounce();
        }
    }

    /// Cancel any in-flight batch; its results must never apply. The
    /// cancelled keys rejoin the next batch so they still settle.
    fn supersede(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        self.generation += 1;
        for inflight in self.inflight.drain(..) {
            inflight.handle.abort();
            self.refetch.extend(inflight.keys);
        }
        debug!(generation = self.generation, "key set changed; superseded in-flight batch");
    }

    fn arm_debounce(&mut self) {
        self.debounce_until = Some(Instant::now() + self.config.batch_window);
    }

    fn next_gc_deadline(&self) -> Option<Instant> {
        self.gc_queue.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Close the batch window: diff the key set against the last stable
    /// set, mark the queued keys pending, and dispatch one fetch per
    /// shape group.
    fn flush(&mut self) {
        self.debounce_until = None;
        let state = self.state.get();
        let current = state.key_set();

        let mut queued: BTreeSet<EntryKey> =
            current.difference(&self.stable_keys).cloned().collect();
        self.refetch.retain(|key| current.contains(key));
        queued.extend(self.refetch.drain());
        self.stable_keys = current;
        if queued.is_empty() {
            return;
        }

        debug!(keys = queued.len(), "batch window closed");
        self.state.set("sync/pending", |s| s.marked_pending(&queued));

        let state = self.state.get();
        let mut groups: HashMap<ShapeId, Vec<KeyRequest>> = HashMap::new();
        for key in &queued {
            if let Some(entry) = state.entries.get(key) {
                groups.entry(entry.shape.clone()).or_default().push(KeyRequest {
                    key: key.clone(),
                    params: entry.params.clone(),
                });
            }
        }

        for (shape, items) in groups {
            // Latest transport handle and cursor, read at dispatch time
            let transport = self.transport.borrow().clone();
            let request = BatchRequest {
                shape: shape.clone(),
                items,
                cursor: self.cursor.clone(),
            };
            let keys: Vec<EntryKey> = request.keys().cloned().collect();
            let generation = self.generation;
            let results = self.results_tx.clone();
            debug!(%shape, keys = keys.len(), generation, "dispatching batch fetch");
            let task_keys = keys.clone();
            let handle = tokio::spawn(async move {
                let result = transport.fetch(request).await;
                let _ = results.send(FetchOutcome {
                    generation,
                    shape,
                    keys: task_keys,
                    result,
                });
            });
            self.inflight.push(InFlight { keys, handle });
        }
    }

    fn handle_outcome(&mut self, outcome: FetchOutcome<T::Value>) {
        self.inflight.retain(|inflight| !inflight.handle.is_finished());
        if outcome.generation != self.generation {
            // A superseded fetch resolved before its abort landed;
            // discard without touching state
            debug!(shape = %outcome.shape, "discarded result from superseded batch");
            return;
        }
        match outcome.result {
            Ok(response) => {
                let now = Utc::now();
                debug!(
                    shape = %outcome.shape,
                    results = response.results.len(),
                    "batch fetch settled"
                );
                self.state
                    .set("sync/apply", |s| s.applied(&outcome.keys, &response, now));
                let state = self.state.get();
                for key in &outcome.keys {
                    let value = state.entries.get(key).and_then(|entry| entry.data.clone());
                    if let Some(value) = value {
                        self.settle_waiters(key, Ok(value));
                    }
                    self.maybe_release_resolve_entry(key);
                }
            }
            Err(error) => {
                let shared = Arc::new(SyncError::Fetch {
                    shape: outcome.shape.clone(),
                    message: error.message,
                });
                warn!(shape = %outcome.shape, error = %shared, "batch fetch failed");
                self.state
                    .set("sync/error", |s| s.errored(&outcome.keys, shared.clone()));
                for key in &outcome.keys {
                    self.settle_waiters(key, Err((*shared).clone()));
                    self.maybe_release_resolve_entry(key);
                }
            }
        }
    }

    fn handle_live_event(&mut self, event: LiveEvent) {
        if event.tags.is_empty() {
            return;
        }
        let state = self.state.get();
        let mut matched = 0usize;
        for (key, entry) in &state.entries {
            if entry.sync_tags.iter().any(|tag| event.tags.contains(tag)) {
                self.refetch.insert(key.clone());
                matched += 1;
            }
        }
        if matched > 0 {
            // The event id, not its payload, drives the refetch; the
            // response is then guaranteed to include the change
            self.cursor = Some(event.id.clone());
            debug!(event = %event.id, matched, "live event matched recorded tags; scheduling refetch");
            self.arm_debounce();
        }
    }

    fn refetch_all(&mut self) {
        let state = self.state.get();
        self.refetch.extend(state.entries.keys().cloned());
        if !self.refetch.is_empty() {
            self.arm_debounce();
        }
    }

    fn handle_command(&mut self, command: Command<T::Value>) {
        match command {
            Command::Resolve {
                waiter,
                key,
                shape,
                params,
                reply,
            } => {
                let state = self.state.get();
                if let Some(fatal) = &state.fatal {
                    let _ = reply.send(Err((**fatal).clone()));
                    return;
                }
                match state.entries.get(&key) {
                    Some(entry) => {
                        if let Some(error) = &entry.error {
                            let _ = reply.send(Err((**error).clone()));
                            return;
                        }
                        if !entry.pending {
                            if let Some(value) = &entry.data {
                                let _ = reply.send(Ok(value.clone()));
                                return;
                            }
                        }
                    }
                    None => {
                        self.resolve_owned.insert(key.clone());
                        self.state
                            .set("sync/resolve", |s| s.added_entry(&key, &shape, &params));
                    }
                }
                self.waiters
                    .entry(key)
                    .or_default()
                    .push(Waiter { id: waiter, reply });
            }
            Command::CancelResolve { waiter, key } => {
                if let Some(waiters) = self.waiters.get_mut(&key) {
                    waiters.retain(|w| w.id != waiter);
                    if waiters.is_empty() {
                        self.waiters.remove(&key);
                    }
                }
                self.maybe_release_resolve_entry(&key);
                // A cached entry the resolve was riding on goes back on
                // the grace clock
                self.reschedule_gc_if_idle(&key);
            }
        }
    }

    fn settle_waiters(&mut self, key: &EntryKey, result: Result<T::Value, SyncError>) {
        if let Some(waiters) = self.waiters.remove(key) {
            for waiter in waiters {
                let _ = waiter.reply.send(result.clone());
            }
        }
    }

    /// Remove an entry that exists only for a resolve-once call once its
    /// last waiter is gone. No grace timer: nobody observes the key.
    fn maybe_release_resolve_entry(&mut self, key: &EntryKey) {
        if !self.resolve_owned.contains(key) || self.waiters.contains_key(key) {
            return;
        }
        let state = self.state.get();
        if matches!(state.entries.get(key), Some(entry) if !entry.subscribers.is_empty()) {
            // A subscriber adopted the entry; it is theirs now
            self.resolve_owned.remove(key);
            return;
        }
        self.resolve_owned.remove(key);
        self.gc_marked.remove(key);
        let removed = self.state.set("sync/resolve-release", |s| {
            s.removed_idle_entries(std::slice::from_ref(key))
        });
        if removed {
            trace!(%key, "resolve-only entry released");
        }
    }

    fn reschedule_gc_if_idle(&mut self, key: &EntryKey) {
        if self.gc_marked.contains_key(key)
            || self.waiters.contains_key(key)
            || self.resolve_owned.contains(key)
        {
            return;
        }
        let state = self.state.get();
        if matches!(state.entries.get(key), Some(entry) if entry.subscribers.is_empty()) {
            let deadline = Instant::now() + self.config.gc_grace;
            self.gc_marked.insert(key.clone(), deadline);
            self.gc_queue.push(Reverse((deadline, key.clone())));
        }
    }

    fn collect_garbage(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        loop {
            match self.gc_queue.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {}
                _ => break,
            }
            let Some(Reverse((deadline, key))) = self.gc_queue.pop() else {
                break;
            };
            match self.gc_marked.get(&key) {
                Some(marked) if *marked == deadline => {
                    self.gc_marked.remove(&key);
                    if self.waiters.contains_key(&key) {
                        continue;
                    }
                    due.push(key);
                }
                // Cancelled or rescheduled since it was queued
                _ => {}
            }
        }
        if due.is_empty() {
            return;
        }
        let state = self.state.get();
        due.retain(|key| {
            matches!(state.entries.get(key), Some(entry) if entry.subscribers.is_empty())
        });
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "grace elapsed; removing idle entries");
        self.state.set("sync/gc", |s| s.removed_idle_entries(&due));
    }

    /// Container-level failure: every read surfaces it until the
    /// container is recreated
    fn fail(&mut self, err: SyncError) {
        error!(error = %err, "sync engine failed");
        let shared = Arc::new(err);
        self.state.set("sync/fatal", |s| s.failed(shared.clone()));
        let waiters = std::mem::take(&mut self.waiters);
        for (_, list) in waiters {
            for waiter in list {
                let _ = waiter.reply.send(Err((*shared).clone()));
            }
        }
    }

    fn stop(&mut self) {
        for inflight in self.inflight.drain(..) {
            inflight.handle.abort();
        }
        let waiters = std::mem::take(&mut self.waiters);
        for (_, list) in waiters {
            for waiter in list {
                let _ = waiter.reply.send(Err(SyncError::EngineStopped));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_window, Duration::from_millis(50));
        assert_eq!(config.gc_grace, Duration::from_secs(10));

        let tick = SyncConfig::default().with_batch_window(Duration::ZERO);
        assert_eq!(tick.batch_window, Duration::ZERO);
    }
}
