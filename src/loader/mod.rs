//! Request-scoped batch loader.
//!
//! A `BatchLoader` collects the keys requested during one scheduling pass of a
//! request into a window, sends the de-duplicated window to the backend in a
//! single call, and hands each caller the result for its own key.
//!
//! ## Windows
//!
//! `load` registers its key synchronously and returns a [`LoadHandle`]. The
//! first handle to be awaited yields once so sibling loads in the same pass
//! can register, then closes the window. [`BatchLoader::dispatch`] closes it
//! immediately, and a configured `max_batch_size` closes a window as soon as
//! it is full.
//!
//! ## Memo
//!
//! Every key seen in the request is remembered, so asking for it again shares
//! the first result instead of refetching. Keys whose batch failed are
//! forgotten so a later load retries them.

mod error;
mod factory;
mod scope;

use std::{
    collections::HashMap,
    fmt,
    future::IntoFuture,
    hash::Hash,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::{BackendError, BatchFetch};
use crate::util::lock::mutex_lock;

pub use error::LoadError;
pub use factory::{LoaderConfig, LoaderFactory};

const SOURCE: &str = "loader";

const METRIC_LOADER_BATCH: &str = "gateway_loader_batch_total";
const METRIC_LOADER_BATCH_SIZE: &str = "gateway_loader_batch_size";
const METRIC_LOADER_FAILURE: &str = "gateway_loader_failure_total";

/// Window id used for memo entries seeded by `prime`.
const PRIMED: u64 = 0;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a single load: the record, `None` for not found, or an error.
pub type LoadResult<V> = Result<Option<V>, LoadError>;

type Slot<V> = watch::Sender<Option<LoadResult<V>>>;
type SlotReceiver<V> = watch::Receiver<Option<LoadResult<V>>>;

/// Receives records fetched for a window whose callers were all aborted.
#[async_trait]
pub trait ResultSink<K, V>: Send + Sync {
    async fn accept(&self, records: Vec<(K, V)>);
}

/// Type-erased handle used by a request to abort every loader it created.
pub trait Abort: Send + Sync {
    fn abort(&self);
}

// ============================================================================
// State
// ============================================================================

struct Window<K, V> {
    id: u64,
    keys: Vec<K>,
    slots: Vec<Slot<V>>,
    positions: HashMap<K, usize>,
}

struct MemoEntry<V> {
    rx: SlotReceiver<V>,
    window: u64,
}

struct LoaderState<K, V> {
    open: Option<Window<K, V>>,
    in_flight: HashMap<u64, Vec<Slot<V>>>,
    memo: HashMap<K, MemoEntry<V>>,
    next_window: u64,
    aborted: bool,
}

/// A window that has been closed and is ready to be sent.
struct ClosedWindow<K> {
    id: u64,
    keys: Vec<K>,
}

impl<K, V> LoaderState<K, V> {
    fn close_open(&mut self) -> Option<ClosedWindow<K>> {
        let window = self.open.take()?;
        self.in_flight.insert(window.id, window.slots);
        Some(ClosedWindow {
            id: window.id,
            keys: window.keys,
        })
    }
}

struct Inner<K, V> {
    id: u64,
    name: &'static str,
    fetcher: Arc<dyn BatchFetch<K, V>>,
    max_batch_size: Option<NonZeroUsize>,
    sink: Option<Arc<dyn ResultSink<K, V>>>,
    state: Mutex<LoaderState<K, V>>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Close window `id` if it is still the open one.
    fn dispatch_window(self: &Arc<Self>, id: u64) {
        let closed = {
            let mut state = mutex_lock(&self.state, SOURCE, "dispatch_window");
            let still_open = state.open.as_ref().is_some_and(|window| window.id == id);
            if still_open { state.close_open() } else { None }
        };
        if let Some(closed) = closed {
            self.spawn_dispatch(closed);
        }
    }

    /// Send a closed window from its own task so no single caller can cancel
    /// the backend call by going away.
    fn spawn_dispatch(self: &Arc<Self>, closed: ClosedWindow<K>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_dispatch(closed).await });
    }

    async fn run_dispatch(self: Arc<Self>, closed: ClosedWindow<K>) {
        let ClosedWindow { id, keys } = closed;
        let batch_size = keys.len();
        counter!(METRIC_LOADER_BATCH, "loader" => self.name).increment(1);
        histogram!(METRIC_LOADER_BATCH_SIZE, "loader" => self.name).record(batch_size as f64);
        debug!(loader = self.name, window = id, batch_size, "Dispatching batch");

        let fetched = scope::dispatching(self.id, self.fetcher.fetch_many(&keys)).await;
        let results: Vec<LoadResult<V>> = match fetched {
            Ok(values) if values.len() == batch_size => values.into_iter().map(Ok).collect(),
            Ok(values) => self.failed(
                id,
                batch_size,
                BackendError::LengthMismatch {
                    expected: batch_size,
                    actual: values.len(),
                },
            ),
            Err(err) => self.failed(id, batch_size, err),
        };

        self.deliver(id, keys, results).await;
    }

    fn failed(&self, window: u64, batch_size: usize, err: BackendError) -> Vec<LoadResult<V>> {
        counter!(METRIC_LOADER_FAILURE, "loader" => self.name).increment(1);
        warn!(loader = self.name, window, batch_size, error = %err, "Batch fetch failed");
        vec![Err(LoadError::Backend(err)); batch_size]
    }

    async fn deliver(&self, window: u64, keys: Vec<K>, results: Vec<LoadResult<V>>) {
        let slots = {
            let mut state = mutex_lock(&self.state, SOURCE, "deliver");
            let slots = state.in_flight.remove(&window);
            if slots.is_some() {
                for (key, result) in keys.iter().zip(&results) {
                    let owned_by_window = state
                        .memo
                        .get(key)
                        .is_some_and(|entry| entry.window == window);
                    if result.is_err() && owned_by_window {
                        state.memo.remove(key);
                    }
                }
            }
            slots
        };

        match slots {
            Some(slots) => {
                for (slot, result) in slots.into_iter().zip(results) {
                    slot.send_replace(Some(result));
                }
            }
            None => self.drain_to_sink(window, keys, results).await,
        }
    }

    async fn drain_to_sink(&self, window: u64, keys: Vec<K>, results: Vec<LoadResult<V>>) {
        let Some(sink) = &self.sink else {
            debug!(loader = self.name, window, "Dropping results of aborted window");
            return;
        };

        let records: Vec<(K, V)> = keys
            .into_iter()
            .zip(results)
            .filter_map(|(key, result)| match result {
                Ok(Some(value)) => Some((key, value)),
                _ => None,
            })
            .collect();
        if records.is_empty() {
            return;
        }

        debug!(
            loader = self.name,
            window,
            records = records.len(),
            "Handing results of aborted window to sink"
        );
        sink.accept(records).await;
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Coalesces per-key lookups issued during one request into batched calls.
///
/// Cloning shares the same windows and memo.
pub struct BatchLoader<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for BatchLoader<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLoader")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("max_batch_size", &self.inner.max_batch_size)
            .finish()
    }
}

impl<K, V> BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Loader with no batch size limit and no result sink.
    pub fn new(name: &'static str, fetcher: Arc<dyn BatchFetch<K, V>>) -> Self {
        Self::builder(name, fetcher).build()
    }

    pub fn builder(name: &'static str, fetcher: Arc<dyn BatchFetch<K, V>>) -> BatchLoaderBuilder<K, V> {
        BatchLoaderBuilder {
            name,
            fetcher,
            max_batch_size: None,
            sink: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Register `key` in the open window and return a handle to its result.
    ///
    /// Must be called from within a Tokio runtime: a window that fills up is
    /// dispatched on the spot.
    pub fn load(&self, key: K) -> LoadHandle<K, V> {
        let inner = &self.inner;
        if scope::is_dispatching(inner.id) {
            warn!(loader = inner.name, "Refusing load from inside the loader's own batch function");
            return LoadHandle::ready(Err(LoadError::Reentrant { loader: inner.name }));
        }

        let (handle, closed) = {
            let mut guard = mutex_lock(&inner.state, SOURCE, "load");
            let state = &mut *guard;
            if state.aborted {
                return LoadHandle::ready(Err(LoadError::Aborted));
            }

            if let Some(entry) = state.memo.get(&key) {
                let settled = entry.rx.borrow().clone();
                return match settled {
                    Some(result) => LoadHandle::ready(result),
                    None => LoadHandle::pending(Arc::clone(inner), entry.window, entry.rx.clone()),
                };
            }

            let next_window = &mut state.next_window;
            let window = state.open.get_or_insert_with(|| {
                *next_window += 1;
                Window {
                    id: *next_window,
                    keys: Vec::new(),
                    slots: Vec::new(),
                    positions: HashMap::new(),
                }
            });

            // A key cleared from the memo may still be waiting in this window.
            let rx = match window.positions.get(&key) {
                Some(&position) => window.slots[position].subscribe(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    window.positions.insert(key.clone(), window.keys.len());
                    window.keys.push(key.clone());
                    window.slots.push(tx);
                    rx
                }
            };
            let window_id = window.id;
            let full = inner
                .max_batch_size
                .is_some_and(|max| window.keys.len() >= max.get());

            state.memo.insert(
                key,
                MemoEntry {
                    rx: rx.clone(),
                    window: window_id,
                },
            );
            let closed = if full { state.close_open() } else { None };
            (LoadHandle::pending(Arc::clone(inner), window_id, rx), closed)
        };

        if let Some(closed) = closed {
            inner.spawn_dispatch(closed);
        }
        handle
    }

    /// Load every key and return results in the same order.
    pub async fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Vec<LoadResult<V>> {
        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| self.load(key).into_future())
            .collect();
        future::join_all(handles).await
    }

    /// Close the open window now instead of waiting for the next await.
    pub fn dispatch(&self) {
        let closed = mutex_lock(&self.inner.state, SOURCE, "dispatch").close_open();
        if let Some(closed) = closed {
            self.inner.spawn_dispatch(closed);
        }
    }

    /// Forget `key` so the next load fetches it again.
    pub fn clear(&self, key: &K) {
        mutex_lock(&self.inner.state, SOURCE, "clear").memo.remove(key);
    }

    /// Forget every memoized key.
    pub fn clear_all(&self) {
        mutex_lock(&self.inner.state, SOURCE, "clear_all").memo.clear();
    }

    /// Seed the memo with a known value. Returns `false` (and changes
    /// nothing) if the key is already memoized or the loader was aborted.
    pub fn prime(&self, key: K, value: V) -> bool {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "prime");
        if state.aborted || state.memo.contains_key(&key) {
            return false;
        }
        let (_tx, rx) = watch::channel(Some(Ok(Some(value))));
        state.memo.insert(
            key,
            MemoEntry {
                rx,
                window: PRIMED,
            },
        );
        true
    }

    /// Reject every pending handle with [`LoadError::Aborted`] and empty the
    /// memo. Batches already sent keep running; their records go to the
    /// result sink, if any. Later loads fail with `Aborted`.
    pub fn abort(&self) {
        let (open, in_flight) = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "abort");
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.memo.clear();
            (state.open.take(), std::mem::take(&mut state.in_flight))
        };

        let mut rejected = 0_usize;
        let slots = open
            .into_iter()
            .flat_map(|window| window.slots)
            .chain(in_flight.into_values().flatten());
        for slot in slots {
            slot.send_replace(Some(Err(LoadError::Aborted)));
            rejected += 1;
        }
        debug!(loader = self.inner.name, rejected, "Loader aborted");
    }

    pub fn is_aborted(&self) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_aborted").aborted
    }
}

impl<K, V> Abort for BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn abort(&self) {
        BatchLoader::abort(self);
    }
}

/// Builder for [`BatchLoader`].
pub struct BatchLoaderBuilder<K, V> {
    name: &'static str,
    fetcher: Arc<dyn BatchFetch<K, V>>,
    max_batch_size: Option<NonZeroUsize>,
    sink: Option<Arc<dyn ResultSink<K, V>>>,
}

impl<K, V> BatchLoaderBuilder<K, V> {
    /// Close a window as soon as it holds this many keys.
    pub fn max_batch_size(mut self, max: Option<NonZeroUsize>) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Where records fetched for aborted windows are sent.
    pub fn sink(mut self, sink: Arc<dyn ResultSink<K, V>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> BatchLoader<K, V> {
        BatchLoader {
            inner: Arc::new(Inner {
                id: NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                fetcher: self.fetcher,
                max_batch_size: self.max_batch_size,
                sink: self.sink,
                state: Mutex::new(LoaderState {
                    open: None,
                    in_flight: HashMap::new(),
                    memo: HashMap::new(),
                    next_window: PRIMED,
                    aborted: false,
                }),
            }),
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Pending result of [`BatchLoader::load`]. Await it to get the value.
#[must_use = "a load handle does nothing unless awaited"]
pub struct LoadHandle<K, V> {
    state: HandleState<K, V>,
}

enum HandleState<K, V> {
    Ready(LoadResult<V>),
    Pending {
        inner: Arc<Inner<K, V>>,
        window: u64,
        rx: SlotReceiver<V>,
    },
}

impl<K, V> LoadHandle<K, V> {
    fn ready(result: LoadResult<V>) -> Self {
        Self {
            state: HandleState::Ready(result),
        }
    }

    fn pending(inner: Arc<Inner<K, V>>, window: u64, rx: SlotReceiver<V>) -> Self {
        Self {
            state: HandleState::Pending { inner, window, rx },
        }
    }
}

impl<K, V> IntoFuture for LoadHandle<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Output = LoadResult<V>;
    type IntoFuture = BoxFuture<'static, LoadResult<V>>;

    fn into_future(self) -> Self::IntoFuture {
        match self.state {
            HandleState::Ready(result) => future::ready(result).boxed(),
            HandleState::Pending {
                inner,
                window,
                mut rx,
            } => async move {
                if rx.borrow().is_none() {
                    // Let every sibling load of this pass join the window.
                    tokio::task::yield_now().await;
                    inner.dispatch_window(window);
                }
                match rx.wait_for(Option::is_some).await {
                    Ok(settled) => (*settled).clone().unwrap_or(Err(LoadError::Aborted)),
                    Err(_) => Err(LoadError::Aborted),
                }
            }
            .boxed(),
        }
    }
}
