//! Reactive Runtime
//!
//! The [`Graph`] is the central coordinator that connects source cells and
//! computed cells. It owns the node store and is the only way to create,
//! read, write or dispose of cells.
//!
//! # How It Works
//!
//! 1. When a cell is created, it registers with the graph's store and the
//!    caller gets a typed handle back.
//!
//! 2. When a computed cell reads another cell, the graph records the
//!    dependency.
//!
//! 3. When a source cell is written, the graph:
//!    a. Finds all transitive dependents
//!    b. Marks them stale, cancelling their in-flight runs
//!    c. Notifies listeners
//!    d. Computed cells are lazy - they recompute on next read
//!
//! # Thread Safety
//!
//! A graph is a cheap, cloneable handle around one mutex-guarded store. Any
//! thread may read and write cells. The lock is released while derivation
//! functions and listeners run.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::cancel::{CancelHandle, CancellationToken};
use super::cell::{AsyncResult, CellHandle, Computed, Source};
use super::context::Tracker;
use super::engine::{downcast, finish};
use super::reader::{AsyncReader, Reader};
use super::subscriber::{SubscriberId, Subscription};
use crate::config::{GraphBuilder, GraphConfig};
use crate::error::CellError;
use crate::graph::{
    AsyncDerive, CellId, CellStatus, Derivation, GraphSnapshot, Node, NodeBody, NodeStore,
    SyncDerive, Value,
};

fn next_graph_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn sync_derive<F>(f: F) -> SyncDerive
where
    F: Fn(&Reader<'_>) -> Result<Value, CellError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn async_derive<F>(f: F) -> AsyncDerive
where
    F: Fn(AsyncReader, CancellationToken) -> BoxFuture<'static, Result<Value, CellError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

pub(crate) struct GraphInner {
    /// Distinguishes tracker frames of different graphs on one thread.
    pub(crate) id: u64,
    pub(crate) store: Mutex<NodeStore>,
    pub(crate) config: GraphConfig,
}

/// A reactive dependency graph.
///
/// Cloning a `Graph` yields another handle to the same cells.
///
/// ```
/// use tessera_core::reactive::Graph;
///
/// let graph = Graph::new();
/// let count = graph.source(2);
/// let doubled = graph.computed(move |r| Ok(r.get(&count)? * 2));
///
/// assert_eq!(graph.get(&doubled).unwrap(), 4);
/// graph.write(&count, 5).unwrap();
/// assert_eq!(graph.get(&doubled).unwrap(), 10);
/// ```
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Arc<GraphInner>,
}

impl Graph {
    /// Create a graph with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                id: next_graph_id(),
                store: Mutex::new(NodeStore::new()),
                config,
            }),
        }
    }

    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// The process-wide default graph.
    pub fn global() -> &'static Graph {
        static GLOBAL: OnceLock<Graph> = OnceLock::new();
        GLOBAL.get_or_init(Graph::new)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// Register a source cell holding `value`.
    pub fn source<T>(&self, value: T) -> Source<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.inner.store.lock().insert(Node::source(Arc::new(value)));
        trace!(cell = %id, "source registered");
        Source::new(id)
    }

    /// Register a computed cell with a synchronous derivation.
    ///
    /// Nothing runs until the cell is first read.
    pub fn computed<T, F>(&self, derive: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Reader<'_>) -> Result<T, CellError> + Send + Sync + 'static,
    {
        let derive =
            sync_derive(move |reader| derive(reader).map(|value| Arc::new(value) as Value));
        Computed::new(self.insert_computed(Derivation::Sync(derive)))
    }

    /// Register a computed cell with an asynchronous derivation.
    ///
    /// The derivation gets a reader for its upstreams and the cancellation
    /// token of its run. Runs are spawned with the graph's configured
    /// spawner.
    pub fn computed_async<T, F, Fut>(&self, derive: F) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(AsyncReader, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CellError>> + Send + 'static,
    {
        let derive = async_derive(move |reader, token| {
            derive(reader, token)
                .map(|result| result.map(|value| Arc::new(value) as Value))
                .boxed()
        });
        Computed::new(self.insert_computed(Derivation::Async(derive)))
    }

    fn insert_computed(&self, derive: Derivation) -> CellId {
        let mut store = self.inner.store.lock();
        let version = store.insert(Node::source(Arc::new(0_u64)).hide());
        let id = store.insert(Node::computed(derive, version));
        trace!(cell = %id, version = %version, "computed cell registered");
        id
    }

    /// Replace the value of a source cell and invalidate everything
    /// downstream of it.
    ///
    /// Fails with `CyclicDependency` (and changes nothing) if the cells
    /// downstream form a cycle.
    pub fn write<T>(&self, cell: &Source<T>, value: T) -> Result<(), CellError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.write_value(cell.id(), Arc::new(value))
    }

    /// Write the result of `f` applied to the current value.
    ///
    /// Read and write are separate steps; concurrent writers to the same
    /// cell must coordinate themselves.
    pub fn update<T, F>(&self, cell: &Source<T>, f: F) -> Result<(), CellError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let current = self.get_untracked(cell)?;
        self.write(cell, f(&current))
    }

    pub(crate) fn write_value(&self, id: CellId, value: Value) -> Result<(), CellError> {
        let (superseded, listeners) = {
            let mut store = self.inner.store.lock();
            match store.get(id).map(|node| &node.body) {
                Some(NodeBody::Source(_)) => {}
                Some(NodeBody::Computed(_)) => return Err(CellError::TypeMismatch(id)),
                None => return Err(CellError::DanglingReference(id)),
            }

            let affected = store.downstream_of(id)?;
            if let Some(node) = store.get_mut(id) {
                node.body = NodeBody::Source(value);
                node.generation += 1;
            }
            let superseded = store.mark_stale(&affected);
            debug!(
                cell = %id,
                affected = affected.len(),
                superseded = superseded.len(),
                "source written"
            );

            let mut notified = Vec::with_capacity(affected.len() + 1);
            notified.push(id);
            notified.extend(affected);
            (superseded, store.listeners_of(&notified))
        };
        finish(superseded, listeners);
        Ok(())
    }

    /// Read a cell.
    ///
    /// Inside a synchronous derivation of this graph the read is recorded
    /// as a dependency. A stale computed cell is recomputed first; an
    /// asynchronous cell whose run is in flight yields `CellError::Pending`.
    pub fn get<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        let id = cell.id();
        let Some(active) = Tracker::current(self.inner.id) else {
            return downcast(id, self.observe(id, &[]).outcome);
        };
        let observation = self.observe(id, &active.path);
        if let Some(generation) = observation.generation {
            trace!(cell = %id, reader = %active.cell, generation, "tracked read");
            self.record_read(active.cell, active.run_id, id, &observation);
        }
        downcast(id, observation.outcome)
    }

    /// Read a cell without recording a dependency.
    pub fn get_untracked<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        let id = cell.id();
        let path = Tracker::current(self.inner.id)
            .map(|active| active.path)
            .unwrap_or_default();
        downcast(id, self.observe(id, &path).outcome)
    }

    /// Read a cell, waiting for any asynchronous run it depends on.
    pub async fn get_async<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        let id = cell.id();
        loop {
            match self.observe(id, &[]).outcome {
                Err(CellError::Pending(pending)) => self.wait_settled(pending).await,
                outcome => return downcast(id, outcome),
            }
        }
    }

    /// Read a cell as an [`AsyncResult`] instead of an error for pending
    /// runs. Tracked like [`Graph::get`].
    pub fn loadable<H: CellHandle>(&self, cell: &H) -> AsyncResult<H::Value> {
        match self.get(cell) {
            Ok(value) => AsyncResult::Resolved(value),
            Err(CellError::Pending(pending)) => {
                // The run may have settled in between; hand out a token that
                // will never fire in that case.
                let token = self
                    .pending_token(pending)
                    .unwrap_or_else(|| CancelHandle::new().1);
                AsyncResult::Pending(token)
            }
            Err(err) => AsyncResult::Rejected(err),
        }
    }

    /// Force a computed cell to recompute on its next read, even though
    /// nothing it depends on changed. An in-flight run is cancelled and
    /// everything downstream is invalidated.
    pub fn force_reload<T>(&self, cell: &Computed<T>) -> Result<(), CellError> {
        let id = cell.id();
        let (version, current) = {
            let store = self.inner.store.lock();
            let computed = store
                .get(id)
                .and_then(Node::computed_ref)
                .ok_or(CellError::DanglingReference(id))?;
            let current = match store.get(computed.version).map(|node| &node.body) {
                Some(NodeBody::Source(value)) => value.downcast_ref::<u64>().copied(),
                _ => None,
            };
            (computed.version, current.unwrap_or_default())
        };
        debug!(cell = %id, version = current + 1, "reloading");
        self.write_value(version, Arc::new(current + 1))
    }

    /// Cancel the run in flight for `cell`, leaving it stale.
    ///
    /// Returns `false` if nothing was running. A later read starts a new
    /// run.
    pub fn cancel<T>(&self, cell: &Computed<T>) -> bool {
        let id = cell.id();
        let (superseded, listeners) = {
            let mut store = self.inner.store.lock();
            let Some(computed) = store.get_mut(id).and_then(Node::computed_mut) else {
                return false;
            };
            if computed.run.is_none() {
                return false;
            }
            let superseded: Vec<_> = computed.invalidate().into_iter().collect();
            debug!(cell = %id, "run cancelled");
            (superseded, store.listeners_of(&[id]))
        };
        finish(superseded, listeners);
        true
    }

    /// Remove a cell from the graph. Idempotent.
    ///
    /// Its run is cancelled and its outgoing edges dropped. Dependents find
    /// out on their next read, which yields `DanglingReference` (or caches
    /// it, depending on the graph's `DanglingPolicy`).
    pub fn dispose<H: CellHandle>(&self, cell: &H) {
        let id = cell.id();
        // The removed nodes are dropped here, after the lock is released:
        // their listeners may own subscriptions that lock the store again.
        let removal = self.inner.store.lock().remove(id);
        if removal.nodes.is_empty() {
            trace!(cell = %id, "already disposed");
            return;
        }
        debug!(cell = %id, removed = removal.nodes.len(), "disposed");
        if let Some(run) = removal.superseded {
            run.cancel();
        }
    }

    /// Register a listener called with the cell's id whenever the cell is
    /// written, invalidated or settles.
    ///
    /// Listeners run on the thread that caused the change, after the
    /// graph's lock is released.
    pub fn subscribe<H, F>(&self, cell: &H, listener: F) -> Result<Subscription, CellError>
    where
        H: CellHandle,
        F: Fn(CellId) + Send + Sync + 'static,
    {
        let id = cell.id();
        let subscriber = SubscriberId::new();
        let mut store = self.inner.store.lock();
        let node = store
            .get_mut(id)
            .ok_or(CellError::DanglingReference(id))?;
        node.listeners.push((subscriber, Arc::new(listener)));
        trace!(cell = %id, "listener added");
        Ok(Subscription {
            graph: Arc::downgrade(&self.inner),
            cell: id,
            id: subscriber,
        })
    }

    /// Current status of a cell, or `None` once it is disposed.
    pub fn status<H: CellHandle>(&self, cell: &H) -> Option<CellStatus> {
        self.inner.store.lock().status(cell.id())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.inner
            .store
            .lock()
            .snapshot(self.inner.config.label.clone())
    }

    pub fn contains<H: CellHandle>(&self, cell: &H) -> bool {
        self.inner.store.lock().contains(cell.id())
    }

    /// Number of cells, including internal reload-version cells.
    pub fn len(&self) -> usize {
        self.inner.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.inner.id)
            .field("label", &self.inner.config.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn graph_registers_cells() {
        let graph = Graph::new();
        assert!(graph.is_empty());

        let source = graph.source(1_i32);
        let derived = graph.computed(move |r| Ok(r.get(&source)? + 1));

        // The computed cell brings its reload-version cell along.
        assert_eq!(graph.len(), 3);
        assert!(graph.contains(&source));
        assert!(graph.contains(&derived));
        assert_eq!(graph.status(&derived), Some(CellStatus::Stale));

        graph.dispose(&derived);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.status(&derived), None);
    }

    #[test]
    fn update_applies_function() {
        let graph = Graph::new();
        let count = graph.source(1_i32);
        graph.update(&count, |v| v + 10).unwrap();
        assert_eq!(graph.get(&count).unwrap(), 11);
    }

    #[test]
    fn get_untracked_does_not_record() {
        let graph = Graph::new();
        let tracked = graph.source(1_i32);
        let untracked = graph.source(10_i32);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let sum = graph.computed(move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(r.get(&tracked)? + r.get_untracked(&untracked)?)
        });

        assert_eq!(graph.get(&sum).unwrap(), 11);
        graph.write(&untracked, 20).unwrap();
        assert_eq!(graph.get(&sum).unwrap(), 11);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        graph.write(&tracked, 2).unwrap();
        assert_eq!(graph.get(&sum).unwrap(), 22);
    }

    #[test]
    fn graphs_are_isolated() {
        let first = Graph::new();
        let second = Graph::new();
        let source = first.source(3_i32);

        // A derivation in `second` reading a cell of `first` does not track it.
        let reader = first.clone();
        let derived = second.computed(move |_| reader.get(&source));
        assert_eq!(second.get(&derived).unwrap(), 3);

        first.write(&source, 4).unwrap();
        assert_eq!(second.get(&derived).unwrap(), 3);
        assert!(matches!(
            second.get(&source),
            Err(CellError::DanglingReference(_))
        ));
    }

    #[test]
    fn global_graph_is_shared() {
        let cell = Graph::global().source("hello".to_string());
        assert_eq!(Graph::global().get(&cell).unwrap(), "hello");
        Graph::global().dispose(&cell);
    }

    #[test]
    fn loadable_resolves_sync_cells() {
        let graph = Graph::new();
        let source = graph.source(2_i32);
        assert_eq!(graph.loadable(&source).ok(), Some(2));

        let failing = graph.computed(|_| Err::<i32, _>(CellError::msg("broken")));
        assert!(graph.loadable(&failing).err().is_some());
    }

    #[test]
    fn cancel_without_run_is_noop() {
        let graph = Graph::new();
        let derived = graph.computed(|_| Ok(1_i32));
        assert!(!graph.cancel(&derived));
        assert_eq!(graph.get(&derived).unwrap(), 1);
        assert!(!graph.cancel(&derived));
        assert_eq!(graph.status(&derived), Some(CellStatus::Fresh));
    }
}
