//! Graph Nodes
//!
//! This module defines the cell records that live in the node store.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::CellError;
use crate::reactive::{AsyncReader, CancelHandle, CancellationToken, Reader, SubscriberId};

/// Type-erased cell value.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

pub(crate) type SyncDerive =
    Arc<dyn Fn(&Reader<'_>) -> Result<Value, CellError> + Send + Sync>;

pub(crate) type AsyncDerive = Arc<
    dyn Fn(AsyncReader, CancellationToken) -> BoxFuture<'static, Result<Value, CellError>>
        + Send
        + Sync,
>;

pub(crate) type Listener = Arc<dyn Fn(CellId) + Send + Sync>;

/// Unique identifier for a cell.
///
/// Ids come from a process-wide counter, so a handle from one graph never
/// aliases a cell of another graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// The kind of cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// A directly settable value. These are the roots of the graph.
    Source,

    /// A cell derived by a synchronous function.
    ComputedSync,

    /// A cell derived by an asynchronous function.
    ComputedAsync,
}

/// Freshness of a cell's cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    /// The cached result is up-to-date. Source cells are always fresh.
    Fresh,

    /// An upstream changed (or nothing was computed yet); the next read
    /// recomputes.
    Stale,

    /// A run is in progress.
    Computing,
}

/// How a computed cell produces its value.
#[derive(Clone)]
pub(crate) enum Derivation {
    Sync(SyncDerive),
    Async(AsyncDerive),
}

/// A settled result stored in a computed cell.
#[derive(Clone)]
pub(crate) enum Cached {
    Resolved(Value),
    Rejected(CellError),
}

impl Cached {
    pub(crate) fn to_result(&self) -> Result<Value, CellError> {
        match self {
            Cached::Resolved(value) => Ok(Arc::clone(value)),
            Cached::Rejected(err) => Err(err.clone()),
        }
    }
}

/// How an asynchronous run ended, as seen by whoever waits on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEnd {
    Settled,
    Superseded,
    /// The derivation gave up with `Pending` on this upstream.
    Blocked(CellId),
}

/// Bookkeeping for an asynchronous run that has not settled.
pub(crate) struct AsyncRun {
    pub(crate) cancel: CancelHandle,
    /// Set once the run settles or is superseded.
    pub(crate) done: watch::Sender<Option<RunEnd>>,
}

pub(crate) enum RunMode {
    Sync,
    Async(AsyncRun),
}

/// The current computation attempt of a computed cell.
pub(crate) struct RunRecord {
    pub(crate) id: u64,
    /// Reads performed by the run so far, with the generation observed.
    /// The invalidator follows these before the run commits.
    pub(crate) reads: IndexMap<CellId, u64>,
    pub(crate) mode: RunMode,
}

/// A run that lost its place as the cell's current run.
#[must_use = "superseded runs must be cancelled"]
pub(crate) struct SupersededRun {
    pub(crate) id: u64,
    cancel: Option<CancelHandle>,
}

impl SupersededRun {
    /// Signal cancellation to the run's derivation, if it is asynchronous.
    pub(crate) fn cancel(self) {
        if let Some(cancel) = self.cancel {
            cancel.cancel();
        }
    }
}

/// State owned by a computed cell.
pub(crate) struct ComputedNode {
    pub(crate) derive: Derivation,

    /// Hidden source cell written by `force_reload`.
    pub(crate) version: CellId,

    /// Set by the invalidator, cleared when a run commits.
    pub(crate) stale: bool,

    pub(crate) cache: Option<Cached>,

    /// Upstreams read by the last successful run.
    pub(crate) dependencies: IndexMap<CellId, u64>,

    /// Upstreams read by the run that produced `cache`, or by the latest
    /// attempt that failed without caching.
    pub(crate) observed: IndexMap<CellId, u64>,

    pub(crate) last_run_id: u64,
    pub(crate) run: Option<RunRecord>,

    /// Bumped by every invalidation. A synchronous run that sees a different
    /// count at commit time computed from outdated inputs.
    pub(crate) invalidations: u64,
}

impl ComputedNode {
    pub(crate) fn new(derive: Derivation, version: CellId) -> Self {
        Self {
            derive,
            version,
            stale: true,
            cache: None,
            dependencies: IndexMap::new(),
            observed: IndexMap::new(),
            last_run_id: 0,
            run: None,
            invalidations: 0,
        }
    }

    pub(crate) fn is_async(&self) -> bool {
        matches!(self.derive, Derivation::Async(_))
    }

    pub(crate) fn status(&self) -> CellStatus {
        if self.run.is_some() {
            CellStatus::Computing
        } else if self.stale || self.cache.is_none() {
            CellStatus::Stale
        } else {
            CellStatus::Fresh
        }
    }

    /// Whether `dep` is still an upstream of this cell, either through the
    /// committed edges, the observed set, or the in-flight run.
    pub(crate) fn tracks(&self, dep: CellId) -> bool {
        self.dependencies.contains_key(&dep)
            || self.observed.contains_key(&dep)
            || self
                .run
                .as_ref()
                .is_some_and(|run| run.reads.contains_key(&dep))
    }

    /// Allocate the next run-id and record the run as current, seeded with
    /// the reads it makes before calling the derivation.
    pub(crate) fn begin_run(&mut self, mode: RunMode, reads: IndexMap<CellId, u64>) -> u64 {
        self.last_run_id += 1;
        self.run = Some(RunRecord {
            id: self.last_run_id,
            reads,
            mode,
        });
        self.last_run_id
    }

    /// The run `run_id`, if it is still current.
    pub(crate) fn current_run_mut(&mut self, run_id: u64) -> Option<&mut RunRecord> {
        self.run.as_mut().filter(|run| run.id == run_id)
    }

    /// Whether `run_id` is the cell's current run.
    pub(crate) fn is_current(&self, run_id: u64) -> bool {
        self.run.as_ref().is_some_and(|run| run.id == run_id)
    }

    /// Drop the current run and wake anyone waiting on it.
    ///
    /// The returned record still has to be cancelled; callers do that after
    /// releasing the store lock, since cancellation runs user listeners.
    pub(crate) fn supersede(&mut self) -> Option<SupersededRun> {
        let run = self.run.take()?;
        let cancel = match run.mode {
            RunMode::Async(run) => {
                run.done.send_replace(Some(RunEnd::Superseded));
                Some(run.cancel)
            }
            RunMode::Sync => None,
        };
        Some(SupersededRun { id: run.id, cancel })
    }

    /// Take the current run if it is `run_id`.
    pub(crate) fn finish_run(&mut self, run_id: u64) -> Option<RunRecord> {
        if self.is_current(run_id) {
            self.run.take()
        } else {
            None
        }
    }

    /// Mark the cell stale and supersede any run in progress.
    pub(crate) fn invalidate(&mut self) -> Option<SupersededRun> {
        self.stale = true;
        self.invalidations += 1;
        self.supersede()
    }
}

/// Payload of a node.
pub(crate) enum NodeBody {
    Source(Value),
    Computed(ComputedNode),
}

/// A cell in the dependency graph.
pub(crate) struct Node {
    id: CellId,

    /// Bumped whenever the cell's observable value changes.
    pub(crate) generation: u64,

    /// Cells that read this cell. Entries may be stale; the invalidator
    /// checks them against the dependent's own sets.
    pub(crate) dependents: IndexSet<CellId>,

    pub(crate) listeners: Vec<(SubscriberId, Listener)>,

    /// Internal cells (reload versions) are hidden from snapshots by default.
    pub(crate) hidden: bool,

    pub(crate) body: NodeBody,
}

impl Node {
    /// Create a new source node.
    pub(crate) fn source(value: Value) -> Self {
        Self::with_body(NodeBody::Source(value))
    }

    /// Create a new computed node.
    pub(crate) fn computed(derive: Derivation, version: CellId) -> Self {
        Self::with_body(NodeBody::Computed(ComputedNode::new(derive, version)))
    }

    fn with_body(body: NodeBody) -> Self {
        Self {
            id: CellId::new(),
            generation: 0,
            dependents: IndexSet::new(),
            listeners: Vec::new(),
            hidden: false,
            body,
        }
    }

    pub(crate) fn hide(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Get the node's ID.
    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    /// Get the node's kind.
    pub(crate) fn kind(&self) -> CellKind {
        match &self.body {
            NodeBody::Source(_) => CellKind::Source,
            NodeBody::Computed(c) if c.is_async() => CellKind::ComputedAsync,
            NodeBody::Computed(_) => CellKind::ComputedSync,
        }
    }

    pub(crate) fn status(&self) -> CellStatus {
        match &self.body {
            NodeBody::Source(_) => CellStatus::Fresh,
            NodeBody::Computed(c) => c.status(),
        }
    }

    pub(crate) fn computed_mut(&mut self) -> Option<&mut ComputedNode> {
        match &mut self.body {
            NodeBody::Computed(c) => Some(c),
            NodeBody::Source(_) => None,
        }
    }

    pub(crate) fn computed_ref(&self) -> Option<&ComputedNode> {
        match &self.body {
            NodeBody::Computed(c) => Some(c),
            NodeBody::Source(_) => None,
        }
    }

    /// Invalidation count of a computed cell; always zero for sources.
    pub(crate) fn invalidations(&self) -> u64 {
        self.computed_ref().map_or(0, |c| c.invalidations)
    }

    /// Whether `dep` is an upstream of this node.
    pub(crate) fn tracks(&self, dep: CellId) -> bool {
        self.computed_ref().is_some_and(|c| c.tracks(dep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(_: &Reader<'_>) -> Result<Value, CellError> {
        Ok(Arc::new(1_i32))
    }

    fn constant() -> Derivation {
        Derivation::Sync(Arc::new(one))
    }

    fn async_run() -> (RunMode, CancellationToken, watch::Receiver<Option<RunEnd>>) {
        let (cancel, token) = CancelHandle::new();
        let (done, rx) = watch::channel(None);
        (RunMode::Async(AsyncRun { cancel, done }), token, rx)
    }

    #[test]
    fn cell_ids_are_unique() {
        let id1 = CellId::new();
        let id2 = CellId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.to_string(), format!("cell#{}", id1.raw()));
    }

    #[test]
    fn source_node_is_fresh() {
        let node = Node::source(Arc::new(0_u8));
        assert_eq!(node.kind(), CellKind::Source);
        assert_eq!(node.status(), CellStatus::Fresh);
        assert!(!node.tracks(CellId::new()));
    }

    #[test]
    fn computed_node_starts_stale() {
        let node = Node::computed(constant(), CellId::new());
        assert_eq!(node.kind(), CellKind::ComputedSync);
        assert_eq!(node.status(), CellStatus::Stale);
    }

    #[test]
    fn run_ids_increase_and_only_current_finishes() {
        let mut c = ComputedNode::new(constant(), CellId::new());
        let first = c.begin_run(RunMode::Sync, IndexMap::new());
        let second = c.begin_run(RunMode::Sync, IndexMap::new());
        assert!(second > first);
        assert_eq!(c.status(), CellStatus::Computing);

        assert!(c.finish_run(first).is_none());
        assert!(c.finish_run(second).is_some());
        assert!(c.run.is_none());
    }

    #[test]
    fn invalidate_cancels_async_run() {
        let mut c = ComputedNode::new(constant(), CellId::new());
        let (mode, token, rx) = async_run();
        let id = c.begin_run(mode, IndexMap::new());
        c.stale = false;

        let superseded = c.invalidate().unwrap();
        assert_eq!(superseded.id, id);
        assert_eq!(*rx.borrow(), Some(RunEnd::Superseded));
        assert!(!token.is_cancelled());

        superseded.cancel();
        assert!(token.is_cancelled());
        assert!(c.stale);
        assert_eq!(c.invalidations, 1);
        assert!(!c.is_current(id));
    }

    #[test]
    fn tracks_in_flight_reads() {
        let dep = CellId::new();
        let mut c = ComputedNode::new(constant(), CellId::new());
        let (mode, _token, _rx) = async_run();
        c.begin_run(mode, IndexMap::from([(dep, 3)]));
        assert!(c.tracks(dep));

        c.supersede().unwrap().cancel();
        assert!(!c.tracks(dep));
    }

    #[test]
    fn tracks_reads_of_a_sync_run() {
        let dep = CellId::new();
        let mut c = ComputedNode::new(constant(), CellId::new());
        let run_id = c.begin_run(RunMode::Sync, IndexMap::new());
        assert!(!c.tracks(dep));

        c.current_run_mut(run_id).unwrap().reads.insert(dep, 0);
        assert!(c.tracks(dep));
        assert!(c.current_run_mut(run_id + 1).is_none());
    }
}
