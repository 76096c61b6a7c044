//! Computation Engine
//!
//! Reads, runs and settlements. Everything that touches a computed cell's
//! cache goes through here.
//!
//! # How a read works
//!
//! 1. Under the store lock, decide: serve the cache, report a pending
//!    asynchronous run, or start a new run (allocating its run-id).
//! 2. Release the lock and call the derivation. Synchronous derivations run
//!    inline with a tracker frame; asynchronous ones are handed to the
//!    graph's spawner.
//! 3. Re-take the lock and commit the outcome, but only if the run is still
//!    the cell's current run. A run that lost its place is discarded.
//!
//! Asynchronous runs settle the same way from their spawned task, and then
//! invalidate everything downstream, since dependents may have read the cell
//! while it was pending.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::cancel::{CancelHandle, CancellationToken};
use super::context::{Path, Tracker};
use super::reader::{AsyncReader, Reader};
use super::runtime::Graph;
use crate::config::DanglingPolicy;
use crate::error::CellError;
use crate::graph::{
    AsyncDerive, AsyncRun, Cached, CellId, Derivation, Listener, Node, NodeBody, NodeStore,
    RunEnd, RunMode, SupersededRun, SyncDerive, Value,
};

/// The result of reading one cell.
pub(crate) struct Observation {
    /// Generation of the cell at the time of the read, or `None` when the
    /// read must not become an edge (the cell is gone or on the path).
    pub(crate) generation: Option<u64>,
    /// Invalidation count of the cell at the time of the read. A cell can
    /// be invalidated without its generation moving.
    pub(crate) invalidations: u64,
    pub(crate) outcome: Result<Value, CellError>,
}

impl Observation {
    fn edge(generation: u64, invalidations: u64, outcome: Result<Value, CellError>) -> Self {
        Self {
            generation: Some(generation),
            invalidations,
            outcome,
        }
    }

    fn of(node: &Node, outcome: Result<Value, CellError>) -> Self {
        Self::edge(node.generation, node.invalidations(), outcome)
    }

    fn detached(err: CellError) -> Self {
        Self {
            generation: None,
            invalidations: 0,
            outcome: Err(err),
        }
    }
}

/// Decision taken under the lock at the start of a read.
enum Step {
    Done(Observation),
    RunSync {
        derive: SyncDerive,
        run_id: u64,
        invalidations: u64,
    },
    RunAsync {
        derive: AsyncDerive,
        run_id: u64,
        token: CancellationToken,
    },
}

enum Commit {
    Done(Observation),
    /// The run was invalidated while it ran; read again.
    Retry,
}

/// Whether a failed attempt is cached as the cell's result.
fn caches(err: &CellError, policy: DanglingPolicy) -> bool {
    match err {
        CellError::Pending(_) | CellError::CyclicDependency(_) => false,
        CellError::DanglingReference(_) => policy == DanglingPolicy::Reject,
        _ => true,
    }
}

pub(crate) fn downcast<T: Clone + 'static>(
    id: CellId,
    outcome: Result<Value, CellError>,
) -> Result<T, CellError> {
    let value = outcome?;
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or(CellError::TypeMismatch(id))
}

/// Drops the run of a derivation that panicked, so the cell goes back to
/// stale instead of staying `Computing` forever.
struct UnwindGuard<'a> {
    graph: &'a Graph,
    id: CellId,
    run_id: u64,
    armed: bool,
}

impl<'a> UnwindGuard<'a> {
    fn new(graph: &'a Graph, id: CellId, run_id: u64) -> Self {
        Self {
            graph,
            id,
            run_id,
            armed: true,
        }
    }

    /// The derivation returned normally.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut store = self.graph.inner.store.lock();
        let Some(computed) = store.get_mut(self.id).and_then(Node::computed_mut) else {
            return;
        };
        // Dropping an async run's record wakes its waiters.
        if computed.finish_run(self.run_id).is_some() {
            computed.stale = true;
            warn!(cell = %self.id, run = self.run_id, "derivation panicked");
        }
    }
}

/// Cancel superseded runs and call listeners. Must be called without the
/// store lock held.
pub(crate) fn finish(superseded: Vec<SupersededRun>, listeners: Vec<(CellId, Listener)>) {
    for run in superseded {
        run.cancel();
    }
    for (cell, listener) in listeners {
        listener(cell);
    }
}

impl Graph {
    /// Read `id` on behalf of a computation whose path is `path`.
    pub(crate) fn observe(&self, id: CellId, path: &[CellId]) -> Observation {
        if path.contains(&id) {
            debug!(cell = %id, "cyclic read");
            return Observation::detached(CellError::CyclicDependency(id));
        }
        loop {
            match self.plan(id) {
                Step::Done(observation) => return observation,
                Step::RunSync {
                    derive,
                    run_id,
                    invalidations,
                } => {
                    match self.run_sync(id, run_id, invalidations, derive, path) {
                        Commit::Done(observation) => return observation,
                        Commit::Retry => continue,
                    }
                }
                Step::RunAsync {
                    derive,
                    run_id,
                    token,
                } => return self.run_async(id, run_id, derive, token, path),
            }
        }
    }

    fn plan(&self, id: CellId) -> Step {
        let mut store = self.inner.store.lock();
        let fresh = store.is_fresh(id);
        let version_generation = store
            .get(id)
            .and_then(Node::computed_ref)
            .and_then(|computed| store.generation(computed.version))
            .unwrap_or_default();

        let Some(node) = store.get_mut(id) else {
            return Step::Done(Observation::detached(CellError::DanglingReference(id)));
        };
        let generation = node.generation;
        let computed = match &mut node.body {
            NodeBody::Source(value) => {
                return Step::Done(Observation::edge(generation, 0, Ok(Arc::clone(value))));
            }
            NodeBody::Computed(computed) => computed,
        };
        let invalidations = computed.invalidations;

        if fresh {
            if let Some(cached) = &computed.cache {
                return Step::Done(Observation::edge(
                    generation,
                    invalidations,
                    cached.to_result(),
                ));
            }
        }

        match computed.run.as_ref().map(|run| &run.mode) {
            Some(RunMode::Async(_)) => {
                return Step::Done(Observation::edge(
                    generation,
                    invalidations,
                    Err(CellError::Pending(id)),
                ));
            }
            Some(RunMode::Sync) => {
                // Another thread is computing; the last result stays visible
                // until that run commits.
                if let Some(cached) = &computed.cache {
                    trace!(cell = %id, "serving last result during run");
                    return Step::Done(Observation::edge(
                        generation,
                        invalidations,
                        cached.to_result(),
                    ));
                }
            }
            None => {}
        }

        // Every run depends on the cell's reload version.
        let version = computed.version;
        let reads = IndexMap::from([(version, version_generation)]);
        let step = match computed.derive.clone() {
            Derivation::Sync(derive) => {
                let run_id = computed.begin_run(RunMode::Sync, reads);
                Step::RunSync {
                    derive,
                    run_id,
                    invalidations,
                }
            }
            Derivation::Async(derive) => {
                let (cancel, token) = CancelHandle::new();
                let (done, _) = watch::channel(None);
                let run_id = computed.begin_run(RunMode::Async(AsyncRun { cancel, done }), reads);
                Step::RunAsync {
                    derive,
                    run_id,
                    token,
                }
            }
        };
        store.link(version, id);
        step
    }

    fn run_sync(
        &self,
        id: CellId,
        run_id: u64,
        invalidations: u64,
        derive: SyncDerive,
        path: &[CellId],
    ) -> Commit {
        trace!(cell = %id, run = run_id, "computing");
        let guard = UnwindGuard::new(self, id, run_id);
        let outcome = {
            let _frame = Tracker::enter(self.inner.id, id, run_id, path);
            derive(&Reader::new(self))
        };
        guard.disarm();

        let mut store = self.inner.store.lock();
        let Some(node) = store.get_mut(id) else {
            debug!(cell = %id, run = run_id, "disposed while computing");
            return Commit::Done(Observation::detached(CellError::DanglingReference(id)));
        };
        let generation = node.generation;
        let NodeBody::Computed(computed) = &mut node.body else {
            return Commit::Done(Observation::detached(CellError::TypeMismatch(id)));
        };

        let Some(run) = computed.finish_run(run_id) else {
            if computed.invalidations != invalidations {
                trace!(cell = %id, run = run_id, "run invalidated, reading again");
                return Commit::Retry;
            }
            // A concurrent run replaced this one without any input changing.
            trace!(cell = %id, run = run_id, "run replaced, result not committed");
            return Commit::Done(Observation::edge(generation, invalidations, outcome));
        };

        let generation = self.apply(&mut store, id, run_id, run.reads, &outcome);
        Commit::Done(Observation::edge(generation, invalidations, outcome))
    }

    fn run_async(
        &self,
        id: CellId,
        run_id: u64,
        derive: AsyncDerive,
        token: CancellationToken,
        path: &[CellId],
    ) -> Observation {
        debug!(cell = %id, run = run_id, token = token.id(), "starting async run");
        let mut run_path: Path = path.iter().copied().collect();
        run_path.push(id);
        let reader = AsyncReader::new(self.clone(), id, run_id, run_path);

        let future = {
            // Reads made through the graph before the first await belong to
            // this run, not to an enclosing synchronous frame.
            let guard = UnwindGuard::new(self, id, run_id);
            let _frame = Tracker::enter(self.inner.id, id, run_id, path);
            let future = derive(reader, token);
            guard.disarm();
            future
        };

        let graph = self.clone();
        let task = async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(cell = %id, run = run_id, "async derivation panicked");
                    Err(CellError::msg("async derivation panicked"))
                }
            };
            graph.settle(id, run_id, outcome);
        }
        .boxed();

        if self.inner.config.spawner.spawn(task).is_err() {
            self.settle(id, run_id, Err(CellError::RuntimeUnavailable(id)));
        }

        // The run may already have settled (or failed to spawn).
        let store = self.inner.store.lock();
        let Some(node) = store.get(id) else {
            return Observation::detached(CellError::DanglingReference(id));
        };
        let pending = Observation::of(node, Err(CellError::Pending(id)));
        match node.computed_ref() {
            Some(computed) if computed.is_current(run_id) => pending,
            Some(computed) if store.is_fresh(id) => match &computed.cache {
                Some(cached) => Observation::of(node, cached.to_result()),
                None => pending,
            },
            _ => pending,
        }
    }

    /// Store the outcome of the current run of `id`. The run must already
    /// have been taken off the cell. Returns the cell's new generation.
    fn apply(
        &self,
        store: &mut NodeStore,
        id: CellId,
        run_id: u64,
        reads: IndexMap<CellId, u64>,
        outcome: &Result<Value, CellError>,
    ) -> u64 {
        let cache = match outcome {
            Ok(value) => Some(Cached::Resolved(Arc::clone(value))),
            Err(err) if caches(err, self.inner.config.dangling_policy) => {
                Some(Cached::Rejected(err.clone()))
            }
            Err(_) => None,
        };

        if outcome.is_ok() {
            store.replace_dependencies(id, reads);
        } else {
            // Keep the last good edges; retrigger on what the attempt read.
            for dep in reads.keys() {
                store.link(*dep, id);
            }
            if let Some(computed) = store.get_mut(id).and_then(Node::computed_mut) {
                computed.observed = reads;
            }
        }

        let Some(node) = store.get_mut(id) else {
            return 0;
        };
        match cache {
            Some(cache) => {
                node.generation += 1;
                if let NodeBody::Computed(computed) = &mut node.body {
                    computed.cache = Some(cache);
                    computed.stale = false;
                }
                match outcome {
                    Ok(_) => debug!(cell = %id, run = run_id, generation = node.generation, "committed"),
                    Err(err) => debug!(cell = %id, run = run_id, %err, "rejected"),
                }
            }
            None => {
                if let NodeBody::Computed(computed) = &mut node.body {
                    computed.stale = true;
                }
                trace!(cell = %id, run = run_id, "attempt not cached");
            }
        }
        node.generation
    }

    /// Settle an asynchronous run.
    ///
    /// A run that is no longer current is discarded. Otherwise its outcome
    /// is committed, everything downstream is invalidated, and listeners
    /// are notified.
    pub(crate) fn settle(&self, id: CellId, run_id: u64, outcome: Result<Value, CellError>) {
        let (superseded, listeners) = {
            let mut store = self.inner.store.lock();
            let Some(computed) = store.get_mut(id).and_then(Node::computed_mut) else {
                trace!(cell = %id, run = run_id, "settled after disposal");
                return;
            };
            let Some(run) = computed.finish_run(run_id) else {
                trace!(cell = %id, run = run_id, "discarding superseded run");
                return;
            };
            let RunMode::Async(async_run) = run.mode else {
                return;
            };

            self.apply(&mut store, id, run_id, run.reads, &outcome);
            let end = match &outcome {
                Err(CellError::Pending(upstream)) => RunEnd::Blocked(*upstream),
                _ => RunEnd::Settled,
            };
            async_run.done.send_replace(Some(end));

            let affected = match store.downstream_of(id) {
                Ok(affected) => affected,
                Err(err) => {
                    warn!(cell = %id, %err, "not propagating settlement");
                    Vec::new()
                }
            };
            let superseded = store.mark_stale(&affected);

            let mut notified = Vec::with_capacity(affected.len() + 1);
            notified.push(id);
            notified.extend(affected);
            (superseded, store.listeners_of(&notified))
        };
        finish(superseded, listeners);
    }

    /// Record that run `run_id` of `owner` read `dep`.
    ///
    /// The back-reference is added before the run commits, so a write that
    /// lands in the meantime still reaches the run. If the upstream already
    /// moved on since it was read, the run is superseded right away.
    pub(crate) fn record_read(
        &self,
        owner: CellId,
        run_id: u64,
        dep: CellId,
        observation: &Observation,
    ) {
        let Some(generation) = observation.generation else {
            return;
        };
        let superseded = {
            let mut store = self.inner.store.lock();
            let outdated = store.get(dep).map_or(true, |node| {
                node.generation != generation || node.invalidations() != observation.invalidations
            });
            let Some(computed) = store.get_mut(owner).and_then(Node::computed_mut) else {
                return;
            };
            let Some(run) = computed.current_run_mut(run_id) else {
                return;
            };
            run.reads.insert(dep, generation);
            let superseded = if outdated {
                debug!(cell = %owner, run = run_id, dep = %dep, "read an outdated upstream");
                computed.invalidate()
            } else {
                None
            };
            store.link(dep, owner);
            superseded
        };
        if let Some(run) = superseded {
            run.cancel();
        }
    }

    pub(crate) fn is_current_run(&self, id: CellId, run_id: u64) -> bool {
        self.inner
            .store
            .lock()
            .get(id)
            .and_then(Node::computed_ref)
            .is_some_and(|computed| computed.is_current(run_id))
    }

    /// Token of the asynchronous run in flight for `id`, if any.
    pub(crate) fn pending_token(&self, id: CellId) -> Option<CancellationToken> {
        let store = self.inner.store.lock();
        match &store.get(id)?.computed_ref()?.run.as_ref()?.mode {
            RunMode::Async(run) => Some(run.cancel.token()),
            RunMode::Sync => None,
        }
    }

    /// Wait until the asynchronous run in flight for `id` settles or is
    /// superseded. Returns right away (after yielding) if there is none.
    ///
    /// A run that gave up on a pending upstream hands the wait over to that
    /// upstream; reading the cell again before it settles would only start
    /// another run that gives up the same way.
    pub(crate) async fn wait_settled(&self, mut id: CellId) {
        loop {
            let done = {
                let store = self.inner.store.lock();
                store
                    .get(id)
                    .and_then(Node::computed_ref)
                    .and_then(|computed| computed.run.as_ref())
                    .and_then(|run| match &run.mode {
                        RunMode::Async(run) => Some(run.done.subscribe()),
                        RunMode::Sync => None,
                    })
            };
            let Some(mut done) = done else {
                tokio::task::yield_now().await;
                return;
            };
            let end = done.wait_for(Option::is_some).await.ok().and_then(|end| *end);
            match end {
                Some(RunEnd::Blocked(upstream)) if upstream != id => {
                    trace!(cell = %id, upstream = %upstream, "waiting on upstream");
                    id = upstream;
                }
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::graph::CellStatus;

    #[test]
    fn only_settled_failures_are_cached() {
        let id = CellId::new();
        assert!(caches(&CellError::msg("boom"), DanglingPolicy::Reject));
        assert!(caches(&CellError::RuntimeUnavailable(id), DanglingPolicy::Stale));
        assert!(!caches(&CellError::Pending(id), DanglingPolicy::Reject));
        assert!(!caches(&CellError::CyclicDependency(id), DanglingPolicy::Reject));
        assert!(caches(&CellError::DanglingReference(id), DanglingPolicy::Reject));
        assert!(!caches(&CellError::DanglingReference(id), DanglingPolicy::Stale));
    }

    #[test]
    fn downcast_checks_type() {
        let id = CellId::new();
        let value: Value = Arc::new(5_i32);
        assert_eq!(downcast::<i32>(id, Ok(value.clone())).unwrap(), 5);
        assert!(matches!(
            downcast::<String>(id, Ok(value)),
            Err(CellError::TypeMismatch(_))
        ));
    }

    #[test]
    fn stale_settlement_is_discarded() {
        let graph = Graph::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cell = graph.computed(move |_| Ok(counter.fetch_add(1, Ordering::SeqCst)));

        assert_eq!(graph.get(&cell).unwrap(), 0);

        // A settlement for a run that never existed changes nothing.
        graph.settle(cell.id(), 99, Ok(Arc::new(42_usize)));
        assert_eq!(graph.get(&cell).unwrap(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cycle_on_path_is_not_linked() {
        let graph = Graph::new();
        let source = graph.source(1_i32);
        let observation = graph.observe(source.id(), &[source.id()]);
        assert!(observation.generation.is_none());
        assert!(matches!(
            observation.outcome,
            Err(CellError::CyclicDependency(id)) if id == source.id()
        ));
    }

    #[test]
    fn async_read_without_runtime_is_rejected() {
        let graph = Graph::new();
        let cell = graph.computed_async(|_, _| async { Ok::<_, CellError>(1_u8) });

        let err = graph.get(&cell).unwrap_err();
        assert!(matches!(err, CellError::RuntimeUnavailable(id) if id == cell.id()));
        assert_eq!(graph.status(&cell), Some(CellStatus::Fresh));
    }
}
