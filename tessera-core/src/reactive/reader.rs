//! Readers handed to derivation functions.
//!
//! A synchronous derivation receives a [`Reader`]; every read through it is
//! recorded as an upstream of the running cell. An asynchronous derivation
//! receives an [`AsyncReader`], which records into its own run instead of
//! the thread-local tracker, since the run may hop between threads.

use std::fmt;

use super::cell::CellHandle;
use super::context::Path;
use super::engine::downcast;
use super::runtime::Graph;
use crate::error::CellError;
use crate::graph::CellId;

/// Tracked access to other cells from a synchronous derivation.
pub struct Reader<'a> {
    graph: &'a Graph,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(graph: &'a Graph) -> Self {
        Self { graph }
    }

    /// Read a cell and record it as a dependency of the running cell.
    pub fn get<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        self.graph.get(cell)
    }

    /// Read a cell without recording a dependency.
    pub fn get_untracked<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        self.graph.get_untracked(cell)
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }
}

impl fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader").finish_non_exhaustive()
    }
}

/// Tracked access to other cells from an asynchronous derivation.
///
/// Owned and `Send`, so it can move into the derivation's future.
#[derive(Clone)]
pub struct AsyncReader {
    graph: Graph,
    owner: CellId,
    run_id: u64,
    /// Computation path ending with `owner`.
    path: Path,
}

impl AsyncReader {
    pub(crate) fn new(graph: Graph, owner: CellId, run_id: u64, path: Path) -> Self {
        Self {
            graph,
            owner,
            run_id,
            path,
        }
    }

    /// The cell this run computes.
    pub fn cell(&self) -> CellId {
        self.owner
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Whether this run is still the cell's current run. Once it is not,
    /// whatever it produces will be discarded.
    pub fn is_current(&self) -> bool {
        self.graph.is_current_run(self.owner, self.run_id)
    }

    /// Read a cell, suspending while it (or one of its upstreams) has an
    /// asynchronous run in flight.
    ///
    /// Only the settled read is recorded as a dependency.
    pub async fn get<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        let id = cell.id();
        loop {
            let observation = self.graph.observe(id, &self.path);
            if let Err(CellError::Pending(pending)) = &observation.outcome {
                if self.is_current() {
                    self.graph.wait_settled(*pending).await;
                    continue;
                }
            }
            self.graph
                .record_read(self.owner, self.run_id, id, &observation);
            return downcast(id, observation.outcome);
        }
    }

    /// Read a cell without waiting. A pending upstream yields
    /// `CellError::Pending`, and the read is still recorded so this cell is
    /// invalidated once the upstream settles.
    pub fn get_now<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        let id = cell.id();
        let observation = self.graph.observe(id, &self.path);
        self.graph
            .record_read(self.owner, self.run_id, id, &observation);
        downcast(id, observation.outcome)
    }

    /// Read a cell without recording a dependency.
    pub fn get_untracked<H: CellHandle>(&self, cell: &H) -> Result<H::Value, CellError> {
        let id = cell.id();
        downcast(id, self.graph.observe(id, &self.path).outcome)
    }
}

impl fmt::Debug for AsyncReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReader")
            .field("cell", &self.owner)
            .field("run_id", &self.run_id)
            .finish()
    }
}
