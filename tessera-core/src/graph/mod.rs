//! Dependency Graph
//!
//! This module holds the cells of a graph and the edges between them.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are cells: source cells, or computed cells with their cached result
//! - Edges are reads: if computed cell A read B during its latest run, there
//!   is an edge from B to A
//!
//! When a cell changes, the scheduler walks the edges to mark everything
//! downstream stale. Recomputation happens later, when a stale cell is read.
//!
//! # Design Decisions
//!
//! 1. Nodes live in one centralized store per graph, guarded by a single
//!    mutex, so structural mutation is never interleaved.
//!
//! 2. The store is indexed by cell ID for O(1) lookups.
//!
//! 3. Forward edges (a computed cell's dependencies) are owned by the
//!    computed cell and replaced wholesale after each successful run.
//!    Reverse edges (dependents) are back-references that may lag behind;
//!    the scheduler verifies and prunes them while walking.

mod node;
mod scheduler;
mod snapshot;
mod store;

pub use node::{CellId, CellKind, CellStatus};
pub use snapshot::{CellSnapshot, GraphSnapshot};

pub(crate) use node::{
    AsyncDerive, AsyncRun, Cached, Derivation, Listener, Node, NodeBody, RunEnd, RunMode,
    SupersededRun, SyncDerive, Value,
};
pub(crate) use store::NodeStore;
