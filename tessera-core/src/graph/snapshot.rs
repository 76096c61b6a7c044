//! Serializable view of a graph, for debugging and tooling.

use serde::Serialize;

use super::node::{CellId, CellKind, CellStatus, Node, NodeBody};
use super::store::NodeStore;

/// Point-in-time description of every cell in a graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    /// Label from the graph configuration, if any.
    pub label: Option<String>,
    /// Cells ordered by id.
    pub cells: Vec<CellSnapshot>,
}

/// Description of one cell.
#[derive(Debug, Clone, Serialize)]
pub struct CellSnapshot {
    pub id: CellId,
    pub kind: CellKind,
    pub status: CellStatus,
    pub generation: u64,
    /// Id of the run in progress, if any.
    pub run_id: Option<u64>,
    /// Committed upstreams (empty for source cells).
    pub dependencies: Vec<CellId>,
    /// Cells holding a back-reference to this one.
    pub dependents: Vec<CellId>,
    /// Whether the cached result is an error.
    pub rejected: bool,
    /// Internal reload-version cells.
    pub hidden: bool,
}

impl GraphSnapshot {
    /// Look up a cell by id.
    pub fn cell(&self, id: CellId) -> Option<&CellSnapshot> {
        self.cells.iter().find(|cell| cell.id == id)
    }

    /// Cells that are not internal.
    pub fn visible(&self) -> impl Iterator<Item = &CellSnapshot> {
        self.cells.iter().filter(|cell| !cell.hidden)
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl CellSnapshot {
    fn of(node: &Node, status: CellStatus) -> Self {
        let (dependencies, run_id, rejected) = match &node.body {
            NodeBody::Source(_) => (Vec::new(), None, false),
            NodeBody::Computed(c) => (
                c.dependencies.keys().copied().collect(),
                c.run.as_ref().map(|run| run.id),
                matches!(c.cache, Some(super::node::Cached::Rejected(_))),
            ),
        };
        Self {
            id: node.id(),
            kind: node.kind(),
            status,
            generation: node.generation,
            run_id,
            dependencies,
            dependents: node.dependents.iter().copied().collect(),
            rejected,
            hidden: node.hidden,
        }
    }
}

impl NodeStore {
    pub(crate) fn snapshot(&self, label: Option<String>) -> GraphSnapshot {
        let mut cells: Vec<CellSnapshot> = self
            .iter()
            .map(|node| {
                let status = self.status(node.id()).unwrap_or_else(|| node.status());
                CellSnapshot::of(node, status)
            })
            .collect();
        cells.sort_by_key(|cell| cell.id);
        GraphSnapshot { label, cells }
    }
}
