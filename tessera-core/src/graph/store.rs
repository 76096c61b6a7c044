//! Node Store
//!
//! The registry of every cell in a graph. It is the single source of truth
//! for identity and owns all nodes for their registered lifetime. Edges are
//! kept on both sides: a computed cell owns its dependency sets, and each
//! upstream keeps a back-reference set used only for invalidation fan-out.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::trace;

use super::node::{CellId, CellStatus, Listener, Node, NodeBody, SupersededRun};

/// What `NodeStore::remove` took out of the store.
#[derive(Default)]
pub(crate) struct Removal {
    /// The removed cell and its version cell. Dropping them runs user code
    /// (listener closures, values), so callers drop them unlocked.
    pub(crate) nodes: Vec<Node>,
    pub(crate) superseded: Option<SupersededRun>,
}

/// All nodes of one graph, indexed by ID.
#[derive(Default)]
pub(crate) struct NodeStore {
    nodes: HashMap<CellId, Node>,
}

impl NodeStore {
    /// Create a new empty store.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a node to the store.
    pub(crate) fn insert(&mut self, node: Node) -> CellId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    pub(crate) fn get(&self, id: CellId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: CellId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: CellId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Current generation of a cell, or `None` once it is disposed.
    pub(crate) fn generation(&self, id: CellId) -> Option<u64> {
        self.nodes.get(&id).map(|node| node.generation)
    }

    /// Record that `dependent` read `dependency`.
    pub(crate) fn link(&mut self, dependency: CellId, dependent: CellId) {
        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.dependents.insert(dependent);
        }
    }

    /// Drop the back-reference from `dependency` to `dependent`.
    pub(crate) fn unlink(&mut self, dependency: CellId, dependent: CellId) {
        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.dependents.shift_remove(&dependent);
        }
    }

    /// Whether a computed cell's cache may be returned without recomputing.
    ///
    /// The cache is valid when the cell is not marked stale and every
    /// upstream it observed still has the generation it had at the time.
    pub(crate) fn is_fresh(&self, id: CellId) -> bool {
        let Some(computed) = self.nodes.get(&id).and_then(Node::computed_ref) else {
            return false;
        };
        !computed.stale
            && computed.cache.is_some()
            && computed
                .observed
                .iter()
                .all(|(dep, seen)| self.generation(*dep) == Some(*seen))
    }

    /// Status of a cell, taking upstream generations into account.
    pub(crate) fn status(&self, id: CellId) -> Option<CellStatus> {
        let node = self.nodes.get(&id)?;
        Some(match node.status() {
            CellStatus::Fresh if node.computed_ref().is_some() && !self.is_fresh(id) => {
                CellStatus::Stale
            }
            status => status,
        })
    }

    /// Replace a computed cell's committed dependency set, fixing up the
    /// back-references on both the dropped and the new upstreams.
    pub(crate) fn replace_dependencies(&mut self, id: CellId, reads: IndexMap<CellId, u64>) {
        let Some(computed) = self.nodes.get_mut(&id).and_then(Node::computed_mut) else {
            return;
        };
        let previous = std::mem::replace(&mut computed.dependencies, reads.clone());
        computed.observed = reads.clone();

        for dep in previous.keys().filter(|dep| !reads.contains_key(*dep)) {
            trace!(cell = %id, dep = %dep, "dropping edge");
            self.unlink(*dep, id);
        }
        for dep in reads.keys() {
            self.link(*dep, id);
        }
    }

    /// Remove a node, its hidden version cell, and every edge it owns.
    ///
    /// Dependents are left untouched; they discover the removal on their
    /// next read. Removing a missing cell is a no-op.
    pub(crate) fn remove(&mut self, id: CellId) -> Removal {
        let mut removal = Removal::default();
        let Some(mut node) = self.nodes.remove(&id) else {
            return removal;
        };

        if let NodeBody::Computed(computed) = &mut node.body {
            removal.superseded = computed.supersede();
            let upstreams: Vec<CellId> = computed
                .dependencies
                .keys()
                .chain(computed.observed.keys())
                .copied()
                .collect();
            for dep in upstreams {
                self.unlink(dep, id);
            }
            if let Some(version) = self.nodes.remove(&computed.version) {
                removal.nodes.push(version);
            }
        }
        removal.nodes.insert(0, node);
        removal
    }

    /// Listeners registered on any of `ids`, in the given order.
    pub(crate) fn listeners_of(&self, ids: &[CellId]) -> Vec<(CellId, Listener)> {
        ids.iter()
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|node| {
                node.listeners
                    .iter()
                    .map(move |(_, listener)| (node.id(), listener.clone()))
            })
            .collect()
    }
}
