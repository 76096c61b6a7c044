//! Invalidation Scheduler
//!
//! Propagates staleness from a changed cell to everything downstream of it.
//! Propagation is pull-based: cells are only marked, never recomputed here.
//!
//! # Algorithm
//!
//! 1. Walk the back-references breadth-first from the changed cell, visiting
//!    each node once. A back-reference whose target no longer tracks the
//!    upstream (its latest run stopped reading it) is pruned instead of
//!    followed.
//! 2. Sort the reached subgraph topologically with Kahn's algorithm. If the
//!    sort cannot consume every node, the subgraph contains a cycle and the
//!    whole operation fails before anything was marked.
//! 3. Mark every reached computed cell stale, superseding its in-flight run.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexSet;
use tracing::{debug, trace};

use super::node::{CellId, SupersededRun};
use super::store::NodeStore;
use crate::error::CellError;

impl NodeStore {
    /// Collect every cell downstream of `origin`, in dependency order.
    ///
    /// `origin` itself is not part of the result.
    pub(crate) fn downstream_of(&mut self, origin: CellId) -> Result<Vec<CellId>, CellError> {
        let mut visited = IndexSet::new();
        let mut queue = VecDeque::new();
        let mut stale_links = Vec::new();

        visited.insert(origin);
        queue.push_back(origin);

        while let Some(id) = queue.pop_front() {
            let Some(node) = self.get(id) else {
                continue;
            };
            for &dependent in &node.dependents {
                match self.get(dependent) {
                    Some(d) if d.tracks(id) => {
                        if visited.insert(dependent) {
                            queue.push_back(dependent);
                        }
                    }
                    _ => stale_links.push((id, dependent)),
                }
            }
        }

        for (dependency, dependent) in stale_links {
            trace!(cell = %dependency, dependent = %dependent, "pruning stale back-reference");
            self.unlink(dependency, dependent);
        }

        let order = self.topological_sort(&visited)?;
        Ok(order.into_iter().filter(|id| *id != origin).collect())
    }

    /// Mark the given cells stale, superseding their runs.
    ///
    /// The superseded runs are returned so the caller can cancel them once
    /// the store lock is released.
    pub(crate) fn mark_stale(&mut self, ids: &[CellId]) -> Vec<SupersededRun> {
        let mut superseded = Vec::new();
        for &id in ids {
            let Some(computed) = self.get_mut(id).and_then(|n| n.computed_mut()) else {
                continue;
            };
            if let Some(run) = computed.invalidate() {
                debug!(cell = %id, run = run.id, "superseded in-flight run");
                superseded.push(run);
            }
        }
        superseded
    }

    /// Order `nodes` so that upstreams come before their dependents.
    ///
    /// Only edges between members of `nodes` are considered.
    fn topological_sort(&self, nodes: &IndexSet<CellId>) -> Result<Vec<CellId>, CellError> {
        let mut in_degree: HashMap<CellId, usize> = nodes.iter().map(|id| (*id, 0)).collect();

        for &id in nodes {
            for dependent in self.live_dependents(id, nodes) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<CellId> = nodes
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .copied()
            .collect();
        let mut result = Vec::with_capacity(nodes.len());

        // Kahn's algorithm
        while let Some(id) = queue.pop_front() {
            result.push(id);
            for dependent in self.live_dependents(id, nodes) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if result.len() < nodes.len() {
            let culprit = nodes
                .iter()
                .find(|id| in_degree.get(*id).is_some_and(|d| *d > 0))
                .copied()
                .unwrap_or(nodes[0]);
            return Err(CellError::CyclicDependency(culprit));
        }
        Ok(result)
    }

    fn live_dependents<'a>(
        &'a self,
        id: CellId,
        within: &'a IndexSet<CellId>,
    ) -> impl Iterator<Item = CellId> + 'a {
        self.get(id)
            .into_iter()
            .flat_map(|node| node.dependents.iter().copied())
            .filter(move |dependent| {
                within.contains(dependent)
                    && self.get(*dependent).is_some_and(|d| d.tracks(id))
            })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::graph::node::{CellStatus, Node};
    use crate::graph::store::tests::{add_computed, add_source};

    #[test]
    fn downstream_propagates_in_order() {
        let mut store = NodeStore::new();

        // Create a chain: source -> derived1 -> derived2
        let source = add_source(&mut store);
        let derived1 = add_computed(&mut store, &[source]);
        let derived2 = add_computed(&mut store, &[derived1]);

        let affected = store.downstream_of(source).unwrap();
        assert_eq!(affected, vec![derived1, derived2]);
    }

    #[test]
    fn diamond_visits_each_node_once() {
        let mut store = NodeStore::new();
        let source = add_source(&mut store);
        let left = add_computed(&mut store, &[source]);
        let right = add_computed(&mut store, &[source]);
        let bottom = add_computed(&mut store, &[left, right]);

        let affected = store.downstream_of(source).unwrap();
        assert_eq!(affected.len(), 3);
        assert_eq!(affected.last(), Some(&bottom));
    }

    #[test]
    fn mark_stale_flips_status() {
        let mut store = NodeStore::new();
        let source = add_source(&mut store);
        let derived = add_computed(&mut store, &[source]);
        assert_eq!(store.get(derived).unwrap().status(), CellStatus::Fresh);

        let affected = store.downstream_of(source).unwrap();
        assert!(store.mark_stale(&affected).is_empty());
        assert_eq!(store.get(derived).unwrap().status(), CellStatus::Stale);
    }

    #[test]
    fn stale_back_references_are_pruned() {
        let mut store = NodeStore::new();
        let a = add_source(&mut store);
        let b = add_source(&mut store);
        let derived = add_computed(&mut store, &[a]);

        // The derived cell switched to reading `b`, but `a` still points at it.
        let mut reads = IndexMap::new();
        reads.insert(b, 0);
        store.replace_dependencies(derived, reads);
        store.link(a, derived);

        assert!(store.downstream_of(a).unwrap().is_empty());
        assert!(!store.get(a).unwrap().dependents.contains(&derived));
        assert_eq!(store.downstream_of(b).unwrap(), vec![derived]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut store = NodeStore::new();
        let source = add_source(&mut store);
        let first = add_computed(&mut store, &[source]);
        let second = add_computed(&mut store, &[first]);

        // Close the loop: first also depends on second.
        let mut reads = IndexMap::new();
        reads.insert(source, 0);
        reads.insert(second, 0);
        store.replace_dependencies(first, reads);

        let err = store.downstream_of(source).unwrap_err();
        assert!(matches!(err, CellError::CyclicDependency(_)));

        // Nothing was marked.
        assert_eq!(store.get(first).unwrap().status(), CellStatus::Fresh);
        assert_eq!(store.get(second).unwrap().status(), CellStatus::Fresh);
    }

    #[test]
    fn missing_origin_has_no_downstream() {
        let mut store = NodeStore::new();
        let ghost = Node::source(std::sync::Arc::new(0_i32)).id();
        assert!(store.downstream_of(ghost).unwrap().is_empty());
    }
}
