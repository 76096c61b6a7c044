//! Subscriber types for the reactive graph.
//!
//! A subscriber is a callback registered on a cell. It is invoked with the
//! cell's id whenever the cell is invalidated or settles, after the graph's
//! lock has been released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use tracing::trace;

use super::runtime::GraphInner;
use crate::graph::CellId;

/// Unique identifier for a subscriber.
///
/// Each registered listener gets a unique ID when created. The ID is used to
/// remove the listener again when its [`Subscription`] is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a listener registered with
/// [`Graph::subscribe`](super::Graph::subscribe).
///
/// Dropping the guard unregisters the listener. The guard does not keep the
/// graph alive.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    pub(crate) graph: Weak<GraphInner>,
    pub(crate) cell: CellId,
    pub(crate) id: SubscriberId,
}

impl Subscription {
    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The cell this subscription listens to.
    pub fn cell(&self) -> CellId {
        self.cell
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(graph) = self.graph.upgrade() else {
            return;
        };
        let removed: Vec<_> = {
            let mut store = graph.store.lock();
            let Some(node) = store.get_mut(self.cell) else {
                return;
            };
            let (removed, kept) = std::mem::take(&mut node.listeners)
                .into_iter()
                .partition(|(id, _)| *id == self.id);
            node.listeners = kept;
            trace!(cell = %self.cell, "listener removed");
            removed
        };
        // The closure may own other subscriptions; drop it unlocked.
        drop(removed);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cell", &self.cell)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::reactive::Graph;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let graph = Graph::new();
        let source = graph.source(1_i32);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let subscription = graph
            .subscribe(&source, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(subscription.cell(), source.id());

        graph.write(&source, 2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(subscription);
        graph.write(&source, 3).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_owning_a_subscription_can_be_dropped() {
        let graph = Graph::new();
        let first = graph.source(1_i32);
        let second = graph.source(2_i32);

        let inner = graph.subscribe(&second, |_| {}).unwrap();
        let outer = graph
            .subscribe(&first, move |_| {
                let _ = inner.cell();
            })
            .unwrap();

        drop(outer);
        assert!(graph.inner.store.lock().get(second.id()).unwrap().listeners.is_empty());
    }

    #[test]
    fn subscription_outliving_graph_is_harmless() {
        let graph = Graph::new();
        let source = graph.source(0_u8);
        let subscription = graph.subscribe(&source, |_| {}).unwrap();
        drop(graph);
        drop(subscription);
    }
}
