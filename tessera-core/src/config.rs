//! Graph configuration.
//!
//! Every setting has a default, so `Graph::new()` needs no configuration at
//! all. Use [`GraphBuilder`] (via [`Graph::builder`]) to change them.
//!
//! [`Graph::builder`]: crate::reactive::Graph::builder

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::reactive::{Graph, Spawn, TokioSpawner};

/// What a computed cell does when an upstream it depends on was disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DanglingPolicy {
    /// Cache `DanglingReference` as the cell's result, like any other
    /// failure. The cell stays rejected until something it still tracks
    /// changes or it is reloaded.
    #[default]
    Reject,

    /// Return `DanglingReference` without caching it. The cell stays stale
    /// and retries on every read.
    Stale,
}

/// Settings shared by every cell of a graph.
#[derive(Clone)]
pub struct GraphConfig {
    pub dangling_policy: DanglingPolicy,

    /// Executor for asynchronous derivations.
    pub spawner: Arc<dyn Spawn>,

    /// Shown in snapshots and `Debug` output.
    pub label: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            dangling_policy: DanglingPolicy::default(),
            spawner: Arc::new(TokioSpawner::ambient()),
            label: None,
        }
    }
}

impl fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConfig")
            .field("dangling_policy", &self.dangling_policy)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Graph`] with non-default settings.
///
/// ```
/// use tessera_core::config::DanglingPolicy;
/// use tessera_core::reactive::Graph;
///
/// let graph = Graph::builder()
///     .label("pricing")
///     .dangling_policy(DanglingPolicy::Stale)
///     .build();
/// assert_eq!(graph.config().label.as_deref(), Some("pricing"));
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dangling_policy(mut self, policy: DanglingPolicy) -> Self {
        self.config.dangling_policy = policy;
        self
    }

    /// Drive asynchronous derivations with a custom executor.
    pub fn spawner(mut self, spawner: impl Spawn) -> Self {
        self.config.spawner = Arc::new(spawner);
        self
    }

    /// Drive asynchronous derivations on the given Tokio runtime, even when
    /// the read happens outside of it.
    pub fn runtime(self, handle: Handle) -> Self {
        self.spawner(TokioSpawner::with_handle(handle))
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn build(self) -> Graph {
        Graph::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GraphConfig::default();
        assert_eq!(config.dangling_policy, DanglingPolicy::Reject);
        assert!(config.label.is_none());
    }

    #[test]
    fn builder_applies_settings() {
        let graph = GraphBuilder::new()
            .dangling_policy(DanglingPolicy::Stale)
            .label("test")
            .build();
        assert_eq!(graph.config().dangling_policy, DanglingPolicy::Stale);
        assert_eq!(graph.config().label.as_deref(), Some("test"));
    }
}
