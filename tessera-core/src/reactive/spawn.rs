//! Spawning asynchronous runs.
//!
//! The engine never polls futures itself. Each asynchronous run is handed to
//! a [`Spawn`] implementation, which drives it to completion on some
//! executor. Settlement always goes back through the graph's lock, so the
//! executor may run tasks on any thread.

use std::fmt;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::warn;

/// Returned when a task could not be spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no executor available to spawn the task")]
pub struct SpawnError;

/// Executor seam for asynchronous derivations.
pub trait Spawn: Send + Sync + 'static {
    /// Start driving `task`. On error the task is dropped unpolled.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), SpawnError>;
}

/// Spawns runs onto a Tokio runtime.
#[derive(Clone, Default)]
pub struct TokioSpawner {
    handle: Option<Handle>,
}

impl TokioSpawner {
    /// Spawn onto whichever runtime is current at the time of the read.
    pub fn ambient() -> Self {
        Self { handle: None }
    }

    /// Always spawn onto the given runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<(), SpawnError> {
        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|err| {
                warn!(%err, "no tokio runtime available for async cell");
                SpawnError
            })?,
        };
        handle.spawn(task);
        Ok(())
    }
}

impl fmt::Debug for TokioSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioSpawner")
            .field("pinned", &self.handle.is_some())
            .finish()
    }
}
