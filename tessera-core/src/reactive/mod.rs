//! Reactive Primitives
//!
//! This module implements the reactive graph: source cells, computed cells
//! and the machinery that keeps them consistent.
//!
//! # Concepts
//!
//! ## Source cells
//!
//! A source cell is a container for a value set from outside. When it is
//! read within a derivation, the running cell registers it as an upstream.
//! When its value changes, everything downstream is marked stale.
//!
//! ## Computed cells
//!
//! A computed cell caches the result of a derivation function. It
//! re-evaluates only when it is read after one of its upstreams changed.
//! Derivations are synchronous, or asynchronous with a cancellation token
//! per run.
//!
//! ## Runs
//!
//! Every computation attempt gets a run-id. Only the cell's current run may
//! commit; results of superseded runs are discarded.
//!
//! # Implementation Notes
//!
//! Dependency detection is automatic. Synchronous derivations are tracked
//! through a thread-local stack of frames; asynchronous ones record through
//! the [`AsyncReader`] they are handed.

mod cancel;
mod cell;
mod context;
mod engine;
mod reader;
mod runtime;
mod spawn;
mod subscriber;

pub use cancel::CancellationToken;
pub use cell::{AsyncResult, CellHandle, Computed, Source};
pub use reader::{AsyncReader, Reader};
pub use runtime::Graph;
pub use spawn::{Spawn, SpawnError, TokioSpawner};
pub use subscriber::{SubscriberId, Subscription};

pub(crate) use cancel::CancelHandle;
