//! Tessera Core
//!
//! This crate provides a reactive, dependency-tracked computation cache.
//! It implements:
//!
//! - Source cells holding values set from outside
//! - Computed cells, synchronous or asynchronous, cached until an upstream
//!   changes
//! - Automatic dependency tracking and lazy, pull-based invalidation
//! - Cooperative cancellation of superseded asynchronous runs
//! - Cycle detection at read time and during invalidation
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Node store, edges and the invalidation scheduler
//! - `reactive`: The `Graph` API, dependency tracking and the computation
//!   engine
//! - `config`: Graph settings and builder
//! - `error`: The `CellError` type shared by every operation
//!
//! # Example
//!
//! ```rust
//! use tessera_core::{CellError, Graph};
//!
//! let graph = Graph::new();
//!
//! // Create a source cell
//! let price = graph.source(120_u32);
//! let quantity = graph.source(3_u32);
//!
//! // Create a derived value
//! let total = graph.computed(move |r| Ok(r.get(&price)? * r.get(&quantity)?));
//! assert_eq!(graph.get(&total)?, 360);
//!
//! // Update a source; the total recomputes on its next read
//! graph.write(&quantity, 4)?;
//! assert_eq!(graph.get(&total)?, 480);
//! # Ok::<(), CellError>(())
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{DanglingPolicy, GraphBuilder, GraphConfig};
pub use error::CellError;
pub use graph::{CellId, CellKind, CellStatus, GraphSnapshot};
pub use reactive::{
    AsyncReader, AsyncResult, CancellationToken, CellHandle, Computed, Graph, Reader, Source,
    Subscription,
};
