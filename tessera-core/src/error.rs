//! Error types for cell reads, writes and derivations.
//!
//! Errors are cached exactly like values: a computed cell that failed keeps
//! returning the same `CellError` until an upstream change or an explicit
//! reload triggers another attempt. That is why `CellError` is `Clone` and
//! wraps user errors behind an `Arc`.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::CellId;

/// Errors produced by the reactive graph.
#[derive(Debug, Clone, Error)]
pub enum CellError {
    /// A cell was read while it was already being computed on the current
    /// computation path.
    #[error("cyclic dependency detected at {0}")]
    CyclicDependency(CellId),

    /// A cell was read after it had been disposed.
    #[error("{0} has been disposed")]
    DanglingReference(CellId),

    /// The cell (or one of its upstreams) has an asynchronous run that has
    /// not settled yet. The id names the cell whose run is in flight.
    #[error("{0} is pending")]
    Pending(CellId),

    /// The derivation function itself failed.
    #[error("derivation failed: {0}")]
    DerivationFailure(#[source] Arc<dyn Error + Send + Sync>),

    /// The stored value does not have the type the handle expects.
    #[error("{0} does not hold a value of the requested type")]
    TypeMismatch(CellId),

    /// An asynchronous derivation could not be started because no async
    /// runtime was available.
    #[error("no async runtime available to drive {0}")]
    RuntimeUnavailable(CellId),
}

impl CellError {
    /// Wrap a user error as a derivation failure.
    pub fn failure<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::DerivationFailure(Arc::new(err))
    }

    /// Build a derivation failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::DerivationFailure(Arc::new(Message(message.into())))
    }

    /// Whether this error only means "not available yet".
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Whether this is a failure of user code.
    pub fn is_derivation_failure(&self) -> bool {
        matches!(self, Self::DerivationFailure(_))
    }
}

/// Plain-text derivation failure.
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream service returned {0}")]
    struct ServiceError(u16);

    #[test]
    fn failure_keeps_source() {
        let err = CellError::failure(ServiceError(503));
        assert!(err.is_derivation_failure());
        assert_eq!(
            err.to_string(),
            "derivation failed: upstream service returned 503"
        );
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("upstream service returned 503"));
    }

    #[test]
    fn msg_renders_text() {
        let err = CellError::msg("bad input");
        assert_eq!(err.to_string(), "derivation failed: bad input");
        assert!(!err.is_pending());
    }

    #[test]
    fn clones_share_the_same_failure() {
        let err = CellError::msg("boom");
        let copy = err.clone();
        match (&err, &copy) {
            (CellError::DerivationFailure(a), CellError::DerivationFailure(b)) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected derivation failures"),
        }
    }
}
