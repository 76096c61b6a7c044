//! Cell Handles
//!
//! Handles are small typed references to cells living in a [`Graph`]. They
//! are `Copy` and carry no data besides the cell id; all state stays in the
//! graph's node store.
//!
//! [`Graph`]: super::Graph

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use super::cancel::CancellationToken;
use crate::error::CellError;
use crate::graph::CellId;

/// Anything that names a readable cell of type `Self::Value`.
pub trait CellHandle: Copy {
    /// The type of value the cell holds.
    type Value: Clone + Send + Sync + 'static;

    /// The id of the referenced cell.
    fn id(&self) -> CellId;
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name<T> {
            id: CellId,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T> $name<T> {
            pub(crate) fn new(id: CellId) -> Self {
                Self {
                    id,
                    _marker: PhantomData,
                }
            }

            /// The id of the referenced cell.
            pub fn id(&self) -> CellId {
                self.id
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl<T> Eq for $name<T> {}

        impl<T> Hash for $name<T> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.id.hash(state);
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.id)
            }
        }

        impl<T> CellHandle for $name<T>
        where
            T: Clone + Send + Sync + 'static,
        {
            type Value = T;

            fn id(&self) -> CellId {
                self.id
            }
        }
    };
}

handle! {
    /// Handle to a source cell: a value set directly with
    /// [`Graph::write`](super::Graph::write).
    Source
}

handle! {
    /// Handle to a computed cell, derived from other cells by a synchronous
    /// or asynchronous function.
    Computed
}

/// State of a cell's current attempt.
#[derive(Debug, Clone)]
pub enum AsyncResult<T> {
    /// A run is in flight. The token is the one handed to that run.
    Pending(CancellationToken),

    /// The latest run produced a value.
    Resolved(T),

    /// The latest run failed.
    Rejected(CellError),
}

impl<T> AsyncResult<T> {
    /// Whether a run is still in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, AsyncResult::Pending(_))
    }

    /// The value, if resolved.
    pub fn ok(self) -> Option<T> {
        match self {
            AsyncResult::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// The error, if rejected.
    pub fn err(self) -> Option<CellError> {
        match self {
            AsyncResult::Rejected(err) => Some(err),
            _ => None,
        }
    }

    /// Map the resolved value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AsyncResult<U> {
        match self {
            AsyncResult::Pending(token) => AsyncResult::Pending(token),
            AsyncResult::Resolved(value) => AsyncResult::Resolved(f(value)),
            AsyncResult::Rejected(err) => AsyncResult::Rejected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::cancel::CancelHandle;
    use std::collections::HashSet;

    #[test]
    fn handles_compare_by_id() {
        let id = CellId::new();
        let a: Source<i32> = Source::new(id);
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, Source::new(CellId::new()));

        let set: HashSet<Source<i32>> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(format!("{a:?}"), format!("Source({id})"));
    }

    #[test]
    fn async_result_accessors() {
        let resolved: AsyncResult<i32> = AsyncResult::Resolved(3);
        assert_eq!(resolved.clone().map(|v| v * 2).ok(), Some(6));
        assert!(resolved.err().is_none());

        let (_handle, token) = CancelHandle::new();
        let pending: AsyncResult<i32> = AsyncResult::Pending(token);
        assert!(pending.is_pending());
        assert!(pending.ok().is_none());

        let rejected: AsyncResult<i32> = AsyncResult::Rejected(CellError::msg("nope"));
        assert!(rejected.err().is_some_and(|e| e.is_derivation_failure()));
    }
}
