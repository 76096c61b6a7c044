//! Dependency Tracker
//!
//! The tracker knows which computed cell is currently running on this
//! thread. This enables automatic dependency tracking: when a cell is read,
//! the read is recorded as an upstream of the running computation.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. When a synchronous derivation
//! starts, the engine pushes a frame naming its cell and run; when it
//! finishes, the frame is popped. Reads made in between are recorded on the
//! run itself, in the node store, so a concurrent write can already see
//! them.
//!
//! Each frame carries the full computation path (ancestors plus its own
//! cell). A read of any cell on that path is a cycle. Asynchronous runs do
//! not live on a thread, so they pass their path in explicitly when they
//! trigger a nested computation.

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::graph::CellId;

/// Ancestors of a computation, outermost first, ending with the cell itself.
pub(crate) type Path = SmallVec<[CellId; 8]>;

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the tracking stack.
#[derive(Debug)]
struct Frame {
    /// Graph the computation belongs to.
    graph: u64,
    /// Run of the cell that reads are recorded against.
    run_id: u64,
    /// Path ending with the running cell.
    path: Path,
}

/// The currently running computation, as seen by a read.
#[derive(Debug, Clone)]
pub(crate) struct Active {
    pub(crate) cell: CellId,
    pub(crate) run_id: u64,
    pub(crate) path: Path,
}

/// Guard that pops its frame when dropped.
///
/// This keeps the stack balanced even if a derivation panics.
pub(crate) struct Tracker {
    cell: CellId,
}

impl Tracker {
    /// Enter a frame for run `run_id` of `cell`, whose ancestors are `base`.
    pub(crate) fn enter(graph: u64, cell: CellId, run_id: u64, base: &[CellId]) -> Self {
        let mut path: Path = base.iter().copied().collect();
        path.push(cell);
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                graph,
                run_id,
                path,
            });
        });
        Self { cell }
    }

    /// The computation running on this thread for `graph`, if any.
    ///
    /// A frame of another graph means reads of this graph are untracked.
    pub(crate) fn current(graph: u64) -> Option<Active> {
        FRAMES.with(|frames| {
            let frames = frames.borrow();
            let frame = frames.last().filter(|frame| frame.graph == graph)?;
            Some(Active {
                cell: *frame.path.last()?,
                run_id: frame.run_id,
                path: frame.path.clone(),
            })
        })
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            let popped = frames.borrow_mut().pop();

            // Verify we're popping the right frame.
            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.path.last().copied(),
                    Some(self.cell),
                    "tracker frame mismatch"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth() -> usize {
        FRAMES.with(|frames| frames.borrow().len())
    }

    #[test]
    fn tracker_tracks_current_cell() {
        let id = CellId::new();

        assert_eq!(depth(), 0);
        assert!(Tracker::current(1).is_none());

        {
            let _tracker = Tracker::enter(1, id, 3, &[]);

            assert_eq!(depth(), 1);
            let active = Tracker::current(1).unwrap();
            assert_eq!(active.cell, id);
            assert_eq!(active.run_id, 3);
        }

        // Frame should be cleaned up after drop
        assert_eq!(depth(), 0);
        assert!(Tracker::current(1).is_none());
    }

    #[test]
    fn nested_frames_extend_the_path() {
        let outer = CellId::new();
        let inner = CellId::new();

        {
            let _outer = Tracker::enter(1, outer, 1, &[]);
            let base = Tracker::current(1).unwrap().path;

            {
                let _inner = Tracker::enter(1, inner, 1, &base);
                let active = Tracker::current(1).unwrap();
                assert_eq!(active.cell, inner);
                assert_eq!(active.path.as_slice(), &[outer, inner]);
            }

            // After inner frame drops, outer should be current
            assert_eq!(Tracker::current(1).map(|a| a.cell), Some(outer));
        }

        assert!(Tracker::current(1).is_none());
    }

    #[test]
    fn other_graph_is_untracked() {
        let _tracker = Tracker::enter(7, CellId::new(), 1, &[]);
        assert!(Tracker::current(8).is_none());
        assert_eq!(depth(), 1);
    }
}
