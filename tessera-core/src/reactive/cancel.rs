//! Cooperative Cancellation
//!
//! Every asynchronous run receives a [`CancellationToken`]. When a newer run
//! supersedes it (an upstream changed, the cell was reloaded, cancelled or
//! disposed), the engine cancels the token through its [`CancelHandle`].
//!
//! Cancellation is cooperative: the derivation is expected to check
//! [`CancellationToken::is_cancelled`], await [`CancellationToken::cancelled`]
//! or register a listener with [`CancellationToken::on_cancel`] and stop
//! early. The engine never kills a running future; it only ignores whatever
//! a cancelled run eventually produces.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

type CancelListener = Box<dyn FnOnce() + Send>;

fn next_token_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

struct TokenInner {
    id: u64,
    cancelled: AtomicBool,
    listeners: Mutex<Vec<CancelListener>>,
    notify: Notify,
}

/// Signal handed to an asynchronous derivation.
///
/// Cheaply cloneable. Check `is_cancelled()` at natural yield points, or
/// race `cancelled()` against the work being done.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Unique identifier for this token (for tracing/logging).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Check if the run owning this token has been superseded.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Register a listener invoked once when the token is cancelled.
    ///
    /// If the token is already cancelled, the listener runs immediately on
    /// the calling thread.
    pub fn on_cancel<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut listeners = self.inner.listeners.lock();
            if !self.is_cancelled() {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The engine's side of a token.
pub(crate) struct CancelHandle {
    inner: Arc<TokenInner>,
}

impl CancelHandle {
    /// Create a fresh, uncancelled token pair.
    pub(crate) fn new() -> (Self, CancellationToken) {
        let inner = Arc::new(TokenInner {
            id: next_token_id(),
            cancelled: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        let token = CancellationToken {
            inner: inner.clone(),
        };
        (Self { inner }, token)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.clone(),
        }
    }

    /// Cancel the token and run its listeners. Idempotent.
    pub(crate) fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(token = self.inner.id, "cancelling token");
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners {
            listener();
        }
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn token_starts_uncancelled() {
        let (_handle, token) = CancelHandle::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_visible_to_clones() {
        let (handle, token) = CancelHandle::new();
        let clone = token.clone();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
        assert_eq!(handle.token().id(), token.id());
    }

    #[test]
    fn listeners_run_once() {
        let (handle, token) = CancelHandle::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        token.on_cancel(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.cancel();
        handle.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_runs_immediately() {
        let (handle, token) = CancelHandle::new();
        handle.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        token.on_cancel(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let (handle, token) = CancelHandle::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        tokio::task::yield_now().await;
        handle.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }
}
