//! Simple cancellation token.
//!
//! Used by the supervisor to release a drain task that did not finish on its own: the task selects
//! on [`CancellationToken::cancelled`] next to every read so that cancelling it never waits on the
//! worker's output stream.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
};

#[derive(Default)]
struct State {
    cancelled: bool,
    wakers: Vec<Waker>,
}

/// The cancellation token.
///
/// Clones observe the same cancellation event.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<State>>,
}

impl CancellationToken {
    /// Creates a new token, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation and wakes up all the waiters.
    pub fn cancel(&self) {
        let wakers = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.cancelled = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancelled
    }

    /// Returns a future that completes once [`cancel`](Self::cancel) has been called.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        Cancelled {
            state: Arc::clone(&self.state),
        }
    }
}

struct Cancelled {
    state: Arc<Mutex<State>>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
