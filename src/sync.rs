//! Counting semaphore with FIFO wake-up.
//!
//! Caps the number of cells in flight. Waiters are woken strictly in arrival
//! order: `release` hands the permit directly to the oldest waiter when one
//! exists, and only otherwise returns it to the available pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// An async counting semaphore. Cloning shares the same permit pool.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
}

struct State {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available: permits,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquires a permit, suspending until one is free.
    ///
    /// There is no timeout or cancellation here; the orchestrator cancels at
    /// cell granularity instead.
    pub async fn acquire(&self) -> SemaphorePermit {
        let waiter = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // The sender lives in `state.waiters` until `release` hands the
            // permit over, so this resolves unless the waiter was abandoned.
            let _ = rx.await;
        }

        SemaphorePermit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current number of free permits.
    pub fn available(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .available
    }

    /// Number of tasks currently waiting for a permit.
    pub fn waiters(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .len()
    }
}

impl Inner {
    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(waiter) = state.waiters.pop_front() {
            // A waiter whose acquire future was dropped rejects the hand-off;
            // move on to the next one.
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.available += 1;
    }
}

/// RAII permit returned by [`Semaphore::acquire`]; dropping it releases.
pub struct SemaphorePermit {
    inner: Arc<Inner>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.inner.release();
    }
}
