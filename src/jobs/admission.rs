//! Admission control: bounded concurrency with a FIFO wait queue.
//!
//! A freed permit is handed directly to the longest-waiting caller instead of
//! being returned to the pool, so a late arrival can never overtake a caller
//! that is already queued. Waiters leave the queue on grant, on queue timeout,
//! or when their job's cancellation token fires.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a caller left the queue without a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejected {
    /// Waited longer than the queue timeout.
    TimedOut { waited: Duration },
    /// The job's cancellation token fired while queued.
    Cancelled,
}

struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

struct State {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

struct Inner {
    capacity: usize,
    queue_timeout: Duration,
    state: Mutex<State>,
}

/// FIFO counting semaphore. Cheap to clone; clones share permits.
#[derive(Clone)]
pub struct AdmissionSemaphore {
    inner: Arc<Inner>,
}

impl AdmissionSemaphore {
    pub fn new(capacity: usize, queue_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                queue_timeout,
                state: Mutex::new(State {
                    available: capacity,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.state().available
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.available()
    }

    /// Callers waiting in the queue.
    pub fn queued(&self) -> usize {
        self.state().waiters.len()
    }

    /// Wait for a permit, giving up on queue timeout or cancellation.
    ///
    /// A grant that races with a timeout or cancellation wins: the caller gets
    /// the permit and is expected to check its token before doing work.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, AdmissionRejected> {
        if cancel.is_cancelled() {
            return Err(AdmissionRejected::Cancelled);
        }

        let mut ticket = {
            let mut state = self.state();
            if state.available > 0 {
                state.available -= 1;
                return Ok(AdmissionPermit::new(self.clone()));
            }
            let id = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                ticket: id,
                grant: tx,
            });
            debug!(ticket = id, queued = state.waiters.len(), "Waiting for admission");
            Ticket {
                semaphore: self,
                id,
                grant: rx,
                resolved: false,
            }
        };

        let started = Instant::now();
        let rejection = tokio::select! {
            biased;
            granted = &mut ticket.grant => {
                ticket.resolved = true;
                if granted.is_ok() {
                    return Ok(AdmissionPermit::new(self.clone()));
                }
                // Sender dropped without a grant; only possible if the waiter
                // was withdrawn, which this caller alone does.
                return Err(AdmissionRejected::Cancelled);
            }
            _ = cancel.cancelled() => AdmissionRejected::Cancelled,
            _ = tokio::time::sleep(self.inner.queue_timeout) => AdmissionRejected::TimedOut {
                waited: started.elapsed(),
            },
        };

        ticket.resolved = true;
        if ticket.withdraw() {
            Err(rejection)
        } else {
            // Granted between the wake-up and the withdrawal.
            Ok(AdmissionPermit::new(self.clone()))
        }
    }

    /// Hand one permit to the oldest waiter, or return it to the pool.
    fn release_one(&self) {
        let mut state = self.state();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                debug!(ticket = waiter.ticket, "Permit handed to queued waiter");
                return;
            }
        }
        state.available = (state.available + 1).min(self.inner.capacity);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A queued caller. Dropping an unresolved ticket (e.g. the acquiring task
/// was aborted) withdraws it, or passes on a grant it never consumed.
struct Ticket<'a> {
    semaphore: &'a AdmissionSemaphore,
    id: u64,
    grant: oneshot::Receiver<()>,
    resolved: bool,
}

impl Ticket<'_> {
    /// Remove this ticket from the queue. Returns `false` if it was already
    /// popped by a release, i.e. a grant is sitting in the channel.
    fn withdraw(&mut self) -> bool {
        let mut state = self.semaphore.state();
        match state.waiters.iter().position(|w| w.ticket == self.id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if !self.withdraw() && self.grant.try_recv().is_ok() {
            self.semaphore.release_one();
        }
    }
}

/// One held slot. Released on drop.
pub struct AdmissionPermit {
    semaphore: AdmissionSemaphore,
}

impl AdmissionPermit {
    fn new(semaphore: AdmissionSemaphore) -> Self {
        Self { semaphore }
    }

    /// Give the slot back.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.semaphore.release_one();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}
