//! Fair counting semaphore built on the bracket protocol.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::promise::Promise;
use crate::bracket::bracket_case;
use crate::cancellation::Connection;
use crate::errors::{CoflowError, Result};

/// A counting semaphore with strict FIFO fairness.
///
/// Handles are cheap to clone and share one state cell. The state is either a
/// non-negative pool of available permits or a queue of waiters; the two are
/// never mixed, so a queued head is always the next to be served. A later,
/// smaller request is never served ahead of an earlier, larger one.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<Mutex<SemState>>,
}

enum SemState {
    /// Permits on hand, always non-negative.
    Available(i64),
    /// Demand exceeds supply: waiters in arrival order.
    Waiting(VecDeque<Waiter>),
}

struct Waiter {
    id: Uuid,
    /// Permits still owed to this waiter. Partial releases reduce it in
    /// place while the waiter keeps its queue position.
    remaining: i64,
    gate: Promise<()>,
}

/// What the atomic enqueue/deduct step yielded; drives the wait stage and
/// the cancellation compensation.
#[derive(Clone)]
struct Acquisition {
    id: Uuid,
    requested: i64,
    /// `None` when the request was satisfied immediately.
    gate: Option<Promise<()>>,
}

fn assert_non_negative(n: i64, what: &str) -> Result<()> {
    if n < 0 {
        return Err(CoflowError::InvalidArgument(format!(
            "{what} must be non-negative, was {n}"
        )));
    }
    Ok(())
}

impl Semaphore {
    /// Creates a semaphore with `n` available permits.
    ///
    /// # Errors
    ///
    /// Rejects a negative `n` before any state exists.
    pub fn new(n: i64) -> Result<Self> {
        assert_non_negative(n, "permit count")?;
        Ok(Self {
            state: Arc::new(Mutex::new(SemState::Available(n))),
        })
    }

    /// Snapshot of the free permits; 0 while waiters queue. May be stale the
    /// moment it returns.
    #[must_use]
    pub fn available(&self) -> i64 {
        match &*self.state.lock() {
            SemState::Available(m) => *m,
            SemState::Waiting(_) => 0,
        }
    }

    /// Snapshot of available permits minus outstanding requested amounts;
    /// negative while waiters queue.
    #[must_use]
    pub fn count(&self) -> i64 {
        match &*self.state.lock() {
            SemState::Available(m) => *m,
            SemState::Waiting(queue) => -queue.iter().map(|w| w.remaining).sum::<i64>(),
        }
    }

    /// Acquires `n` permits, suspending until they are granted.
    ///
    /// The enqueue/deduct step is atomic and uncancellable; the wait is
    /// cancellable, and a cancelled waiter removes exactly its own queue
    /// entry, returning any permits already earmarked for it to the pool.
    ///
    /// # Errors
    ///
    /// Rejects negative `n`; returns a cancellation error when the wait is
    /// cancelled through `conn`.
    pub async fn acquire_n(&self, conn: &Arc<Connection>, n: i64) -> Result<()> {
        assert_non_negative(n, "requested permits")?;
        if n == 0 {
            return Ok(());
        }

        let sem = self.clone();
        bracket_case(
            conn,
            || async { Ok(self.enqueue_or_deduct(n)) },
            |acq| async move {
                if let Some(gate) = acq.gate {
                    gate.get().await;
                }
                Ok(())
            },
            move |acq, exit| async move {
                if exit.is_cancelled() {
                    sem.rollback(&acq);
                }
                Ok(())
            },
        )
        .await
    }

    /// Acquires a single permit.
    pub async fn acquire(&self, conn: &Arc<Connection>) -> Result<()> {
        self.acquire_n(conn, 1).await
    }

    /// Attempts to acquire `n` permits without suspending.
    ///
    /// Succeeds only against immediately available permits; never enqueues.
    pub fn try_acquire_n(&self, n: i64) -> Result<bool> {
        assert_non_negative(n, "requested permits")?;
        if n == 0 {
            return Ok(true);
        }
        let mut state = self.state.lock();
        match &mut *state {
            SemState::Available(m) if *m >= n => {
                *m -= n;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Attempts to acquire a single permit without suspending.
    pub fn try_acquire(&self) -> Result<bool> {
        self.try_acquire_n(1)
    }

    /// Returns `n` permits to the pool, serving queued waiters in strict
    /// FIFO order with partial fulfillment.
    pub fn release_n(&self, n: i64) -> Result<()> {
        assert_non_negative(n, "released permits")?;
        if n == 0 {
            return Ok(());
        }
        let fulfilled = {
            let mut state = self.state.lock();
            Self::apply_release(&mut state, n)
        };
        Self::open_gates(fulfilled);
        Ok(())
    }

    /// Returns a single permit to the pool.
    pub fn release(&self) -> Result<()> {
        self.release_n(1)
    }

    /// Runs `body` holding `n` permits, releasing them on every exit path.
    pub async fn with_permit_n<B, F, Fut>(
        &self,
        conn: &Arc<Connection>,
        n: i64,
        body: F,
    ) -> Result<B>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        assert_non_negative(n, "requested permits")?;
        let sem = self.clone();
        bracket_case(
            conn,
            || async move { self.acquire_n(conn, n).await.map(|()| n) },
            |_permits| body(),
            move |permits, _exit| async move { sem.release_n(permits) },
        )
        .await
    }

    /// Runs `body` holding one permit.
    pub async fn with_permit<B, F, Fut>(&self, conn: &Arc<Connection>, body: F) -> Result<B>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        self.with_permit_n(conn, 1, body).await
    }

    /// The atomic enqueue-or-deduct transition backing `acquire_n`.
    fn enqueue_or_deduct(&self, n: i64) -> Acquisition {
        let id = Uuid::new_v4();
        let mut state = self.state.lock();
        match &mut *state {
            SemState::Available(m) if n <= *m => {
                *m -= n;
                Acquisition {
                    id,
                    requested: n,
                    gate: None,
                }
            }
            SemState::Available(m) => {
                // Drain the pool into this request and start a queue.
                let gate = Promise::new();
                let mut queue = VecDeque::new();
                queue.push_back(Waiter {
                    id,
                    remaining: n - *m,
                    gate: gate.clone(),
                });
                *state = SemState::Waiting(queue);
                trace!(requested = n, "semaphore request queued");
                Acquisition {
                    id,
                    requested: n,
                    gate: Some(gate),
                }
            }
            SemState::Waiting(queue) => {
                let gate = Promise::new();
                queue.push_back(Waiter {
                    id,
                    remaining: n,
                    gate: gate.clone(),
                });
                trace!(requested = n, depth = queue.len(), "semaphore request queued");
                Acquisition {
                    id,
                    requested: n,
                    gate: Some(gate),
                }
            }
        }
    }

    /// Compensation for a cancelled wait: drop the waiter's own entry and
    /// return whatever was already earmarked for it. When the entry is gone
    /// (granted concurrently, or it never queued) the full request flows
    /// back, since the caller is abandoning permits it holds.
    fn rollback(&self, acq: &Acquisition) {
        let fulfilled = {
            let mut state = self.state.lock();
            let refund = match &mut *state {
                SemState::Waiting(queue) => {
                    if let Some(pos) = queue.iter().position(|w| w.id == acq.id) {
                        let earmarked = queue
                            .remove(pos)
                            .map_or(0, |waiter| acq.requested - waiter.remaining);
                        trace!(refund = earmarked, "cancelled waiter removed");
                        earmarked
                    } else {
                        acq.requested
                    }
                }
                SemState::Available(_) => acq.requested,
            };
            Self::apply_release(&mut state, refund)
        };
        Self::open_gates(fulfilled);
    }

    /// Pours `n` permits into the state, consuming queued waiters from the
    /// front. Returns the gates of fully satisfied waiters, in queue order.
    fn apply_release(state: &mut SemState, n: i64) -> Vec<Promise<()>> {
        match state {
            SemState::Available(m) => {
                *m += n;
                Vec::new()
            }
            SemState::Waiting(queue) => {
                let mut pool = n;
                let mut fulfilled = Vec::new();
                while pool > 0 {
                    let Some(head) = queue.front_mut() else {
                        break;
                    };
                    if head.remaining > pool {
                        head.remaining -= pool;
                        pool = 0;
                    } else {
                        pool -= head.remaining;
                        if let Some(waiter) = queue.pop_front() {
                            fulfilled.push(waiter.gate);
                        }
                    }
                }
                if queue.is_empty() {
                    *state = SemState::Available(pool);
                }
                fulfilled
            }
        }
    }

    fn open_gates(gates: Vec<Promise<()>>) {
        for gate in gates {
            if gate.complete(()).is_err() {
                trace!("semaphore gate was already open");
            }
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (available, waiting) = match &*self.state.lock() {
            SemState::Available(m) => (*m, 0),
            SemState::Waiting(queue) => (0, queue.len()),
        };
        f.debug_struct("Semaphore")
            .field("available", &available)
            .field("waiting", &waiting)
            .finish()
    }
}
