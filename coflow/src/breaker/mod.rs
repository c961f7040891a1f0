//! Circuit breaker: a failure-counting state machine built on bracket.
//!
//! The breaker sits in front of an unreliable operation. While `Closed` it
//! counts consecutive failures; at the threshold it trips `Open` and rejects
//! calls outright until a reset timeout expires, then admits exactly one
//! probe (`HalfOpen`) whose outcome decides between closing again and
//! re-opening with an exponentially backed-off timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::bracket::{bracket_case, ExitCase};
use crate::cancellation::Connection;
use crate::errors::Result;
use crate::sync::Promise;

/// Side-effecting observer fired on a breaker event.
type Listener = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

fn noop_listener() -> Listener {
    Arc::new(|| Box::pin(async {}))
}

fn listener<F, Fut>(callback: F) -> Listener
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(callback()))
}

/// Cumulative composition: the original listener runs first.
fn chain(first: &Listener, second: Listener) -> Listener {
    let first = first.clone();
    Arc::new(move || {
        let first = first.clone();
        let second = second.clone();
        Box::pin(async move {
            first().await;
            second().await;
        })
    })
}

/// Internal state, held as an atomically swapped immutable snapshot.
enum BreakerState {
    Closed {
        failures: u32,
    },
    Open {
        started_at: Instant,
        reset_timeout: Duration,
        await_close: Promise<()>,
    },
    HalfOpen {
        reset_timeout: Duration,
        await_close: Promise<()>,
    },
}

impl BreakerState {
    fn snapshot(&self) -> StateSnapshot {
        match self {
            Self::Closed { failures } => StateSnapshot::Closed {
                failures: *failures,
            },
            Self::Open { reset_timeout, .. } => StateSnapshot::Open {
                reset_timeout: *reset_timeout,
            },
            Self::HalfOpen { reset_timeout, .. } => StateSnapshot::HalfOpen {
                reset_timeout: *reset_timeout,
            },
        }
    }
}

/// Debug-friendly view of the breaker state, carried by rejections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StateSnapshot {
    /// Calls flow through; `failures` consecutive failures so far.
    Closed {
        /// The current consecutive-failure count.
        failures: u32,
    },
    /// Calls are rejected until the reset timeout expires.
    Open {
        /// The timeout applied to this open period.
        reset_timeout: Duration,
    },
    /// A single reset probe is in flight; other calls are rejected.
    HalfOpen {
        /// The timeout the probe inherits for backoff purposes.
        reset_timeout: Duration,
    },
}

/// Raised when the breaker refuses to run the protected operation.
///
/// Distinct from any error of the operation itself, which never ran.
#[derive(Debug, Clone, Error, Serialize)]
#[error("execution rejected: {reason}")]
pub struct ExecutionRejected {
    /// Why the call was refused.
    pub reason: String,
    /// The breaker state at the time of rejection.
    pub state: StateSnapshot,
}

/// The atomically swapped state cell shared by every handle to one breaker.
struct StateCell {
    current: Mutex<Arc<BreakerState>>,
}

impl StateCell {
    fn new(initial: BreakerState) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
        }
    }

    fn get(&self) -> Arc<BreakerState> {
        self.current.lock().clone()
    }

    /// Swaps in `next` only if the cell still holds exactly `expected`.
    fn compare_and_set(&self, expected: &Arc<BreakerState>, next: BreakerState) -> bool {
        let mut current = self.current.lock();
        if Arc::ptr_eq(&current, expected) {
            *current = Arc::new(next);
            true
        } else {
            false
        }
    }

    /// Unconditional store; only valid where a single writer is admitted.
    fn store(&self, next: BreakerState) {
        *self.current.lock() = Arc::new(next);
    }
}

/// A circuit breaker. Handles are cheap to clone and share one state cell;
/// the `do_on_*` decorators return new handles with cumulative listeners.
#[derive(Clone)]
pub struct CircuitBreaker {
    cell: Arc<StateCell>,
    max_failures: u32,
    reset_timeout: Duration,
    exponential_backoff_factor: f64,
    max_reset_timeout: Duration,
    on_rejected: Listener,
    on_closed: Listener,
    on_half_open: Listener,
    on_open: Listener,
}

impl CircuitBreaker {
    /// Creates a breaker, validating the configuration before any state
    /// exists.
    ///
    /// # Errors
    ///
    /// Rejects a zero `reset_timeout`, a non-positive
    /// `exponential_backoff_factor` or a zero `max_reset_timeout`.
    pub fn of(
        max_failures: u32,
        reset_timeout: Duration,
        exponential_backoff_factor: f64,
        max_reset_timeout: Duration,
    ) -> Result<Self> {
        if reset_timeout.is_zero() {
            return Err(crate::errors::CoflowError::InvalidArgument(
                "reset_timeout must be positive".into(),
            ));
        }
        if !(exponential_backoff_factor > 0.0) {
            return Err(crate::errors::CoflowError::InvalidArgument(format!(
                "exponential_backoff_factor must be positive, was {exponential_backoff_factor}"
            )));
        }
        if max_reset_timeout.is_zero() {
            return Err(crate::errors::CoflowError::InvalidArgument(
                "max_reset_timeout must be positive".into(),
            ));
        }
        Ok(Self {
            cell: Arc::new(StateCell::new(BreakerState::Closed { failures: 0 })),
            max_failures,
            reset_timeout,
            exponential_backoff_factor,
            max_reset_timeout,
            on_rejected: noop_listener(),
            on_closed: noop_listener(),
            on_half_open: noop_listener(),
            on_open: noop_listener(),
        })
    }

    /// Creates a breaker with no backoff (factor 1.0) and no timeout ceiling.
    ///
    /// # Errors
    ///
    /// Rejects a zero `reset_timeout`.
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Result<Self> {
        Self::of(max_failures, reset_timeout, 1.0, Duration::MAX)
    }

    /// Returns the current state, for debugging and stats.
    #[must_use]
    pub fn state(&self) -> StateSnapshot {
        self.cell.get().snapshot()
    }

    /// Waits until the breaker is `Closed`; returns immediately if it is.
    pub async fn await_close(&self) {
        let current = self.cell.get();
        match &*current {
            BreakerState::Closed { .. } => {}
            BreakerState::Open { await_close, .. } | BreakerState::HalfOpen { await_close, .. } => {
                await_close.get().await;
            }
        }
    }

    /// Runs `fa` under the protection of this breaker.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionRejected`] without running `fa` when the breaker is
    /// `Open` (unexpired) or `HalfOpen` with a probe in flight; otherwise
    /// returns `fa`'s own result.
    pub async fn protect<B, F, Fut>(&self, conn: &Arc<Connection>, fa: F) -> Result<B>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        enum Decision {
            RunClosed,
            Probe {
                reset_timeout: Duration,
                await_close: Promise<()>,
                last_started_at: Instant,
            },
        }

        let decision = loop {
            let current = self.cell.get();
            match &*current {
                BreakerState::Closed { .. } => break Decision::RunClosed,
                BreakerState::Open {
                    started_at,
                    reset_timeout,
                    await_close,
                } => {
                    let now = Instant::now();
                    let expires_at = *started_at + *reset_timeout;
                    if now >= expires_at {
                        // The open period expired: admit exactly one probe.
                        let next = BreakerState::HalfOpen {
                            reset_timeout: *reset_timeout,
                            await_close: await_close.clone(),
                        };
                        if self.cell.compare_and_set(&current, next) {
                            debug!("circuit breaker half-open, admitting probe");
                            break Decision::Probe {
                                reset_timeout: *reset_timeout,
                                await_close: await_close.clone(),
                                last_started_at: *started_at,
                            };
                        }
                        // CAS lost: restart the whole decision.
                    } else {
                        let remaining = expires_at - now;
                        (self.on_rejected)().await;
                        return Err(ExecutionRejected {
                            reason: format!(
                                "circuit breaker is open, attempting to close in {}ms",
                                remaining.as_millis()
                            ),
                            state: current.snapshot(),
                        }
                        .into());
                    }
                }
                BreakerState::HalfOpen { .. } => {
                    (self.on_rejected)().await;
                    return Err(ExecutionRejected {
                        reason: "circuit breaker is half-open, a reset probe is in flight".into(),
                        state: current.snapshot(),
                    }
                    .into());
                }
            }
        };

        match decision {
            Decision::RunClosed => {
                let attempt = fa().await;
                self.mark_or_reset_failures(attempt).await
            }
            Decision::Probe {
                reset_timeout,
                await_close,
                last_started_at,
            } => {
                self.attempt_reset(conn, fa, reset_timeout, await_close, last_started_at)
                    .await
            }
        }
    }

    /// Failure accounting for the `Closed` state.
    async fn mark_or_reset_failures<B>(&self, result: Result<B>) -> Result<B> {
        loop {
            let current = self.cell.get();
            let BreakerState::Closed { failures } = &*current else {
                // The state moved under us; the attempt result stands.
                return result;
            };
            match &result {
                Ok(_) => {
                    if *failures == 0 {
                        return result;
                    }
                    let next = BreakerState::Closed { failures: 0 };
                    if self.cell.compare_and_set(&current, next) {
                        return result;
                    }
                }
                Err(_) => {
                    if failures + 1 < self.max_failures {
                        let next = BreakerState::Closed {
                            failures: failures + 1,
                        };
                        if self.cell.compare_and_set(&current, next) {
                            return result;
                        }
                    } else {
                        let next = BreakerState::Open {
                            started_at: Instant::now(),
                            reset_timeout: self.reset_timeout,
                            await_close: Promise::new(),
                        };
                        if self.cell.compare_and_set(&current, next) {
                            debug!(failures = failures + 1, "circuit breaker opened");
                            (self.on_open)().await;
                            return result;
                        }
                    }
                }
            }
        }
    }

    /// Runs the single `HalfOpen` probe. While half-open only the probe
    /// updates the state, so direct stores are safe.
    async fn attempt_reset<B, F, Fut>(
        &self,
        conn: &Arc<Connection>,
        fa: F,
        reset_timeout: Duration,
        await_close: Promise<()>,
        last_started_at: Instant,
    ) -> Result<B>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<B>>,
    {
        let breaker = self.clone();
        bracket_case(
            conn,
            || async {
                (self.on_half_open)().await;
                Ok(())
            },
            |()| fa(),
            move |(), exit| async move {
                match exit {
                    ExitCase::Cancelled => {
                        // A cancelled probe must not wedge the breaker
                        // half-open: fall back to the previous open period.
                        breaker.cell.store(BreakerState::Open {
                            started_at: last_started_at,
                            reset_timeout,
                            await_close,
                        });
                        (breaker.on_open)().await;
                    }
                    ExitCase::Completed => {
                        breaker.cell.store(BreakerState::Closed { failures: 0 });
                        let _ = await_close.complete(());
                        debug!("circuit breaker closed");
                        (breaker.on_closed)().await;
                    }
                    ExitCase::Failure(_) => {
                        let next_timeout = breaker.next_reset_timeout(reset_timeout);
                        breaker.cell.store(BreakerState::Open {
                            started_at: Instant::now(),
                            reset_timeout: next_timeout,
                            await_close,
                        });
                        debug!(?next_timeout, "circuit breaker re-opened after failed probe");
                        (breaker.on_open)().await;
                    }
                }
                Ok(())
            },
        )
        .await
    }

    /// Applies the backoff factor, honouring the ceiling.
    fn next_reset_timeout(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.exponential_backoff_factor;
        if scaled >= self.max_reset_timeout.as_secs_f64() {
            self.max_reset_timeout
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Returns a breaker sharing this state that additionally fires
    /// `callback` on every rejected call. Cumulative with prior callbacks.
    #[must_use]
    pub fn do_on_rejected<F, Fut>(&self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut next = self.clone();
        next.on_rejected = chain(&self.on_rejected, listener(callback));
        next
    }

    /// Returns a breaker sharing this state that additionally fires
    /// `callback` on transitions to `Closed`. Cumulative.
    #[must_use]
    pub fn do_on_closed<F, Fut>(&self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut next = self.clone();
        next.on_closed = chain(&self.on_closed, listener(callback));
        next
    }

    /// Returns a breaker sharing this state that additionally fires
    /// `callback` on transitions to `HalfOpen`. Cumulative.
    #[must_use]
    pub fn do_on_half_open<F, Fut>(&self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut next = self.clone();
        next.on_half_open = chain(&self.on_half_open, listener(callback));
        next
    }

    /// Returns a breaker sharing this state that additionally fires
    /// `callback` on transitions to `Open`. Cumulative.
    #[must_use]
    pub fn do_on_open<F, Fut>(&self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut next = self.clone();
        next.on_open = chain(&self.on_open, listener(callback));
        next
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("max_failures", &self.max_failures)
            .field("reset_timeout", &self.reset_timeout)
            .field(
                "exponential_backoff_factor",
                &self.exponential_backoff_factor,
            )
            .field("max_reset_timeout", &self.max_reset_timeout)
            .finish()
    }
}
