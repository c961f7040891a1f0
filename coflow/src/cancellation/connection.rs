//! Per-computation registry of pending cancellation actions.

use parking_lot::Mutex;
use tracing::warn;

use super::token::CancelToken;
use crate::errors::{CoflowError, Result};

/// A thread-safe stack of [`CancelToken`]s owned by one computation.
///
/// Tokens fire last-pushed-first when the connection is cancelled. Once
/// cancelled the stack is replaced by a terminal marker: a later push invokes
/// its token immediately instead of storing it, so a push never loses a race
/// with cancellation.
pub struct Connection {
    inner: Inner,
}

enum Inner {
    /// `Some(stack)` while active, `None` once cancelled.
    Default(Mutex<Option<Vec<CancelToken>>>),
    /// Never cancellable: pushes are discarded, cancel is a no-op.
    Uncancellable,
}

impl Connection {
    /// Creates a new, active connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Inner::Default(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Creates a connection that cannot be cancelled.
    ///
    /// Pushed tokens are discarded and never invoked; [`Connection::cancel`]
    /// does nothing. Used to mask a computation from cancellation.
    #[must_use]
    pub fn uncancellable() -> Self {
        Self {
            inner: Inner::Uncancellable,
        }
    }

    /// Pushes a token to be invoked on cancellation.
    ///
    /// If the connection is already cancelled the token is invoked immediately
    /// as a fire-and-forget uncancellable action; its failure is logged, not
    /// raised.
    pub fn push(&self, token: CancelToken) {
        match &self.inner {
            Inner::Uncancellable => {}
            Inner::Default(state) => {
                let late = {
                    let mut guard = state.lock();
                    match guard.as_mut() {
                        Some(stack) => {
                            stack.push(token);
                            None
                        }
                        None => Some(token),
                    }
                };
                if let Some(token) = late {
                    tokio::spawn(async move {
                        let id = token.id();
                        if let Err(e) = token.invoke().await {
                            warn!(token = %id, error = %e, "late cancel token failed");
                        }
                    });
                }
            }
        }
    }

    /// Pushes several tokens as one aggregate entry.
    pub fn push_all(&self, tokens: Vec<CancelToken>) {
        self.push(CancelToken::aggregate(tokens));
    }

    /// Removes and returns the most-recently pushed token without invoking it.
    ///
    /// Returns a no-op token when the stack is empty, cancelled or the
    /// connection is uncancellable.
    #[must_use]
    pub fn pop(&self) -> CancelToken {
        match &self.inner {
            Inner::Uncancellable => CancelToken::noop(),
            Inner::Default(state) => state
                .lock()
                .as_mut()
                .and_then(Vec::pop)
                .unwrap_or_else(CancelToken::noop),
        }
    }

    /// Cancels the connection, draining and invoking every stored token in
    /// reverse push order.
    ///
    /// Idempotent: only the first call drains the stack. Per-token failures
    /// are collected and composed so the stack always finishes draining.
    pub async fn cancel(&self) -> Result<()> {
        let stack = match &self.inner {
            Inner::Uncancellable => None,
            Inner::Default(state) => state.lock().take(),
        };

        let Some(stack) = stack else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for token in stack.into_iter().rev() {
            if let Err(e) = token.invoke().await {
                failures.push(e);
            }
        }

        let mut iter = failures.into_iter();
        match iter.next() {
            None => Ok(()),
            Some(primary) => Err(CoflowError::compose_all(primary, iter.collect())),
        }
    }

    /// Returns whether the connection has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            Inner::Uncancellable => false,
            Inner::Default(state) => state.lock().is_none(),
        }
    }

    /// Returns whether the connection is still active.
    #[must_use]
    pub fn is_not_cancelled(&self) -> bool {
        !self.is_cancelled()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = match &self.inner {
            Inner::Uncancellable => 0,
            Inner::Default(state) => state.lock().as_ref().map_or(0, Vec::len),
        };
        f.debug_struct("Connection")
            .field("cancelled", &self.is_cancelled())
            .field("pending_tokens", &pending)
            .finish()
    }
}
