//! One-shot rendezvous between an early cancel request and a cancel token
//! that is not yet known.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::token::CancelToken;
use crate::errors::Result;

/// Decouples "cancellation requested" from "the concrete token became known".
///
/// A bracket pushes a `ForwardCancellable`-backed token on its connection
/// before acquiring a resource. A cancel arriving while the release action is
/// still unknown is parked here and serviced the moment [`complete`] supplies
/// the token. The underlying token is invoked exactly once regardless of how
/// the two entry points interleave.
///
/// [`complete`]: ForwardCancellable::complete
pub struct ForwardCancellable {
    state: Mutex<State>,
}

enum State {
    /// No token yet; senders belong to parked cancel callers.
    Empty(Vec<oneshot::Sender<Result<()>>>),
    /// Token known, no cancel seen yet.
    Active(CancelToken),
    /// Token has been invoked (or handed to an invoker).
    Finished,
}

impl ForwardCancellable {
    /// Creates an empty forward cancellable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Empty(Vec::new())),
        }
    }

    /// Supplies the concrete cancel token.
    ///
    /// Returns `true` when a cancel request was already parked: the token has
    /// then been invoked and every parked caller resumed with its result.
    /// Returns `false` when the token was stored for a later cancel.
    ///
    /// # Panics
    ///
    /// Calling `complete` a second time is a fatal programmer error.
    pub async fn complete(&self, token: CancelToken) -> bool {
        let pending = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Finished) {
                State::Empty(callbacks) if callbacks.is_empty() => {
                    *state = State::Active(token);
                    return false;
                }
                State::Empty(callbacks) => Some((token, callbacks)),
                State::Active(_) | State::Finished => {
                    panic!("ForwardCancellable completed twice")
                }
            }
        };

        if let Some((token, callbacks)) = pending {
            let result = token.invoke().await;
            for callback in callbacks {
                let _ = callback.send(result.clone());
            }
            return true;
        }
        false
    }

    /// Requests cancellation.
    ///
    /// If the token is known it is invoked and its result forwarded. If not,
    /// the caller suspends until [`complete`] arrives and services the request
    /// (back-pressure). If the token already fired, returns immediately.
    ///
    /// [`complete`]: ForwardCancellable::complete
    pub async fn cancel(&self) -> Result<()> {
        enum Entry {
            Invoke(CancelToken),
            Wait(oneshot::Receiver<Result<()>>),
            Done,
        }

        let entry = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Finished) {
                State::Active(token) => Entry::Invoke(token),
                State::Empty(mut callbacks) => {
                    let (tx, rx) = oneshot::channel();
                    callbacks.push(tx);
                    *state = State::Empty(callbacks);
                    Entry::Wait(rx)
                }
                State::Finished => Entry::Done,
            }
        };

        match entry {
            Entry::Invoke(token) => token.invoke().await,
            Entry::Wait(rx) => rx.await.unwrap_or_else(|_| {
                trace!("forward cancellable dropped before completion");
                Ok(())
            }),
            Entry::Done => Ok(()),
        }
    }

    /// Adapts this forward cancellable into a token pushable on a connection.
    #[must_use]
    pub fn token(self: &Arc<Self>) -> CancelToken {
        let forward = Arc::clone(self);
        CancelToken::named("forward", move || async move { forward.cancel().await })
    }
}

impl Default for ForwardCancellable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ForwardCancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            State::Empty(callbacks) => format!("Empty({} pending)", callbacks.len()),
            State::Active(_) => "Active".to_string(),
            State::Finished => "Finished".to_string(),
        };
        f.debug_struct("ForwardCancellable")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoflowError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_token(count: &Arc<AtomicUsize>) -> CancelToken {
        let count = count.clone();
        CancelToken::new(move || async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_complete_then_cancel_fires_once() {
        let forward = Arc::new(ForwardCancellable::new());
        let count = Arc::new(AtomicUsize::new(0));

        let fired = forward.complete(counting_token(&count)).await;
        assert!(!fired);

        forward.cancel().await.unwrap();
        forward.cancel().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_complete_backpressures() {
        let forward = Arc::new(ForwardCancellable::new());
        let count = Arc::new(AtomicUsize::new(0));

        let canceller = {
            let forward = forward.clone();
            tokio::spawn(async move { forward.cancel().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!canceller.is_finished());

        let fired = forward.complete(counting_token(&count)).await;
        assert!(fired);

        canceller.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multiple_cancellers_all_observe_completion() {
        let forward = Arc::new(ForwardCancellable::new());

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let forward = forward.clone();
                tokio::spawn(async move { forward.cancel().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let failing = CancelToken::new(|| async { Err(CoflowError::operation("release broke")) });
        assert!(forward.complete(failing).await);

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "release broke");
        }
    }

    #[tokio::test]
    #[should_panic(expected = "completed twice")]
    async fn test_double_complete_panics() {
        let forward = ForwardCancellable::new();
        forward.complete(CancelToken::noop()).await;
        forward.complete(CancelToken::noop()).await;
    }

    #[tokio::test]
    async fn test_connection_token_adapter() {
        let forward = Arc::new(ForwardCancellable::new());
        let count = Arc::new(AtomicUsize::new(0));

        let token = forward.token();
        forward.complete(counting_token(&count)).await;
        token.invoke().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
