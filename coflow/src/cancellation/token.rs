//! Cancel tokens: named, one-shot asynchronous cancel actions.

use std::future::Future;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::errors::{CoflowError, Result};

/// The type-erased future produced by invoking a [`CancelToken`].
pub type CancelFuture = BoxFuture<'static, Result<()>>;

/// A named zero-argument asynchronous action describing how to cancel.
///
/// A token is a pure description: it does nothing until [`CancelToken::invoke`]
/// consumes it, and it is invoked at most once by construction.
pub struct CancelToken {
    /// Opaque identity, usable as a map key for registrations.
    id: Uuid,
    /// Optional name for debugging.
    name: Option<String>,
    /// The cancel action.
    action: Box<dyn FnOnce() -> CancelFuture + Send>,
}

impl CancelToken {
    /// Creates a token from an asynchronous cancel action.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: None,
            action: Box::new(move || Box::pin(action())),
        }
    }

    /// Creates a named token.
    pub fn named<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut token = Self::new(action);
        token.name = Some(name.into());
        token
    }

    /// A token that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::named("noop", || async { Ok(()) })
    }

    /// Folds several tokens into one that invokes them all in order.
    ///
    /// Failures are collected and composed rather than raised individually, so
    /// a failing token never prevents later tokens from running.
    #[must_use]
    pub fn aggregate(tokens: Vec<CancelToken>) -> Self {
        Self::named("aggregate", move || async move {
            let mut failures = Vec::new();
            for token in tokens {
                if let Err(e) = token.invoke().await {
                    failures.push(e);
                }
            }
            match failures.len() {
                0 => Ok(()),
                _ => {
                    let mut iter = failures.into_iter();
                    let primary = iter.next().ok_or_else(|| {
                        CoflowError::Internal("aggregate failure list emptied".into())
                    })?;
                    Err(CoflowError::compose_all(primary, iter.collect()))
                }
            }
        })
    }

    /// Returns the opaque identity of this token.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the token name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs the cancel action, consuming the token.
    pub async fn invoke(self) -> Result<()> {
        (self.action)().await
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_invoke_runs_action_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let token = CancelToken::new(move || async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        token.invoke().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_succeeds() {
        assert!(CancelToken::noop().invoke().await.is_ok());
    }

    #[tokio::test]
    async fn test_aggregate_runs_all_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let tokens = (0..3)
            .map(|i| {
                let order = order.clone();
                CancelToken::new(move || async move {
                    order.lock().push(i);
                    Ok(())
                })
            })
            .collect();

        CancelToken::aggregate(tokens).invoke().await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_aggregate_composes_failures() {
        let ran_after_failure = Arc::new(AtomicUsize::new(0));
        let ran = ran_after_failure.clone();

        let tokens = vec![
            CancelToken::new(|| async { Err(CoflowError::operation("first failure")) }),
            CancelToken::new(move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            CancelToken::new(|| async { Err(CoflowError::operation("second failure")) }),
        ];

        let err = CancelToken::aggregate(tokens).invoke().await.unwrap_err();
        assert_eq!(err.primary().to_string(), "first failure");
        assert_eq!(err.suppressed().len(), 1);
        // The middle token still ran despite the earlier failure.
        assert_eq!(ran_after_failure.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tokens_have_distinct_ids() {
        let a = CancelToken::noop();
        let b = CancelToken::noop();
        assert_ne!(a.id(), b.id());
    }
}
