//! Single-assignment cell used for "await until released/closed" signals.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::{CoflowError, Result};

/// A single-assignment cell with any number of waiters.
///
/// Handles are cheap to clone and all point at the same cell. Completing a
/// promise twice is a recoverable [`CoflowError::AlreadyFulfilled`], unlike
/// the fatal double-completion of a forward cancellable.
pub struct Promise<A> {
    inner: Arc<Inner<A>>,
}

struct Inner<A> {
    value: Mutex<Option<A>>,
    notify: Notify,
}

impl<A: Clone> Promise<A> {
    /// Creates an empty promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Fulfills the promise, waking every waiter.
    ///
    /// # Errors
    ///
    /// Returns [`CoflowError::AlreadyFulfilled`] if the promise was already
    /// completed; the stored value is untouched.
    pub fn complete(&self, value: A) -> Result<()> {
        {
            let mut slot = self.inner.value.lock();
            if slot.is_some() {
                return Err(CoflowError::AlreadyFulfilled);
            }
            *slot = Some(value);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Returns the value if already fulfilled.
    #[must_use]
    pub fn try_get(&self) -> Option<A> {
        self.inner.value.lock().clone()
    }

    /// Waits until the promise is fulfilled and returns the value.
    pub async fn get(&self) -> A {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            if let Some(value) = self.try_get() {
                return value;
            }
            notified.as_mut().enable();
            if let Some(value) = self.try_get() {
                return value;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }

    /// Returns whether the promise has been fulfilled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<A: Clone> Default for Promise<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Promise<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Promise<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.inner.value.lock().is_some())
            .finish()
    }
}
