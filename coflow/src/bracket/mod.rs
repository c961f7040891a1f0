//! The acquire/use/release protocol: resource safety under cancellation.
//!
//! [`bracket_case`] is the backbone the semaphore and circuit breaker are
//! built on. It guarantees that once `acquire` succeeds, `release` runs
//! exactly once with the [`ExitCase`] describing how `use` ended, no matter
//! how cancellation interleaves with normal completion.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::cancellation::{CancelToken, Connection, ForwardCancellable};
use crate::errors::{CoflowError, Result};

/// How a scoped `use` stage ended. Passed to the release action.
#[derive(Debug, Clone)]
pub enum ExitCase {
    /// The use stage returned a value.
    Completed,
    /// The use stage was cancelled through the connection.
    Cancelled,
    /// The use stage returned an error.
    Failure(CoflowError),
}

impl ExitCase {
    /// Returns whether this exit case is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns whether this exit case is a normal completion.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns whether this exit case carries a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

type ReleaseFn = Box<dyn FnOnce(ExitCase) -> BoxFuture<'static, Result<()>> + Send>;

/// Idempotent holder of the pending release action.
///
/// Exactly one of the normal path and the cancellation path takes the action;
/// the loser waits for the winner to finish.
struct ReleaseGuard {
    release: Mutex<Option<ReleaseFn>>,
    finished: AtomicBool,
    done: Notify,
}

impl ReleaseGuard {
    fn new<A, Rel, RelFut>(resource: A, release: Rel) -> Self
    where
        A: Send + 'static,
        Rel: FnOnce(A, ExitCase) -> RelFut + Send + 'static,
        RelFut: Future<Output = Result<()>> + Send + 'static,
    {
        let action: ReleaseFn = Box::new(move |exit| Box::pin(release(resource, exit)));
        Self {
            release: Mutex::new(Some(action)),
            finished: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    /// Runs the release action if nobody has yet. `None` means the race was
    /// lost and somebody else is (or has been) running it.
    async fn run(&self, exit: ExitCase) -> Option<Result<()>> {
        let action = self.release.lock().take()?;
        let result = action(exit).await;
        self.finished.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
        Some(result)
    }

    /// Waits until the release action has finished.
    async fn wait_done(&self) {
        let notified = self.done.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.finished.load(Ordering::SeqCst) {
                return;
            }
            notified.as_mut().await;
            notified.set(self.done.notified());
        }
    }

    /// The token handed to the connection for the duration of `use`.
    fn cancel_token(self: &Arc<Self>) -> CancelToken {
        let guard = Arc::clone(self);
        CancelToken::named("bracket-release", move || async move {
            match guard.run(ExitCase::Cancelled).await {
                Some(result) => result,
                None => {
                    // Normal completion won the race; wait so the canceller
                    // only resumes once cleanup has actually finished.
                    guard.wait_done().await;
                    Ok(())
                }
            }
        })
    }
}

/// Safely acquires, uses and releases a resource, reporting the exit case of
/// the `use` stage to `release`.
///
/// Stage contract:
/// 1. `acquire` runs with cancellation suppressed. A cancel arriving now is
///    back-pressured until the release action is known, then serviced by
///    invoking `release(resource, ExitCase::Cancelled)` before the canceller
///    resumes. If `acquire` fails, `release` is never invoked.
/// 2. `use` runs normally cancellable; it receives a clone of the resource
///    (share expensive resources behind an `Arc`).
/// 3. `release` runs exactly once, cancellation suppressed. Its error becomes
///    the result when `use` succeeded, and is composed (suppressed) behind
///    `use`'s error when both fail.
pub async fn bracket_case<A, B, Acq, AcqFut, Use, UseFut, Rel, RelFut>(
    conn: &Arc<Connection>,
    acquire: Acq,
    use_stage: Use,
    release: Rel,
) -> Result<B>
where
    A: Clone + Send + 'static,
    Acq: FnOnce() -> AcqFut,
    AcqFut: Future<Output = Result<A>>,
    Use: FnOnce(A) -> UseFut,
    UseFut: Future<Output = Result<B>>,
    Rel: FnOnce(A, ExitCase) -> RelFut + Send + 'static,
    RelFut: Future<Output = Result<()>> + Send + 'static,
{
    let forward = Arc::new(ForwardCancellable::new());
    conn.push(forward.token());

    let resource = match acquire().await {
        Ok(resource) => resource,
        Err(e) => {
            // No resource was acquired: free any parked cancellers and
            // propagate the error directly, never running release.
            let _ = conn.pop();
            forward.complete(CancelToken::noop()).await;
            return Err(e);
        }
    };

    let guard = Arc::new(ReleaseGuard::new(resource.clone(), release));
    if forward.complete(guard.cancel_token()).await {
        // A cancel was parked during acquire; the resource counts as
        // allocated, so release(Cancelled) has already run.
        trace!("cancel serviced after acquire completed");
        return Err(CoflowError::cancelled("cancelled while acquiring"));
    }

    let use_fut = use_stage(resource);
    tokio::pin!(use_fut);
    let outcome = tokio::select! {
        result = &mut use_fut => Some(result),
        () = guard.wait_done() => None,
    };

    let Some(result) = outcome else {
        // Cancellation won while `use` was in flight; release(Cancelled)
        // already ran and the use stage was dropped.
        return Err(CoflowError::cancelled("cancelled during use"));
    };

    // Detach our hook before releasing on the normal path.
    let _ = conn.pop();

    match result {
        Ok(value) => match guard.run(ExitCase::Completed).await {
            Some(Ok(())) => Ok(value),
            Some(Err(release_err)) => Err(release_err),
            None => {
                guard.wait_done().await;
                Err(CoflowError::cancelled("cancelled during use"))
            }
        },
        Err(use_err) => match guard.run(ExitCase::Failure(use_err.clone())).await {
            Some(Ok(())) => Err(use_err),
            Some(Err(release_err)) => Err(use_err.compose(release_err)),
            None => {
                guard.wait_done().await;
                Err(use_err)
            }
        },
    }
}

/// [`bracket_case`] without exit-case information in the release action.
pub async fn bracket<A, B, Acq, AcqFut, Use, UseFut, Rel, RelFut>(
    conn: &Arc<Connection>,
    acquire: Acq,
    use_stage: Use,
    release: Rel,
) -> Result<B>
where
    A: Clone + Send + 'static,
    Acq: FnOnce() -> AcqFut,
    AcqFut: Future<Output = Result<A>>,
    Use: FnOnce(A) -> UseFut,
    UseFut: Future<Output = Result<B>>,
    Rel: FnOnce(A) -> RelFut + Send + 'static,
    RelFut: Future<Output = Result<()>> + Send + 'static,
{
    bracket_case(conn, acquire, use_stage, move |a, _exit| release(a)).await
}

/// Guarantees the finalizer runs after `fa`, observing how `fa` ended.
pub async fn guarantee_case<B, F, Fut, Fin, FinFut>(
    conn: &Arc<Connection>,
    fa: F,
    finalizer: Fin,
) -> Result<B>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<B>>,
    Fin: FnOnce(ExitCase) -> FinFut + Send + 'static,
    FinFut: Future<Output = Result<()>> + Send + 'static,
{
    bracket_case(
        conn,
        || async { Ok(()) },
        |()| fa(),
        move |(), exit| finalizer(exit),
    )
    .await
}

/// Guarantees the finalizer runs after `fa` on every exit path.
pub async fn guarantee<B, F, Fut, Fin, FinFut>(
    conn: &Arc<Connection>,
    fa: F,
    finalizer: Fin,
) -> Result<B>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<B>>,
    Fin: FnOnce() -> FinFut + Send + 'static,
    FinFut: Future<Output = Result<()>> + Send + 'static,
{
    guarantee_case(conn, fa, move |_exit| finalizer()).await
}

/// Runs `fa` masked from cancellation.
///
/// The computation receives a fresh connection that is never cancelled, so
/// any cancellation hooks it installs are inert. Honour outer cancellation
/// after it completes.
pub async fn uncancellable<B, F, Fut>(fa: F) -> Result<B>
where
    F: FnOnce(Arc<Connection>) -> Fut,
    Fut: Future<Output = Result<B>>,
{
    let conn = Arc::new(Connection::uncancellable());
    fa(conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type ExitLog = Arc<Mutex<Vec<ExitCase>>>;

    fn release_recorder(log: &ExitLog) -> impl FnOnce(u32, ExitCase) -> BoxFuture<'static, Result<()>> + Send + 'static {
        let log = log.clone();
        move |_resource, exit| {
            Box::pin(async move {
                log.lock().push(exit);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_release_runs_once_on_success() {
        let conn = Arc::new(Connection::new());
        let log: ExitLog = Arc::new(Mutex::new(Vec::new()));

        let result = bracket_case(
            &conn,
            || async { Ok(7_u32) },
            |r| async move { Ok(r * 6) },
            release_recorder(&log),
        )
        .await
        .unwrap();

        assert_eq!(result, 42);
        let exits = log.lock();
        assert_eq!(exits.len(), 1);
        assert!(exits[0].is_completed());
    }

    #[tokio::test]
    async fn test_release_sees_failure_and_error_propagates() {
        let conn = Arc::new(Connection::new());
        let log: ExitLog = Arc::new(Mutex::new(Vec::new()));

        let err = bracket_case(
            &conn,
            || async { Ok(1_u32) },
            |_| async { Err::<(), _>(CoflowError::operation("use blew up")) },
            release_recorder(&log),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "use blew up");
        let exits = log.lock();
        assert_eq!(exits.len(), 1);
        assert!(exits[0].is_failure());
    }

    #[tokio::test]
    async fn test_release_error_becomes_result_when_use_succeeds() {
        let conn = Arc::new(Connection::new());

        let err = bracket_case(
            &conn,
            || async { Ok(()) },
            |()| async { Ok(5_i32) },
            |(), _exit| async { Err(CoflowError::operation("release broke")) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "release broke");
    }

    #[tokio::test]
    async fn test_both_failing_composes_with_use_primary() {
        let conn = Arc::new(Connection::new());

        let err = bracket_case(
            &conn,
            || async { Ok(()) },
            |()| async { Err::<(), _>(CoflowError::operation("use failed")) },
            |(), _exit| async { Err(CoflowError::operation("release failed")) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.primary().to_string(), "use failed");
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(err.suppressed()[0].to_string(), "release failed");
    }

    #[tokio::test]
    async fn test_acquire_error_skips_release() {
        let conn = Arc::new(Connection::new());
        let released = Arc::new(AtomicUsize::new(0));

        let released_clone = released.clone();
        let err = bracket_case(
            &conn,
            || async { Err::<u32, _>(CoflowError::operation("no resource")) },
            |_| async { Ok(()) },
            move |_, _exit| async move {
                released_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "no resource");
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_use_releases_cancelled_once() {
        let conn = Arc::new(Connection::new());
        let log: ExitLog = Arc::new(Mutex::new(Vec::new()));
        let use_finished = Arc::new(AtomicUsize::new(0));

        let task = {
            let conn = conn.clone();
            let log = log.clone();
            let use_finished = use_finished.clone();
            tokio::spawn(async move {
                bracket_case(
                    &conn,
                    || async { Ok(()) },
                    move |()| async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        use_finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    release_recorder_unit(&log),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.cancel().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(use_finished.load(Ordering::SeqCst), 0);

        let exits = log.lock();
        assert_eq!(exits.len(), 1);
        assert!(exits[0].is_cancelled());
    }

    fn release_recorder_unit(log: &ExitLog) -> impl FnOnce((), ExitCase) -> BoxFuture<'static, Result<()>> + Send + 'static {
        let log = log.clone();
        move |(), exit| {
            Box::pin(async move {
                log.lock().push(exit);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_during_acquire_backpressures_then_releases() {
        let conn = Arc::new(Connection::new());
        let log: ExitLog = Arc::new(Mutex::new(Vec::new()));
        let use_ran = Arc::new(AtomicUsize::new(0));

        let task = {
            let conn = conn.clone();
            let log = log.clone();
            let use_ran = use_ran.clone();
            tokio::spawn(async move {
                bracket_case(
                    &conn,
                    || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    },
                    move |()| async move {
                        use_ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    release_recorder_unit(&log),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        // This suspends until acquire finishes and release(Cancelled) ran.
        conn.cancel().await.unwrap();

        let exits = log.lock();
        assert_eq!(exits.len(), 1);
        assert!(exits[0].is_cancelled());
        drop(exits);

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(use_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_guarantee_runs_finalizer_on_both_paths() {
        let conn = Arc::new(Connection::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        guarantee(&conn, || async { Ok(1_u32) }, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        let c = count.clone();
        let _ = guarantee(
            &conn,
            || async { Err::<u32, _>(CoflowError::operation("nope")) },
            move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_guarantee_case_reports_exit() {
        let conn = Arc::new(Connection::new());
        let log: ExitLog = Arc::new(Mutex::new(Vec::new()));

        let log_clone = log.clone();
        let _ = guarantee_case(
            &conn,
            || async { Err::<u32, _>(CoflowError::operation("bad")) },
            move |exit| async move {
                log_clone.lock().push(exit);
                Ok(())
            },
        )
        .await;

        assert!(log.lock()[0].is_failure());
    }

    #[tokio::test]
    async fn test_uncancellable_masks_hooks() {
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let value = uncancellable(|conn| async move {
            let f = fired_clone.clone();
            conn.push(CancelToken::new(move || async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            conn.cancel().await?;
            Ok(99_u32)
        })
        .await
        .unwrap();

        assert_eq!(value, 99);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
