//! Delayed, cancellable execution.

use crate::{
    cancel::CancellationToken,
    error::TaskError,
    scheduler::Scheduler,
    task::{self, run_factory, Task},
};
use std::{future::Future, time::Duration};
use tokio::time::sleep;


/// Start a unit once a delay has elapsed, unless cancelled first
///
/// `factory` is not called before `delay` has elapsed (subject to timer granularity). If `token`
/// is cancelled before then, the timer is dropped, `factory` is never called, and the task
/// resolves as [`TaskError::Canceled`]. Cancelling after the unit has started has no effect on
/// it; the unit observes cancellation only if it watches the token itself.
///
/// The timer is owned by the scheduled unit, so it is released exactly once, whichever of firing
/// or cancellation happens first.
pub fn start_delayed<S, T, E, F, G>(
    scheduler: &S,
    delay: Duration,
    factory: G,
    token: Option<CancellationToken>,
) -> Task<T>
where
    S: Scheduler + ?Sized,
    G: FnOnce() -> F + Send + 'static,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<TaskError> + 'static,
{
    let (completer, task) = task::pair();
    scheduler.spawn(Box::pin(async move {
        if !wait(delay, token.as_ref()).await {
            trace!(?delay, "delayed unit cancelled before firing");
            completer.cancel();
            return;
        }
        trace!(?delay, "delayed unit firing");
        completer.complete(run_factory(factory).await);
    }));
    task
}

/// Get a task which resolves once a delay has elapsed, or as cancelled if `token` is cancelled
/// first
pub fn delay<S>(scheduler: &S, delay: Duration, token: Option<CancellationToken>) -> Task<()>
where
    S: Scheduler + ?Sized,
{
    start_delayed(scheduler, delay, || async { Ok::<(), TaskError>(()) }, token)
}

// sleep for the delay. returns false if cancelled first.
async fn wait(delay: Duration, token: Option<&CancellationToken>) -> bool {
    match token {
        Some(token) => {
            if token.is_cancelled() {
                return false;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = sleep(delay) => true,
            }
        }
        None => {
            sleep(delay).await;
            true
        }
    }
}
