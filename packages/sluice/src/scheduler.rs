//! Pluggable executor abstraction.
//!
//! Dispatchers, serial queues and delays never create threads themselves. They hand units of
//! work to a [`Scheduler`], which runs them somewhere and eventually drives them to completion.
//! [`TokioScheduler`] is the provided implementation.

use crate::{
    error::{NoRuntimeError, TaskError},
    task::{self, run_unit, Task},
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tokio::runtime::Handle;


/// Boxed unit of asynchronous work
pub type BoxUnit = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Boxed unit of blocking work
pub type BlockingUnit = Box<dyn FnOnce() + Send + 'static>;

/// Something that accepts units of work and runs them on some worker
///
/// Implementations must eventually run every unit they accept, or drop it. Dropping a unit
/// resolves any [`Task`] tied to it as cancelled.
pub trait Scheduler: Send + Sync + 'static {
    /// Run an asynchronous unit
    fn spawn(&self, unit: BoxUnit);

    /// Run a unit which may block its thread for a while
    ///
    /// Defaults to running it as an asynchronous unit which never yields.
    fn spawn_blocking(&self, unit: BlockingUnit) {
        self.spawn(Box::pin(async move { unit() }));
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn spawn(&self, unit: BoxUnit) {
        (**self).spawn(unit)
    }

    fn spawn_blocking(&self, unit: BlockingUnit) {
        (**self).spawn_blocking(unit)
    }
}

/// Typed conveniences on top of any [`Scheduler`]
pub trait SchedulerExt: Scheduler {
    /// Schedule a unit and get a task for its outcome
    ///
    /// Errors returned by the unit, and panics unwinding out of it, resolve the task as faulted.
    fn schedule<T, E, F>(&self, unit: F) -> Task<T>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<TaskError> + 'static,
    {
        let (completer, task) = task::pair();
        self.spawn(Box::pin(async move {
            completer.complete(run_unit(unit).await);
        }));
        task
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}


/// [`Scheduler`] backed by a tokio runtime
///
/// Asynchronous units go to `Handle::spawn` and blocking units go to `Handle::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct TokioScheduler(Handle);

impl TokioScheduler {
    /// Use the runtime of the calling context
    pub fn current() -> Result<Self, NoRuntimeError> {
        Handle::try_current()
            .map(TokioScheduler)
            .map_err(|_| NoRuntimeError)
    }

    /// Use a specific runtime
    pub fn new(handle: Handle) -> Self {
        TokioScheduler(handle)
    }

    /// The underlying runtime handle
    pub fn handle(&self) -> &Handle {
        &self.0
    }
}

impl From<Handle> for TokioScheduler {
    fn from(handle: Handle) -> Self {
        TokioScheduler(handle)
    }
}

impl Scheduler for TokioScheduler {
    fn spawn(&self, unit: BoxUnit) {
        drop(self.0.spawn(unit));
    }

    fn spawn_blocking(&self, unit: BlockingUnit) {
        drop(self.0.spawn_blocking(unit));
    }
}


// ==== handoff tracking ====


// progress of handing a unit to a scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum HandoffState {
    // the spawner is still inside the scheduler call.
    Spawning,
    // the scheduler call returned with the unit still alive.
    Accepted,
    // the unit was dropped before the scheduler call returned.
    Refused,
}

// shared between a spawner and the drop guard inside the unit it spawns, so that a unit the
// scheduler drops on the spawner's own stack is told apart from one dropped later on. the former
// is retried by the spawner, the latter is handled by the guard.
#[derive(Debug, Clone)]
pub(crate) struct Handoff(Arc<AtomicU8>);

impl Handoff {
    pub(crate) fn new() -> Self {
        Handoff(Arc::new(AtomicU8::new(HandoffState::Spawning as u8)))
    }

    // called by the spawner once the scheduler call has returned. false if the unit was refused.
    pub(crate) fn accept(&self) -> bool {
        self.transition(HandoffState::Accepted)
    }

    // called by the guard when the unit is dropped unfinished. true if the spawner is still inside
    // the scheduler call and will deal with it.
    pub(crate) fn refuse(&self) -> bool {
        self.transition(HandoffState::Refused)
    }

    fn transition(&self, to: HandoffState) -> bool {
        self.0
            .compare_exchange(
                HandoffState::Spawning as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    // scheduler wrapper which counts how many units it was handed.
    pub(crate) struct CountingScheduler {
        pub(crate) inner: TokioScheduler,
        pub(crate) spawned: AtomicUsize,
        pub(crate) spawned_blocking: AtomicUsize,
    }

    impl CountingScheduler {
        pub(crate) fn current() -> Arc<Self> {
            Arc::new(CountingScheduler {
                inner: TokioScheduler::current().unwrap(),
                spawned: AtomicUsize::new(0),
                spawned_blocking: AtomicUsize::new(0),
            })
        }
    }

    impl Scheduler for CountingScheduler {
        fn spawn(&self, unit: BoxUnit) {
            self.spawned.fetch_add(1, SeqCst);
            self.inner.spawn(unit);
        }

        fn spawn_blocking(&self, unit: BlockingUnit) {
            self.spawned_blocking.fetch_add(1, SeqCst);
            self.inner.spawn_blocking(unit);
        }
    }

    // scheduler which relies on the default spawn_blocking.
    pub(crate) struct OnlyAsync(pub(crate) TokioScheduler);

    impl Scheduler for OnlyAsync {
        fn spawn(&self, unit: BoxUnit) {
            self.0.spawn(unit);
        }
    }

    // scheduler wrapper which drops the first few units it is handed, unrun.
    pub(crate) struct DropFirst {
        pub(crate) inner: TokioScheduler,
        pub(crate) remaining: AtomicUsize,
        pub(crate) dropped: AtomicUsize,
    }

    impl DropFirst {
        pub(crate) fn current(n: usize) -> Arc<Self> {
            Arc::new(DropFirst {
                inner: TokioScheduler::current().unwrap(),
                remaining: AtomicUsize::new(n),
                dropped: AtomicUsize::new(0),
            })
        }

        fn take_drop(&self) -> bool {
            let take = self.remaining
                .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if take {
                self.dropped.fetch_add(1, SeqCst);
            }
            take
        }
    }

    impl Scheduler for DropFirst {
        fn spawn(&self, unit: BoxUnit) {
            if self.take_drop() {
                drop(unit);
            } else {
                self.inner.spawn(unit);
            }
        }

        fn spawn_blocking(&self, unit: BlockingUnit) {
            if self.take_drop() {
                drop(unit);
            } else {
                self.inner.spawn_blocking(unit);
            }
        }
    }

    // scheduler which accepts every unit and later drops the first few, unrun, from another
    // thread.
    pub(crate) struct DropLater {
        pub(crate) inner: TokioScheduler,
        pub(crate) remaining: AtomicUsize,
    }

    impl DropLater {
        pub(crate) fn current(n: usize) -> Arc<Self> {
            Arc::new(DropLater {
                inner: TokioScheduler::current().unwrap(),
                remaining: AtomicUsize::new(n),
            })
        }

        fn take_drop(&self) -> bool {
            self.remaining
                .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl Scheduler for DropLater {
        fn spawn(&self, unit: BoxUnit) {
            if self.take_drop() {
                self.inner.spawn_blocking(Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    drop(unit);
                }));
            } else {
                self.inner.spawn(unit);
            }
        }

        fn spawn_blocking(&self, unit: BlockingUnit) {
            if self.take_drop() {
                self.inner.spawn_blocking(Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    drop(unit);
                }));
            } else {
                self.inner.spawn_blocking(unit);
            }
        }
    }

    #[test]
    fn handoff_decides_once() {
        let accepted = Handoff::new();
        assert!(accepted.accept());
        assert!(!accepted.refuse());

        let refused = Handoff::new();
        assert!(refused.clone().refuse());
        assert!(!refused.accept());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_unit_cancels_scheduled_task() {
        let scheduler = DropFirst::current(1);
        let dropped = scheduler.schedule(async { Ok::<_, anyhow::Error>(1) });
        let kept = scheduler.schedule(async { Ok::<_, anyhow::Error>(2) });
        assert!(dropped.await.unwrap_err().is_canceled());
        assert_eq!(kept.await.unwrap(), 2);
        assert_eq!(scheduler.dropped.load(SeqCst), 1);
    }

    #[test]
    fn current_fails_outside_runtime() {
        assert_eq!(TokioScheduler::current().unwrap_err(), NoRuntimeError);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schedule_resolves_task() {
        let scheduler = TokioScheduler::current().unwrap();
        let task = scheduler.schedule(async { Ok::<_, anyhow::Error>(5) });
        assert_eq!(task.await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn schedule_captures_faults() {
        let scheduler = TokioScheduler::current().unwrap();
        let task = scheduler.schedule(async { Err::<(), _>(anyhow::anyhow!("broken")) });
        let err = task.await.unwrap_err();
        assert!(err.is_faulted());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_spawn_blocking_runs_inline_unit() {
        let scheduler = OnlyAsync(TokioScheduler::current().unwrap());
        let (completer, task) = task::pair();
        scheduler.spawn_blocking(Box::new(move || completer.complete(Ok(3u8))));
        assert_eq!(task.await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn counting_scheduler_counts() {
        let scheduler = CountingScheduler::current();
        scheduler.schedule(async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        assert_eq!(scheduler.spawned.load(SeqCst), 1);
    }
}
