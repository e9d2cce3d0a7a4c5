// shared dispatcher state and lane bookkeeping.

use crate::{
    error::Fault,
    scheduler::Scheduler,
    work_queue::WorkQueue,
};
use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Mutex},
};
use tokio::sync::Notify;


// synchronous handler shape.
pub(crate) type ActionFn<T> = dyn Fn(T) -> anyhow::Result<()> + Send + Sync + 'static;

// future returned by the async handler shape.
pub(crate) type HandlerFut = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

// future-returning handler shape.
pub(crate) type AsyncFn<T> = dyn Fn(T) -> HandlerFut + Send + Sync + 'static;

// fault observer.
pub(crate) type FaultSink = Arc<dyn Fn(Fault) + Send + Sync + 'static>;

// the handler a dispatcher was built with. fixed for the dispatcher's lifetime.
pub(crate) enum Handler<T> {
    Action(Box<ActionFn<T>>),
    Async(Box<AsyncFn<T>>),
}

// validated configuration.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Config {
    pub(crate) max_parallelism: usize,
    pub(crate) max_items_per_task: usize,
}

// dispatcher shared state.
pub(crate) struct Shared<T> {
    // buffered items not yet taken by a lane.
    pub(crate) queue: WorkQueue<T>,
    pub(crate) handler: Handler<T>,
    pub(crate) config: Config,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    // mutex around lockable state.
    lockable: Mutex<Lockable>,
    // notified whenever the active lane count drops to 0.
    idle: Notify,
    // none means faults are logged.
    fault_sink: Option<FaultSink>,
}

// dispatcher lockable state.
struct Lockable {
    // number of lanes which exist.
    //
    // - never exceeds config.max_parallelism, and never exceeds 1 for the action shape.
    // - if 0, the queue was empty when it was last checked under the lock, unless the scheduler
    //   refused to take a lane, in which case the next post starts one.
    active: usize,
}

impl<T> Shared<T> {
    pub(crate) fn new(
        handler: Handler<T>,
        config: Config,
        scheduler: Arc<dyn Scheduler>,
        fault_sink: Option<FaultSink>,
    ) -> Self {
        Shared {
            queue: WorkQueue::new(),
            handler,
            config,
            scheduler,
            lockable: Mutex::new(Lockable { active: 0 }),
            idle: Notify::new(),
            fault_sink,
        }
    }

    // having just pushed an item, or released a lane, decide whether a new lane should start. if
    // this returns true, the lane has already been counted, and the caller must start it.
    pub(crate) fn claim_lane(&self) -> bool {
        let limit = match &self.handler {
            Handler::Action(_) => 1,
            Handler::Async(_) => self.config.max_parallelism,
        };
        let mut lock = self.lockable.lock().unwrap();
        let start = lock.active < limit && !self.queue.is_empty();
        if start {
            lock.active += 1;
        }
        start
    }

    // at the end of an action drain batch, decide whether to reschedule the lane or retire it.
    //
    // returns true if the lane should reschedule itself, in which case it is still counted.
    pub(crate) fn continue_or_retire(&self) -> bool {
        let mut lock = self.lockable.lock().unwrap();
        debug_assert_eq!(lock.active, 1, "action lane count out of sync (internal bug)");
        if self.queue.is_empty() {
            lock.active = 0;
            drop(lock);
            self.idle.notify_waiters();
            false
        } else {
            true
        }
    }

    // for an async lane, take the next item, or retire the lane if there are none.
    //
    // returns none if and only if the lane has been retired.
    pub(crate) fn next_or_retire(&self) -> Option<T> {
        if let Some(item) = self.queue.pop() {
            return Some(item);
        }
        let mut lock = self.lockable.lock().unwrap();
        // a producer may have pushed after the unlocked pop while seeing a full lane count.
        if let Some(item) = self.queue.pop() {
            return Some(item);
        }
        debug_assert!(lock.active > 0, "async lane count out of sync (internal bug)");
        lock.active -= 1;
        let now_idle = lock.active == 0;
        drop(lock);
        if now_idle {
            self.idle.notify_waiters();
        }
        None
    }

    // uncount a lane whose unit the scheduler dropped before it could retire on its own.
    pub(crate) fn release_lane(&self) {
        let mut lock = self.lockable.lock().unwrap();
        debug_assert!(lock.active > 0, "lane count out of sync (internal bug)");
        lock.active -= 1;
        let now_idle = lock.active == 0;
        drop(lock);
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    // number of lanes which currently exist.
    pub(crate) fn active_lanes(&self) -> usize {
        self.lockable.lock().unwrap().active
    }

    // whether no lane exists and no item is buffered.
    pub(crate) fn is_idle(&self) -> bool {
        let lock = self.lockable.lock().unwrap();
        lock.active == 0 && self.queue.is_empty()
    }

    // wait until is_idle would return true.
    pub(crate) async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    // deliver a handler fault to the fault observer, or log it if there is none.
    pub(crate) fn report(&self, fault: Fault) {
        match &self.fault_sink {
            Some(sink) => {
                if catch_unwind(AssertUnwindSafe(|| sink(fault))).is_err() {
                    error!("fault observer panicked");
                }
            }
            None => warn!(%fault, panicked = fault.is_panic(), "unobserved handler fault"),
        }
    }
}
