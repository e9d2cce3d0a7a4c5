// exposed API of dispatchers

use super::{
    core::{Config, FaultSink, Handler, HandlerFut, Shared},
    lanes::start_lane,
};
use crate::{
    error::{ConstructionError, Fault},
    scheduler::{Scheduler, TokioScheduler},
};
use std::{future::Future, sync::Arc};


/// Default value of [`DispatcherBuilder::max_items_per_task`]
pub const DEFAULT_MAX_ITEMS_PER_TASK: usize = 64;


/// Bounded-concurrency dispatcher of posted work items to a handler
///
/// A dispatcher owns a FIFO queue of posted items and a handler fixed at construction. Posting is
/// thread-safe and never blocks on the handler. Items are handled by _lanes_: sequential lines of
/// processing which run on the dispatcher's [`Scheduler`]. Every posted item is handled exactly
/// once, and no posted item is ever left buffered with no lane to handle it.
///
/// There are two handler shapes:
///
/// - **Action** ([`DispatcherBuilder::build_action`]): a synchronous fn. At most one lane exists.
///   It drains up to `max_items_per_task` items per scheduled unit, then yields back to the
///   scheduler if more remain. With `max_parallelism = 1`, items are handled in posting order.
///   With `max_parallelism = k > 1`, each batch is fanned out over up to `k` threads.
/// - **Async** ([`DispatcherBuilder::build_async`]): a fn returning a future. Up to
///   `max_parallelism` lanes exist, each with at most one handler future outstanding, so no more
///   than `max_parallelism` items are in flight at once. Across lanes, no order is guaranteed.
///
/// Handler faults, meaning returned errors or panics, are delivered to the fault observer set with
/// [`DispatcherBuilder::on_fault`], or logged if there is none. A faulted action batch ends early;
/// items it did not get to stay queued for the next batch. The faulted item is not retried.
///
/// Cloning a dispatcher produces another handle to the same queue and lanes.
pub struct Dispatcher<T>(Arc<Shared<T>>);

impl<T: Send + 'static> Dispatcher<T> {
    /// Shorthand for building an action dispatcher on the current tokio runtime
    pub fn action<H>(
        handler: H,
        max_parallelism: usize,
        max_items_per_task: usize,
    ) -> Result<Self, ConstructionError>
    where
        H: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        DispatcherBuilder::new()
            .max_parallelism(max_parallelism)
            .max_items_per_task(max_items_per_task)
            .build_action(handler)
    }

    /// Shorthand for building an async dispatcher on the current tokio runtime
    pub fn with_async<H, F>(handler: H, max_parallelism: usize) -> Result<Self, ConstructionError>
    where
        H: Fn(T) -> F + Send + Sync + 'static,
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        DispatcherBuilder::new()
            .max_parallelism(max_parallelism)
            .build_async(handler)
    }

    /// Post an item to be handled
    ///
    /// May be called concurrently from any number of threads. Never blocks on the handler and
    /// never fails; handler faults surface through the fault observer instead.
    pub fn post(&self, item: T) {
        self.0.queue.push(item);
        if self.0.claim_lane() {
            trace!("starting lane");
            start_lane(&self.0);
        }
    }

    /// Wait until the queue is empty and no lane is active
    ///
    /// Items posted concurrently with this call may or may not be covered by it.
    pub async fn idle(&self) {
        self.0.idle().await
    }

    /// Whether the queue is empty and no lane is active
    pub fn is_idle(&self) -> bool {
        self.0.is_idle()
    }

    /// Number of lanes which currently exist
    pub fn active_lanes(&self) -> usize {
        self.0.active_lanes()
    }

    /// Number of items posted but not yet taken by a lane
    pub fn pending(&self) -> usize {
        self.0.queue.len()
    }

    /// The configured maximum degree of parallelism
    pub fn max_parallelism(&self) -> usize {
        self.0.config.max_parallelism
    }
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Dispatcher(Arc::clone(&self.0))
    }
}

impl<T> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match &self.0.handler {
            Handler::Action(_) => "action",
            Handler::Async(_) => "async",
        };
        f.debug_struct("Dispatcher")
            .field("shape", &shape)
            .field("max_parallelism", &self.0.config.max_parallelism)
            .field("max_items_per_task", &self.0.config.max_items_per_task)
            .field("active_lanes", &self.0.active_lanes())
            .field("pending", &self.0.queue.len())
            .finish()
    }
}


/// Configuration for a [`Dispatcher`]
///
/// Values are validated when the dispatcher is built. An invalid configuration produces a
/// [`ConstructionError`] and no dispatcher.
#[must_use]
pub struct DispatcherBuilder {
    max_parallelism: usize,
    max_items_per_task: usize,
    scheduler: Option<Arc<dyn Scheduler>>,
    on_fault: Option<FaultSink>,
}

impl DispatcherBuilder {
    /// Construct with defaults: parallelism 1, [`DEFAULT_MAX_ITEMS_PER_TASK`], the current tokio
    /// runtime, and faults logged
    pub fn new() -> Self {
        DispatcherBuilder {
            max_parallelism: 1,
            max_items_per_task: DEFAULT_MAX_ITEMS_PER_TASK,
            scheduler: None,
            on_fault: None,
        }
    }

    /// Maximum number of items handled concurrently
    ///
    /// Must be at least 1.
    pub fn max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Maximum number of items an action lane handles before yielding back to the scheduler
    ///
    /// Must be at least 1. Validated but otherwise unused for async dispatchers.
    pub fn max_items_per_task(mut self, max_items_per_task: usize) -> Self {
        self.max_items_per_task = max_items_per_task;
        self
    }

    /// Run lanes on the given scheduler instead of the current tokio runtime
    ///
    /// If the scheduler drops a lane's unit without running it to the end, the lane is released
    /// and, while items remain queued, started again.
    pub fn scheduler<S: Scheduler>(mut self, scheduler: S) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Observe handler faults
    ///
    /// Called from whichever lane observed the fault. Panics in the observer are caught and
    /// logged.
    pub fn on_fault<F>(mut self, on_fault: F) -> Self
    where
        F: Fn(Fault) + Send + Sync + 'static,
    {
        self.on_fault = Some(Arc::new(on_fault));
        self
    }

    /// Build a dispatcher with a synchronous handler
    pub fn build_action<T, H>(self, handler: H) -> Result<Dispatcher<T>, ConstructionError>
    where
        T: Send + 'static,
        H: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.build(Handler::Action(Box::new(handler)))
    }

    /// Build a dispatcher with a future-returning handler
    pub fn build_async<T, H, F>(self, handler: H) -> Result<Dispatcher<T>, ConstructionError>
    where
        T: Send + 'static,
        H: Fn(T) -> F + Send + Sync + 'static,
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.build(Handler::Async(Box::new(move |item: T| -> HandlerFut { Box::pin(handler(item)) })))
    }

    fn build<T>(self, handler: Handler<T>) -> Result<Dispatcher<T>, ConstructionError> {
        if self.max_parallelism == 0 {
            return Err(ConstructionError::ZeroParallelism);
        }
        if self.max_items_per_task == 0 {
            return Err(ConstructionError::ZeroItemsPerTask);
        }
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let config = Config {
            max_parallelism: self.max_parallelism,
            max_items_per_task: self.max_items_per_task,
        };
        debug!(?config, "dispatcher constructed");
        Ok(Dispatcher(Arc::new(Shared::new(handler, config, scheduler, self.on_fault))))
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}


// ==== tests ====
