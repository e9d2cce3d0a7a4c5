// the two lane protocols.

use super::core::{ActionFn, Handler, Shared};
use crate::{
    error::{Fault, TaskError},
    scheduler::Handoff,
    task::run_factory,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread,
};
use smallvec::SmallVec;


// hand a lane which has already been counted to the scheduler.
//
// if the scheduler drops the unit while it is still being handed over, the lane is uncounted and
// claimed once more. if that is refused too, the items stay queued for the next post.
pub(crate) fn start_lane<T: Send + 'static>(shared: &Arc<Shared<T>>) {
    for attempt in 0..2 {
        if attempt > 0 && !shared.claim_lane() {
            return;
        }
        let handoff = Handoff::new();
        let lane = Lane {
            shared: Arc::clone(shared),
            handoff: handoff.clone(),
            armed: true,
        };
        match &shared.handler {
            Handler::Action(_) => shared.scheduler.spawn_blocking(Box::new(move || drain(lane))),
            Handler::Async(_) => shared.scheduler.spawn(Box::pin(run_lane(lane))),
        }
        if handoff.accept() {
            return;
        }
        warn!(attempt, "scheduler dropped dispatcher lane while it was being spawned");
    }
}


// ==== lane guard ====


// ownership of one counted lane, held by the unit running it.
//
// a lane normally retires through the shared state's own bookkeeping and then disarms its guard.
// if the unit is dropped while the guard is still armed, the lane is uncounted. if the scheduler
// had already accepted the unit, a replacement lane is started when items remain.
struct Lane<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    handoff: Handoff,
    armed: bool,
}

impl<T: Send + 'static> Lane<T> {
    // give up the guard once the lane's count has been retired or transferred.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Send + 'static> Drop for Lane<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let refused = self.handoff.refuse();
        self.shared.release_lane();
        if refused {
            // start_lane sees this and retries itself.
            return;
        }
        debug!("scheduler dropped running dispatcher lane");
        if self.shared.claim_lane() {
            start_lane(&self.shared);
        }
    }
}


// ==== action shape ====


// one drain unit. handles at most max_items_per_task items, then reschedules or retires.
//
// a fault ends the batch early but otherwise proceeds exactly like a batch that ran out of items,
// so that the lane is never left counted without a unit to run it.
fn drain<T: Send + 'static>(lane: Lane<T>) {
    let shared = Arc::clone(&lane.shared);
    let Handler::Action(handler) = &shared.handler else {
        unreachable!("drain scheduled for async handler (internal bug)");
    };
    if shared.config.max_parallelism > 1 {
        drain_fan_out(&shared, handler);
    } else {
        drain_sequential(&shared, handler);
    }

    let reschedule = shared.continue_or_retire();
    lane.disarm();
    if reschedule {
        trace!("drain batch exhausted with items remaining, yielding to scheduler");
        start_lane(&shared);
    } else {
        trace!("action lane retired");
    }
}

// take items one at a time, so that a fault leaves every untaken item in the queue.
fn drain_sequential<T>(shared: &Shared<T>, handler: &ActionFn<T>) {
    for _ in 0..shared.config.max_items_per_task {
        let Some(item) = shared.queue.pop() else { break };
        if let Err(fault) = call_action(handler, item) {
            shared.report(fault);
            break;
        }
    }
}

// take a whole batch, split it into up to max_parallelism chunks, and run the chunks on scoped
// threads. the first chunk runs on the current thread.
fn drain_fan_out<T: Send>(shared: &Shared<T>, handler: &ActionFn<T>) {
    let mut batch = SmallVec::<[T; 16]>::new();
    while batch.len() < shared.config.max_items_per_task {
        match shared.queue.pop() {
            Some(item) => batch.push(item),
            None => break,
        }
    }
    if batch.is_empty() {
        return;
    }

    let width = shared.config.max_parallelism.min(batch.len());
    let chunk_len = batch.len().div_ceil(width);
    let mut chunks = Vec::with_capacity(width);
    let mut items = batch.into_iter();
    loop {
        let chunk = items.by_ref().take(chunk_len).collect::<Vec<T>>();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }
    let mut chunks = chunks.into_iter();
    let first = chunks.next().unwrap_or_default();

    // each spawned chunk sits in a slot, so that a chunk whose thread cannot be spawned can still
    // be taken back and run here.
    let slots = chunks.map(|chunk| Mutex::new(Some(chunk))).collect::<Vec<_>>();
    thread::scope(|scope| {
        for slot in &slots {
            let spawned = thread::Builder::new()
                .name("sluice-fan-out".into())
                .spawn_scoped(scope, move || run_slot(shared, handler, slot));
            if let Err(e) = spawned {
                warn!(%e, "failed to spawn fan-out thread, running chunk inline");
                run_slot(shared, handler, slot);
            }
        }
        run_chunk(shared, handler, first);
    });
}

fn run_slot<T>(shared: &Shared<T>, handler: &ActionFn<T>, slot: &Mutex<Option<Vec<T>>>) {
    let chunk = slot.lock().unwrap().take();
    if let Some(chunk) = chunk {
        run_chunk(shared, handler, chunk);
    }
}

// run the handler over a chunk. on fault, the rest of the chunk goes back on the queue.
fn run_chunk<T>(shared: &Shared<T>, handler: &ActionFn<T>, chunk: Vec<T>) {
    let mut items = chunk.into_iter();
    while let Some(item) = items.next() {
        if let Err(fault) = call_action(handler, item) {
            shared.report(fault);
            for item in items {
                shared.queue.push(item);
            }
            return;
        }
    }
}

fn call_action<T>(handler: &ActionFn<T>, item: T) -> Result<(), Fault> {
    match catch_unwind(AssertUnwindSafe(|| handler(item))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Fault::new(e)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}


// ==== async shape ====


// one async lane. handles items one at a time until the queue is empty, only suspending while
// awaiting the handler's future.
async fn run_lane<T: Send + 'static>(lane: Lane<T>) {
    let shared = Arc::clone(&lane.shared);
    let Handler::Async(handler) = &shared.handler else {
        unreachable!("async lane started for action handler (internal bug)");
    };
    trace!("async lane started");
    while let Some(item) = shared.next_or_retire() {
        if let Err(TaskError::Faulted(fault)) = run_factory(|| handler(item)).await {
            shared.report(fault);
        }
    }
    lane.disarm();
    trace!("async lane retired");
}
