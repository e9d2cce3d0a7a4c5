// implementation of the dispatcher.
//
// the architecture is as such:
//
// dispatcher handles wrap around Arc<shared state>
//                                    |
//          /-------------------------/
//          v
//       shared state
//          |
//          |------ it contains a work_queue::WorkQueue<T>, a lock-free FIFO which producers push
//          |       into without taking any lock.
//          |
//          |------ it contains a mutex around the lane count. every decision to start a lane and
//          |       every decision to retire a lane is made while holding this mutex, and re-checks
//          |       queue emptiness while holding it. a producer always pushes before it takes the
//          |       mutex, and a lane always checks emptiness after it takes the mutex, so either
//          |       the lane sees the item or the producer sees the lane gone.
//          |
//          |------ every counted lane is owned by a guard inside the unit that runs it. if the
//          |       scheduler drops the unit before the lane retires, the guard uncounts the lane and
//          |       starts a replacement if items remain.
//          |
//          \------ it contains the handler, which comes in one of two shapes:
//
//                  - action: a synchronous fn. at most one lane exists, which is a blocking unit
//                    that drains up to max_items_per_task items, then either reschedules itself or
//                    retires. if max_parallelism > 1, each batch is fanned out across that many
//                    scoped threads, which the drain unit joins before deciding anything.
//                  - async: a fn returning a future. up to max_parallelism lanes exist, each of
//                    which is a single async unit that handles one item at a time, suspending only
//                    while awaiting the handler's future.
//
// the organization of these modules is as such:
//
//      core: shared state and the locked lane bookkeeping. user code never runs while the lock
//       ^    is held.
//       |
//      lanes: the two lane protocols, which run on the scheduler.
//       ^
//       |
//      api: the exposed handle and builder.

pub(crate) mod api;

mod core;
mod lanes;
