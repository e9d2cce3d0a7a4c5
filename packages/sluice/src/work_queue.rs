// unbounded multi-producer multi-consumer FIFO buffer of posted items.
//
// this is a thin wrapper around a lock-free injector queue. it makes no attempt to coordinate
// with lane bookkeeping: the dispatcher is responsible for checking emptiness under its own lock
// whenever that check gates starting or stopping a lane.

use crossbeam_deque::{Injector, Steal};


pub(crate) struct WorkQueue<T>(Injector<T>);

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        WorkQueue(Injector::new())
    }

    // append to the back.
    pub(crate) fn push(&self, item: T) {
        self.0.push(item);
    }

    // take from the front, or return none if empty.
    //
    // each pushed item is returned by exactly one call.
    pub(crate) fn pop(&self) -> Option<T> {
        loop {
            match self.0.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => (),
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}
