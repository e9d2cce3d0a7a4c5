//! Strict one-at-a-time FIFO execution.

use crate::{
    error::{NoRuntimeError, TaskError},
    scheduler::{BoxUnit, Handoff, Scheduler, TokioScheduler},
    task::{self, run_factory, Task},
};
use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
};


// pending entry. calling it produces the unit, already wired to complete its task.
type Entry = Box<dyn FnOnce() -> BoxUnit + Send + 'static>;


/// Queue which runs submitted units one at a time, in submission order
///
/// Units are started on the queue's [`Scheduler`] in exactly the order they were enqueued, and a
/// unit is only started once the previous one has finished, whether it succeeded, faulted, or was
/// cancelled. Enqueueing never waits for running units.
///
/// Cloning a serial queue produces another handle to the same queue.
#[derive(Clone)]
pub struct SerialQueue(Arc<Shared>);

struct Shared {
    scheduler: Arc<dyn Scheduler>,
    lockable: Mutex<Lockable>,
}

struct Lockable {
    // entries not yet started, in submission order.
    pending: VecDeque<Entry>,
    // whether a unit has been started and has not yet finished.
    //
    // - if false, pending is empty.
    in_flight: bool,
}

impl SerialQueue {
    /// Construct a serial queue which runs units on the given scheduler
    pub fn new<S: Scheduler>(scheduler: S) -> Self {
        debug!("serial queue constructed");
        SerialQueue(Arc::new(Shared {
            scheduler: Arc::new(scheduler),
            lockable: Mutex::new(Lockable {
                pending: VecDeque::new(),
                in_flight: false,
            }),
        }))
    }

    /// Construct a serial queue which runs units on the current tokio runtime
    pub fn current() -> Result<Self, NoRuntimeError> {
        TokioScheduler::current().map(Self::new)
    }

    /// Enqueue a unit
    ///
    /// The returned task resolves with the unit's outcome once it has run.
    pub fn enqueue<T, E, F>(&self, unit: F) -> Task<T>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<TaskError> + 'static,
    {
        self.enqueue_with(move || unit)
    }

    /// Enqueue a unit which is not constructed until its turn comes
    ///
    /// `factory` is called right before the unit would start. A panic in `factory` counts as a
    /// fault of the unit.
    pub fn enqueue_with<T, E, F, G>(&self, factory: G) -> Task<T>
    where
        G: FnOnce() -> F + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<TaskError> + 'static,
    {
        let (completer, task) = task::pair();
        let entry: Entry = Box::new(move || -> BoxUnit {
            Box::pin(async move {
                completer.complete(run_factory(factory).await);
            })
        });

        let mut lock = self.0.lockable.lock().unwrap();
        if lock.in_flight {
            lock.pending.push_back(entry);
        } else {
            lock.in_flight = true;
            drop(lock);
            start(&self.0, entry);
        }
        task
    }

    /// Get a task which resolves once every unit enqueued so far has finished
    ///
    /// Units enqueued after this call do not hold it up. Resolves successfully even if some of
    /// those units faulted or were cancelled.
    pub fn completed(&self) -> Task<()> {
        self.enqueue(async { Ok::<(), TaskError>(()) })
    }

    /// Number of units enqueued but not yet started
    pub fn pending(&self) -> usize {
        self.0.lockable.lock().unwrap().pending.len()
    }

    /// Whether no unit is running or waiting
    pub fn is_idle(&self) -> bool {
        !self.0.lockable.lock().unwrap().in_flight
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lock = self.0.lockable.lock().unwrap();
        f.debug_struct("SerialQueue")
            .field("in_flight", &lock.in_flight)
            .field("pending", &lock.pending.len())
            .finish()
    }
}

impl Shared {
    // the unit in flight has finished. take the next entry, or mark the queue idle.
    fn next_entry(&self) -> Option<Entry> {
        let mut lock = self.lockable.lock().unwrap();
        debug_assert!(lock.in_flight, "serial queue advanced while idle (internal bug)");
        let next = lock.pending.pop_front();
        if next.is_none() {
            lock.in_flight = false;
            trace!("serial queue drained");
        }
        next
    }
}

// hand an entry, which has already been marked in flight, to the scheduler.
//
// an entry the scheduler drops during the spawn call counts as finished, and the next one is
// tried right here rather than from its drop guard.
fn start(shared: &Arc<Shared>, entry: Entry) {
    let mut next = Some(entry);
    while let Some(entry) = next.take() {
        trace!("starting serial unit");
        let handoff = Handoff::new();
        let advance = Advance {
            shared: Some(Arc::clone(shared)),
            handoff: handoff.clone(),
        };
        shared.scheduler.spawn(Box::pin(async move {
            entry().await;
            advance.finish();
        }));
        if !handoff.accept() {
            warn!("scheduler dropped serial unit while it was being spawned");
            next = shared.next_entry();
        }
    }
}

// moves the queue on to the next entry when a unit finishes. if the scheduler drops the unit
// without running it to completion, that counts as finishing.
struct Advance {
    shared: Option<Arc<Shared>>,
    handoff: Handoff,
}

impl Advance {
    fn finish(mut self) {
        self.advance();
    }

    fn advance(&mut self) {
        let Some(shared) = self.shared.take() else { return };
        if let Some(next) = shared.next_entry() {
            start(&shared, next);
        }
    }
}

impl Drop for Advance {
    fn drop(&mut self) {
        if self.shared.is_some() && self.handoff.refuse() {
            // still inside the spawn call, which moves the queue on itself.
            self.shared = None;
            return;
        }
        self.advance();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{DropFirst, DropLater};
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        sync::atomic::{
            AtomicBool, AtomicUsize,
            Ordering::SeqCst,
        },
        time::{Duration, Instant},
    };
    use tokio::{sync::oneshot, time::{sleep, timeout}};

    fn new_rng() -> impl Rng {
        Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes())
    }

    // a task resolves just before its unit hands the queue on, so idleness lags slightly.
    async fn settle(queue: &SerialQueue) {
        timeout(Duration::from_secs(1), async {
            while !queue.is_idle() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("serial queue did not go idle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn units_start_in_order_without_overlap() {
        let queue = SerialQueue::current().unwrap();
        let seq = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(false));
        let windows = Arc::new(Mutex::new(Vec::new()));
        let mut rng = new_rng();

        let tasks = (0..5)
            .map(|i| {
                let seq = Arc::clone(&seq);
                let active = Arc::clone(&active);
                let windows = Arc::clone(&windows);
                let nap = Duration::from_millis(rng.gen_range(1..20));
                queue.enqueue(async move {
                    let started = Instant::now();
                    assert!(!active.swap(true, SeqCst), "units overlapped");
                    let n = seq.fetch_add(1, SeqCst);
                    sleep(nap).await;
                    active.store(false, SeqCst);
                    windows.lock().unwrap().push((i, n, started, Instant::now()));
                    Ok::<_, anyhow::Error>(n)
                })
            })
            .collect::<Vec<_>>();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), i);
        }

        let windows = windows.lock().unwrap();
        assert_eq!(windows.len(), 5);
        for (idx, &(i, n, _, _)) in windows.iter().enumerate() {
            assert_eq!(i, idx);
            assert_eq!(n, idx);
        }
        for pair in windows.windows(2) {
            assert!(pair[0].3 <= pair[1].2, "unit {} started before {} ended", pair[1].0, pair[0].0);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_waits_for_earlier_units_only() {
        let queue = SerialQueue::current().unwrap();
        let a_done = Arc::new(AtomicBool::new(false));

        let a = {
            let a_done = Arc::clone(&a_done);
            queue.enqueue(async move {
                sleep(Duration::from_millis(50)).await;
                a_done.store(true, SeqCst);
                Ok::<_, anyhow::Error>(())
            })
        };
        let barrier = queue.completed();

        let (release_b, b_released) = oneshot::channel::<()>();
        let b = queue.enqueue(async move {
            let _ = b_released.await;
            Ok::<_, anyhow::Error>(())
        });

        timeout(Duration::from_secs(5), barrier).await.unwrap().unwrap();
        assert!(a_done.load(SeqCst));
        assert!(a.is_completed());
        assert!(!b.is_finished());

        release_b.send(()).unwrap();
        timeout(Duration::from_secs(5), b).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn faults_and_panics_do_not_stall_queue() {
        let queue = SerialQueue::current().unwrap();
        let failed = queue.enqueue(async { Err::<(), _>(anyhow::anyhow!("first fails")) });
        let panicked = queue.enqueue(async {
            if true {
                panic!("second panics");
            }
            Ok::<(), anyhow::Error>(())
        });
        let cancelled = queue.enqueue(async { Err::<(), _>(TaskError::Canceled) });
        let ok = queue.enqueue(async { Ok::<_, anyhow::Error>("fourth") });

        assert!(failed.await.unwrap_err().is_faulted());
        assert!(panicked.await.unwrap_err().fault().unwrap().is_panic());
        assert!(cancelled.await.unwrap_err().is_canceled());
        assert_eq!(ok.await.unwrap(), "fourth");
        timeout(Duration::from_secs(1), queue.completed()).await.unwrap().unwrap();
        settle(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn factory_runs_only_at_its_turn() {
        let queue = SerialQueue::current().unwrap();
        let constructed = Arc::new(AtomicBool::new(false));
        let (release, released) = oneshot::channel::<()>();

        let blocker = queue.enqueue(async move {
            let _ = released.await;
            Ok::<_, anyhow::Error>(())
        });
        let lazy = {
            let constructed = Arc::clone(&constructed);
            queue.enqueue_with(move || {
                constructed.store(true, SeqCst);
                async { Ok::<_, anyhow::Error>(()) }
            })
        };

        sleep(Duration::from_millis(20)).await;
        assert!(!constructed.load(SeqCst));
        assert_eq!(queue.pending(), 1);

        release.send(()).unwrap();
        blocker.await.unwrap();
        lazy.await.unwrap();
        assert!(constructed.load(SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_never_overlap() {
        let queue = SerialQueue::current().unwrap();
        let active = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));

        let producers = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let active = Arc::clone(&active);
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let active = Arc::clone(&active);
                        let count = Arc::clone(&count);
                        drop(queue.enqueue(async move {
                            assert!(!active.swap(true, SeqCst), "units overlapped");
                            tokio::task::yield_now().await;
                            count.fetch_add(1, SeqCst);
                            active.store(false, SeqCst);
                            Ok::<_, anyhow::Error>(())
                        }));
                    }
                })
            })
            .collect::<Vec<_>>();
        for join in producers {
            join.join().unwrap();
        }

        timeout(Duration::from_secs(10), queue.completed()).await.unwrap().unwrap();
        assert_eq!(count.load(SeqCst), 200);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn units_dropped_while_spawning_are_cancelled_in_turn() {
        let scheduler = DropFirst::current(0);
        let queue = SerialQueue::new(Arc::clone(&scheduler));
        let (release, released) = oneshot::channel::<()>();

        let blocker = queue.enqueue(async move {
            let _ = released.await;
            Ok::<_, anyhow::Error>(())
        });
        let followers = (0..4)
            .map(|i| queue.enqueue(async move { Ok::<_, anyhow::Error>(i) }))
            .collect::<Vec<_>>();
        assert_eq!(queue.pending(), 4);

        // every follower but the last is refused as it comes up.
        scheduler.remaining.store(3, SeqCst);
        release.send(()).unwrap();
        blocker.await.unwrap();

        let mut outcomes = Vec::new();
        for task in followers {
            outcomes.push(timeout(Duration::from_secs(1), task).await.unwrap());
        }
        assert!(outcomes[..3].iter().all(|r| r.as_ref().unwrap_err().is_canceled()));
        assert_eq!(*outcomes[3].as_ref().unwrap(), 3);
        assert_eq!(scheduler.dropped.load(SeqCst), 3);
        timeout(Duration::from_secs(1), queue.completed()).await.unwrap().unwrap();
        settle(&queue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unit_dropped_after_spawning_still_advances_queue() {
        let scheduler = DropLater::current(1);
        let queue = SerialQueue::new(Arc::clone(&scheduler));
        let first = queue.enqueue(async { Ok::<_, anyhow::Error>(1) });
        let second = queue.enqueue(async { Ok::<_, anyhow::Error>(2) });

        let err = timeout(Duration::from_secs(1), first).await.unwrap().unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(timeout(Duration::from_secs(1), second).await.unwrap().unwrap(), 2);
        settle(&queue).await;
    }
}
