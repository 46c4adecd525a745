// jobsentry: timer wheel

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type TimerId = u64;
type Task = Box<dyn FnMut() + Send>;

struct ScheduledTask {
    next_run: Instant,
    interval: Option<Duration>,
    id: TimerId,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.next_run == other.next_run
    }
}
impl Eq for ScheduledTask {}

// Inverted ordering turns `BinaryHeap` (a max-heap) into a min-heap keyed by
// `next_run`.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.next_run.cmp(&self.next_run)
    }
}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<ScheduledTask>>,
    tasks: Mutex<HashMap<TimerId, Task>>,
    // Ids cancelled while their task body was out of `tasks` and running on
    // a worker; consulted after the call returns so the task isn't put back.
    cancelled: Mutex<HashSet<TimerId>>,
    cv: Condvar,
    stop: Mutex<bool>,
}

/// Min-heap timer scheduler: one scheduler thread pops due tasks and hands
/// them to a small worker pool, plus a side table for O(1) logical
/// cancellation. Repeating tasks reschedule from `now`, not from the
/// previous deadline, so a stall never causes a catch-up burst.
pub struct TimerWheel {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    scheduler: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    work_tx: std::sync::mpsc::Sender<TimerId>,
}

impl TimerWheel {
    pub fn new(worker_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            tasks: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
            stop: Mutex::new(false),
        });

        let (work_tx, work_rx) = std::sync::mpsc::channel::<TimerId>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = Vec::with_capacity(worker_threads.max(1));
        for _ in 0..worker_threads.max(1) {
            let shared = Arc::clone(&shared);
            let work_rx = Arc::clone(&work_rx);
            workers.push(thread::spawn(move || loop {
                let id = {
                    let rx = work_rx.lock().expect("timer worker channel poisoned");
                    match rx.recv() {
                        Ok(id) => id,
                        Err(_) => return,
                    }
                };
                // Remove the task from the table before running it: a task
                // body may call back into `cancel` (e.g. the sampling
                // orchestrator cancelling its own timer from within a tick),
                // and `cancel` locks this same table. Holding the lock across
                // the call would self-deadlock.
                let taken = shared.tasks.lock().expect("timer task table poisoned").remove(&id);
                if let Some(mut task) = taken {
                    // Task panics are caught at this boundary and logged;
                    // the scheduler must keep running regardless.
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task()));
                    if let Err(err) = result {
                        tracing::error!(timer_id = id, ?err, "timer task panicked");
                    }
                    let was_cancelled = shared.cancelled.lock().expect("timer cancelled set poisoned").remove(&id);
                    if !was_cancelled {
                        shared.tasks.lock().expect("timer task table poisoned").insert(id, task);
                    }
                }
            }));
        }

        let scheduler = {
            let shared = Arc::clone(&shared);
            let work_tx = work_tx.clone();
            thread::spawn(move || Self::scheduler_loop(shared, work_tx))
        };

        Self {
            shared,
            next_id: AtomicU64::new(1),
            scheduler: Some(scheduler),
            workers,
            work_tx,
        }
    }

    fn scheduler_loop(shared: Arc<Shared>, work_tx: std::sync::mpsc::Sender<TimerId>) {
        loop {
            let mut heap = shared.heap.lock().expect("timer heap poisoned");
            loop {
                if *shared.stop.lock().expect("timer stop flag poisoned") {
                    return;
                }
                match heap.peek() {
                    None => {
                        let (guard, timeout) = shared
                            .cv
                            .wait_timeout(heap, Duration::from_millis(200))
                            .expect("timer heap condvar poisoned");
                        heap = guard;
                        let _ = timeout;
                        continue;
                    }
                    Some(top) => {
                        let now = Instant::now();
                        if top.next_run <= now {
                            break;
                        }
                        let wait = top.next_run - now;
                        let (guard, _) = shared
                            .cv
                            .wait_timeout(heap, wait)
                            .expect("timer heap condvar poisoned");
                        heap = guard;
                    }
                }
            }

            let due = heap.pop().expect("heap non-empty after peek");
            let id = due.id;
            let still_live = shared.tasks.lock().expect("timer task table poisoned").contains_key(&id);
            if still_live {
                let _ = work_tx.send(id);
                if let Some(interval) = due.interval {
                    heap.push(ScheduledTask {
                        next_run: Instant::now() + interval,
                        interval: Some(interval),
                        id,
                    });
                }
            }
            drop(heap);
        }
    }

    fn schedule(&self, delay: Duration, interval: Option<Duration>, task: Task) -> TimerId {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.shared.tasks.lock().expect("timer task table poisoned").insert(id, task);
        self.shared
            .heap
            .lock()
            .expect("timer heap poisoned")
            .push(ScheduledTask {
                next_run: Instant::now() + delay,
                interval,
                id,
            });
        self.shared.cv.notify_all();
        id
    }

    pub fn schedule_once<F: FnMut() + Send + 'static>(&self, delay: Duration, task: F) -> TimerId {
        self.schedule(delay, None, Box::new(task))
    }

    pub fn schedule_repeating<F: FnMut() + Send + 'static>(&self, interval: Duration, task: F) -> TimerId {
        self.schedule(interval, Some(interval), Box::new(task))
    }

    /// Logical cancellation: removes the task body so a concurrently-popped
    /// id becomes a no-op. Returns `false` if `id` was already gone.
    ///
    /// If `id`'s task body is presently running on a worker (it is not in
    /// `tasks` while executing — see the worker loop), the id is instead
    /// recorded in `cancelled` so the worker drops it on return instead of
    /// rescheduling it.
    pub fn cancel(&self, id: TimerId) -> bool {
        if self
            .shared
            .tasks
            .lock()
            .expect("timer task table poisoned")
            .remove(&id)
            .is_some()
        {
            return true;
        }
        self.shared
            .cancelled
            .lock()
            .expect("timer cancelled set poisoned")
            .insert(id)
    }

    pub fn shutdown(&mut self) {
        *self.shared.stop.lock().expect("timer stop flag poisoned") = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
        // Dropping the sender side wakes every worker's blocking `recv`.
        drop(std::mem::replace(&mut self.work_tx, std::sync::mpsc::channel().0));
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            self.shutdown();
        }
    }
}
