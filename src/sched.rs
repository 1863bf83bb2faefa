use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::Clock;

struct Task {
    due: Instant,
    seq: u64,
    run: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // reversed so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    queue: Mutex<BinaryHeap<Task>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Future-dated work items (delayed slot returns) on a single thread, so
/// nothing open-ended lingers past shutdown.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(BinaryHeap::new()),
                wakeup: Condvar::new(),
                shutdown: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                clock,
            }),
        })
    }

    pub fn schedule_in<F>(&self, delay: Duration, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task {
            due: self.inner.clock.now() + delay,
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed),
            run: Box::new(run),
        };
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(task);
        self.inner.wakeup.notify_one();
    }

    /// Run every task whose deadline has passed; returns how many ran.
    /// Exposed so tests can drive the scheduler with a manual clock.
    pub fn run_due(&self) -> usize {
        let now = self.inner.clock.now();
        let mut ran = 0;
        loop {
            let task = {
                let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                match queue.peek() {
                    Some(task) if task.due <= now => queue.pop(),
                    _ => None,
                }
            };
            match task {
                Some(task) => {
                    (task.run)();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stop the worker thread. Pending tasks are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::SeqCst);
        self.inner.wakeup.notify_all();
    }

    pub fn spawn(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let scheduler = Scheduler {
            inner: Arc::clone(&self.inner),
        };
        thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                debug!("scheduler thread running");
                loop {
                    if inner.shutdown.load(AtomicOrdering::SeqCst) {
                        return;
                    }
                    scheduler.run_due();

                    let queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                    let wait = queue
                        .peek()
                        .map(|task| {
                            task.due
                                .saturating_duration_since(inner.clock.now())
                                .max(Duration::from_millis(10))
                        })
                        .unwrap_or(Duration::from_millis(200));
                    let _unused = inner
                        .wakeup
                        .wait_timeout(queue, wait)
                        .unwrap_or_else(|e| e.into_inner());
                }
            })
            .expect("failed to spawn scheduler thread")
    }
}
