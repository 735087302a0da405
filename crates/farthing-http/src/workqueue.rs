use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
};

use parking_lot::{Condvar, Mutex};
use tracing::{event, Level};

/// An owned, one-shot unit of work.
pub trait WorkUnit {
    fn execute(self);
}

struct Inner<W> {
    queue: VecDeque<W>,
    running: bool,
    max_depth: usize,
    workers: usize,
}

/// Simple work queue for distributing work over multiple threads.
///
/// Capacity bounds request buildup, so a busy node surfaces backpressure
/// to callers instead of growing without limit. Items still queued when
/// the workers exit are dropped without execution.
pub struct WorkQueue<W> {
    inner: Mutex<Inner<W>>,
    cond: Condvar,
}

/// Tracks the number of running worker threads, releasing attendance on
/// every exit path.
struct Attendance<'a, W> {
    queue: &'a WorkQueue<W>,
}

impl<'a, W> Attendance<'a, W> {
    fn enter(queue: &'a WorkQueue<W>) -> Self {
        queue.inner.lock().workers += 1;
        Self { queue }
    }
}

impl<W> Drop for Attendance<'_, W> {
    fn drop(&mut self) {
        self.queue.inner.lock().workers -= 1;
        self.queue.cond.notify_all();
    }
}

impl<W> WorkQueue<W> {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                running: true,
                max_depth: max_depth.max(1),
                workers: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append a work item and wake one worker. The item comes back if
    /// the queue is at capacity or no longer running; the caller owns
    /// the rejection reply.
    pub fn enqueue(&self, item: W) -> Result<(), W> {
        {
            let mut inner = self.inner.lock();
            if !inner.running || inner.queue.len() >= inner.max_depth {
                return Err(item);
            }
            inner.queue.push_back(item);
        }
        self.cond.notify_one();
        Ok(())
    }

    /// Worker entry point: pop and execute items until interrupted.
    ///
    /// Items run outside the queue lock. A panicking item is logged and
    /// discarded; the worker keeps going.
    pub fn run(&self)
    where
        W: WorkUnit,
    {
        let _attendance = Attendance::enter(self);

        loop {
            let item = {
                let mut inner = self.inner.lock();
                while inner.running && inner.queue.is_empty() {
                    self.cond.wait(&mut inner);
                }
                if !inner.running {
                    break;
                }
                inner.queue.pop_front().expect("queue is non-empty")
            };

            if catch_unwind(AssertUnwindSafe(|| item.execute())).is_err() {
                event!(Level::WARN, "work item panicked");
            }
        }
    }

    /// Stop accepting and wake all workers. Idempotent.
    pub fn interrupt(&self) {
        self.inner.lock().running = false;
        self.cond.notify_all();
    }

    /// Block until all worker threads have left [`WorkQueue::run`].
    pub fn wait_exit(&self) {
        let mut inner = self.inner.lock();
        while inner.workers > 0 {
            self.cond.wait(&mut inner);
        }
    }

    /// Current queue length (advisory).
    pub fn depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of threads currently inside [`WorkQueue::run`].
    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers
    }
}
