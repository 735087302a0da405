//! Delayed-task scheduler.
//!
//! Node subsystems hand the scheduler a callback and a deadline; one or
//! more service threads drain the queue in deadline order. Tasks may
//! schedule further tasks from inside their own callback, including
//! rescheduling themselves, which is how periodic tasks are built.
//!
//! The queue mutex is released while a task runs, so a slow callback
//! never blocks scheduling, only execution throughput.

use std::{
    collections::BTreeMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{event, Level};

type Task = Box<dyn FnOnce() + Send>;

/// Advisory snapshot of the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub count: usize,
    pub earliest: Option<Instant>,
    pub latest: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    /// Tasks keyed by deadline. The sequence number keeps keys unique;
    /// ordering among equal deadlines is not meaningful.
    tasks: BTreeMap<(Instant, u64), Task>,
    next_seq: u64,
    stop_requested: bool,
    stop_when_empty: bool,
    service_threads: usize,
}

impl Inner {
    fn should_stop(&self) -> bool {
        self.stop_requested || (self.stop_when_empty && self.tasks.is_empty())
    }
}

/// Time-ordered task queue drained by [`Scheduler::service_queue`].
///
/// A task scheduled for deadline `t` is never executed before `t`, and is
/// executed at most once.
#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<Inner>,
    new_task: Condvar,
}

/// Releases service-loop attendance on every exit path, including a
/// panicking task unwinding through `service_queue`.
struct Attendance<'a> {
    sched: &'a Scheduler,
}

impl Drop for Attendance<'_> {
    fn drop(&mut self) {
        let mut inner = self.sched.inner.lock();
        inner.service_threads -= 1;
        self.sched.new_task.notify_all();
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task to run at or after `at`, waking one service thread.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static, at: Instant) {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.tasks.insert((at, seq), Box::new(f));
        }
        self.new_task.notify_one();
    }

    /// Insert a task to run `delay` from now.
    pub fn schedule_in(&self, f: impl FnOnce() + Send + 'static, delay: Duration) {
        self.schedule(f, Instant::now() + delay);
    }

    /// Run `f` every `period`, measured from the end of one call to the
    /// start of the next. There is no drift compensation: a call that
    /// takes `d` makes the observed start-to-start gap `period + d`.
    pub fn schedule_every(self: &Arc<Self>, f: impl FnMut() + Send + 'static, period: Duration) {
        repeat(Arc::clone(self), Box::new(f), period);
    }

    /// Service loop. Runs until [`Scheduler::stop`] takes effect.
    ///
    /// Every wake re-reads the front of the queue: a newly inserted task
    /// may have shortened the deadline, and another service thread may
    /// have consumed the task this one was waiting on.
    pub fn service_queue(&self) {
        {
            let mut inner = self.inner.lock();
            inner.service_threads += 1;
        }
        let _attendance = Attendance { sched: self };

        event!(Level::DEBUG, "entering scheduler service loop");

        let mut inner = self.inner.lock();
        loop {
            if inner.should_stop() {
                break;
            }

            if inner.tasks.is_empty() {
                self.new_task.wait(&mut inner);
                continue;
            }

            let (&(deadline, seq), _) = inner.tasks.iter().next().expect("queue is non-empty");
            if deadline > Instant::now() {
                self.new_task.wait_until(&mut inner, deadline);
                continue;
            }

            let task = inner
                .tasks
                .remove(&(deadline, seq))
                .expect("front task vanished under lock");

            // Release the lock across the call so the task can schedule
            // more work without deadlocking.
            MutexGuard::unlocked(&mut inner, task);
        }

        event!(Level::DEBUG, "exiting scheduler service loop");
    }

    /// Spawn a named service thread for this scheduler.
    pub fn spawn_service_thread(self: &Arc<Self>) -> JoinHandle<()> {
        let sched = Arc::clone(self);
        thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || sched.service_queue())
            .expect("failed to spawn scheduler thread")
    }

    /// Stop servicing. With `drain` set, service threads exit once the
    /// queue empties; otherwise they exit as soon as the task they are
    /// currently running (if any) returns. Pending tasks are kept but
    /// never executed.
    pub fn stop(&self, drain: bool) {
        {
            let mut inner = self.inner.lock();
            if drain {
                inner.stop_when_empty = true;
            } else {
                inner.stop_requested = true;
            }
        }
        self.new_task.notify_all();
    }

    /// Advisory queue snapshot.
    pub fn queue_info(&self) -> QueueInfo {
        let inner = self.inner.lock();
        QueueInfo {
            count: inner.tasks.len(),
            earliest: inner.tasks.keys().next().map(|&(t, _)| t),
            latest: inner.tasks.keys().next_back().map(|&(t, _)| t),
        }
    }

    /// Number of threads currently inside [`Scheduler::service_queue`].
    pub fn service_thread_count(&self) -> usize {
        self.inner.lock().service_threads
    }
}

fn repeat(sched: Arc<Scheduler>, mut f: Box<dyn FnMut() + Send>, period: Duration) {
    let next = Arc::clone(&sched);
    sched.schedule_in(
        move || {
            f();
            repeat(next, f, period);
        },
        period,
    );
}
