use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context as _, Error};
use mio::Waker;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::LoopCx;

/// A one-shot callback executed on the event-loop thread.
pub type LoopCallback = Box<dyn FnOnce(&mut LoopCx<'_>) + Send>;

pub(crate) enum Pending {
    Now(LoopCallback),
    At(Instant, LoopCallback),
}

pub(crate) struct Shared {
    pub(crate) posted: Mutex<Vec<Pending>>,
    pub(crate) waker: Waker,
    pub(crate) exit: AtomicBool,
    pub(crate) brk: AtomicBool,
    pub(crate) exited: Mutex<bool>,
    pub(crate) exited_cond: Condvar,
}

/// Cross-thread handle to a running [`crate::EventLoop`].
///
/// Worker threads use this to hand the loop thread one-shot callbacks,
/// which is the only way to touch loop-owned state (such as per-request
/// socket writes) from outside the loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<Shared>,
}

impl LoopHandle {
    /// Queue `f` to run on the loop thread and wake the loop.
    pub fn post(&self, f: impl FnOnce(&mut LoopCx<'_>) + Send + 'static) -> Result<(), PostError> {
        self.push(Pending::Now(Box::new(f)))
    }

    /// Queue `f` to run on the loop thread at or after `delay` from now.
    pub fn post_after(
        &self,
        delay: Duration,
        f: impl FnOnce(&mut LoopCx<'_>) + Send + 'static,
    ) -> Result<(), PostError> {
        self.push(Pending::At(Instant::now() + delay, Box::new(f)))
    }

    fn push(&self, pending: Pending) -> Result<(), PostError> {
        if *self.shared.exited.lock() {
            return Err(anyhow!("event loop has exited").into());
        }

        self.shared.posted.lock().push(pending);
        self.shared
            .waker
            .wake()
            .context("failed to wake event loop")?;

        Ok(())
    }

    /// Ask the loop to exit once posted callbacks are drained and all
    /// sources have flushed their outbound buffers.
    pub fn request_exit(&self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }

    /// Break the loop at the next iteration, abandoning pending writes.
    pub fn break_loop(&self) {
        self.shared.brk.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }

    /// Block until the loop thread has exited, up to `timeout`. Returns
    /// whether it exited.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.shared.exited.lock();
        while !*exited {
            if self
                .shared
                .exited_cond
                .wait_until(&mut exited, deadline)
                .timed_out()
            {
                break;
            }
        }
        *exited
    }
}

/// Error while posting a callback to the event loop.
#[derive(Error, Debug)]
#[error("posting to event loop failed")]
pub struct PostError {
    #[from]
    source: Error,
}
