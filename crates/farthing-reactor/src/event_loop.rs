use std::{
    collections::{BTreeMap, HashMap},
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Error;
use mio::{Events, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use tracing::{event, instrument, Level};

use crate::{
    handle::{Pending, Shared},
    EventSource, LoopCallback, LoopHandle, Ready, Status,
};

const WAKER: Token = Token(usize::MAX);

/// Single-threaded event dispatcher.
///
/// Sources are created and inserted on the constructing thread, then the
/// whole loop is moved into its dispatch thread via [`EventLoop::run`].
/// From that point only [`LoopHandle`] may touch it from outside.
pub struct EventLoop {
    poll: Poll,
    shared: Arc<Shared>,
    sources: HashMap<Token, Box<dyn EventSource>>,
    timers: BTreeMap<(Instant, u64), LoopCallback>,
    next_timer_seq: u64,
    next_token: usize,
}

impl EventLoop {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let shared = Arc::new(Shared {
            posted: Mutex::new(Vec::new()),
            waker,
            exit: AtomicBool::new(false),
            brk: AtomicBool::new(false),
            exited: Mutex::new(false),
            exited_cond: Condvar::new(),
        });

        let value = Self {
            poll,
            shared,
            sources: HashMap::new(),
            timers: BTreeMap::new(),
            next_timer_seq: 0,
            next_token: 0,
        };
        Ok(value)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Create a new unique token for this loop.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn insert(&mut self, token: Token, source: Box<dyn EventSource>) {
        self.sources.insert(token, source);
    }

    /// Run the dispatch loop until exit or break, then mark the loop as
    /// exited for [`LoopHandle::wait_exited`] waiters.
    #[instrument("event-loop", skip_all)]
    pub fn run(mut self) -> Result<(), Error> {
        let result = self.run_inner();

        // Close remaining sources before signalling exit.
        self.sources.clear();
        let shared = Arc::clone(&self.shared);
        drop(self);

        *shared.exited.lock() = true;
        shared.exited_cond.notify_all();

        result
    }

    fn run_inner(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(256);
        event!(Level::DEBUG, "entering event loop");

        loop {
            if self.shared.brk.load(Ordering::SeqCst) {
                event!(Level::WARN, "event loop break requested");
                break;
            }

            let timeout = self.poll_timeout();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }

            for ev in events.iter() {
                if ev.token() == WAKER {
                    continue;
                }

                let ready = Ready {
                    readable: ev.is_readable(),
                    writable: ev.is_writable(),
                };
                if !ready.readable && !ready.writable {
                    continue;
                }

                let token = ev.token();
                self.with_source(token, |source, cx| source.on_ready(cx, ready));
            }

            self.drain_posted();
            self.fire_due_timers();

            if self.shared.exit.load(Ordering::SeqCst) && self.flushed() {
                break;
            }
        }

        event!(Level::DEBUG, "exited event loop");
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let mut timeout = self
            .timers
            .keys()
            .next()
            .map(|&(at, _)| at.saturating_duration_since(Instant::now()));

        // While winding down, re-check flush progress regularly even if
        // no readiness events arrive.
        if self.shared.exit.load(Ordering::SeqCst) {
            let cap = Duration::from_millis(100);
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }

        timeout
    }

    fn flushed(&self) -> bool {
        self.shared.posted.lock().is_empty()
            && self.sources.values().all(|s| !s.has_pending_write())
    }

    fn drain_posted(&mut self) {
        // Callbacks may post more callbacks; keep draining until quiet.
        loop {
            let batch = std::mem::take(&mut *self.shared.posted.lock());
            if batch.is_empty() {
                break;
            }

            for pending in batch {
                match pending {
                    Pending::Now(callback) => {
                        let mut cx = LoopCx { el: self };
                        callback(&mut cx);
                    }
                    Pending::At(at, callback) => self.insert_timer(at, callback),
                }
            }
        }
    }

    fn fire_due_timers(&mut self) {
        loop {
            let now = Instant::now();
            let Some((&(at, seq), _)) = self.timers.first_key_value() else {
                break;
            };
            if at > now {
                break;
            }

            let callback = self.timers.remove(&(at, seq)).expect("due timer missing");
            let mut cx = LoopCx { el: self };
            callback(&mut cx);
        }
    }

    fn insert_timer(&mut self, at: Instant, callback: LoopCallback) {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.timers.insert((at, seq), callback);
    }

    /// Take the source out, run `f` on it, and put it back unless it
    /// closed or failed. Events for unknown tokens are ignored.
    fn with_source(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut dyn EventSource, &mut LoopCx<'_>) -> Result<Status, Error>,
    ) {
        let Some(mut source) = self.sources.remove(&token) else {
            event!(Level::TRACE, ?token, "event for unknown source");
            return;
        };

        let mut cx = LoopCx { el: self };
        let result = f(source.as_mut(), &mut cx);

        match result {
            Ok(Status::Active) => {
                self.sources.insert(token, source);
            }
            Ok(Status::Closed) => {
                event!(Level::TRACE, ?token, "source closed");
                self.deregister_quietly(source.as_mut());
            }
            Err(error) => {
                event!(Level::WARN, ?token, ?error, "source failed, dropping");
                self.deregister_quietly(source.as_mut());
            }
        }
    }

    fn deregister_quietly(&mut self, source: &mut dyn EventSource) {
        if let Err(error) = source.deregister(self.poll.registry()) {
            event!(Level::DEBUG, ?error, "failed to deregister source");
        }
    }
}

/// Loop-thread context handed to sources, posted callbacks, and timers.
pub struct LoopCx<'a> {
    el: &'a mut EventLoop,
}

impl LoopCx<'_> {
    pub fn registry(&self) -> &mio::Registry {
        self.el.poll.registry()
    }

    pub fn next_token(&mut self) -> Token {
        self.el.next_token()
    }

    pub fn insert(&mut self, token: Token, source: Box<dyn EventSource>) {
        self.el.insert(token, source);
    }

    /// Deregister and drop the source under `token`, if any.
    pub fn remove(&mut self, token: Token) {
        if let Some(mut source) = self.el.sources.remove(&token) {
            self.el.deregister_quietly(source.as_mut());
        }
    }

    /// Run `f` against the source under `token`, if present. The source
    /// is detached for the duration of the call; `Status::Closed` or an
    /// error drops it.
    pub fn with_source(
        &mut self,
        token: Token,
        f: impl FnOnce(&mut dyn EventSource, &mut LoopCx<'_>) -> Result<Status, Error>,
    ) {
        self.el.with_source(token, f);
    }

    /// Arm a loop timer. Unlike [`LoopHandle::post_after`], this runs on
    /// the loop thread already and needs no wakeup.
    pub fn post_after(
        &mut self,
        delay: Duration,
        f: impl FnOnce(&mut LoopCx<'_>) + Send + 'static,
    ) {
        self.el.insert_timer(Instant::now() + delay, Box::new(f));
    }

    pub fn handle(&self) -> LoopHandle {
        self.el.handle()
    }
}
