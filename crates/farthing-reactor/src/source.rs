use std::any::Any;

use anyhow::Error;

use crate::LoopCx;

/// Readiness state delivered to a source.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
}

/// What a source wants done with itself after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Active,
    Closed,
}

/// An I/O source owned by the event loop.
///
/// Sources are registered under a token and receive readiness events on
/// the loop thread. A source returning [`Status::Closed`] or an error is
/// deregistered and dropped.
pub trait EventSource: Send + 'static {
    fn on_ready(&mut self, cx: &mut LoopCx<'_>, ready: Ready) -> Result<Status, Error>;

    /// Detach the underlying handle from the poller before drop.
    fn deregister(&mut self, registry: &mio::Registry) -> Result<(), Error> {
        let _ = registry;
        Ok(())
    }

    /// Outbound bytes not yet flushed. A graceful loop exit waits for
    /// every source to report false here.
    fn has_pending_write(&self) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
