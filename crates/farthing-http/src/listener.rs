use std::{any::Any, io::ErrorKind, net::SocketAddr, sync::Arc};

use anyhow::Error;
use farthing_reactor::{EventLoop, EventSource, LoopCx, Ready, Status};
use mio::{Interest, Token};
use tracing::{event, Level};

use crate::{conn::HttpConnection, server::ServerShared};

/// A bound listening socket. Accepted streams become
/// [`HttpConnection`] sources on the same loop.
pub(crate) struct HttpListener {
    listener: mio::net::TcpListener,
    shared: Arc<ServerShared>,
}

impl HttpListener {
    /// Bind `addr` and insert the listener into the (not yet running)
    /// event loop. Returns its token and the resolved local address.
    pub(crate) fn bind(
        el: &mut EventLoop,
        addr: SocketAddr,
        shared: Arc<ServerShared>,
    ) -> Result<(Token, SocketAddr), Error> {
        let mut listener = mio::net::TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let token = el.next_token();
        el.registry()
            .register(&mut listener, token, Interest::READABLE)?;
        el.insert(token, Box::new(Self { listener, shared }));

        event!(Level::DEBUG, addr = %local_addr, "listening for RPC connections");
        Ok((token, local_addr))
    }
}

impl EventSource for HttpListener {
    fn on_ready(&mut self, cx: &mut LoopCx<'_>, ready: Ready) -> Result<Status, Error> {
        if !ready.readable {
            return Ok(Status::Active);
        }

        // Accept any pending streams. Accept failures are scoped to the
        // stream being accepted; the listening socket itself stays up.
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    event!(Level::DEBUG, ?peer, "stream accepted");
                    let shared = Arc::clone(&self.shared);
                    if let Err(error) = HttpConnection::accept(cx, stream, peer, shared) {
                        event!(Level::WARN, ?peer, %error, "failed to set up accepted stream");
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error)
                    if error.kind() == ErrorKind::ConnectionAborted
                        || error.kind() == ErrorKind::Interrupted =>
                {
                    // The peer reset before the accept completed.
                    event!(Level::DEBUG, %error, "accept aborted");
                }
                Err(error) => {
                    // Descriptor exhaustion and the like. Back off until
                    // the next readiness event rather than spinning.
                    event!(Level::WARN, %error, "accept failed");
                    break;
                }
            }
        }

        Ok(Status::Active)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> Result<(), Error> {
        registry.deregister(&mut self.listener)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
