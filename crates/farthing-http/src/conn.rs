use std::{
    any::Any,
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use anyhow::Error;
use bytes::{Buf, BufMut, BytesMut};
use farthing_reactor::{EventSource, LoopCx, Ready, Status};
use mio::{net::TcpStream, Interest, Token};
use tracing::{event, Level};

use crate::{
    parser::{Method, ParseError, ParsedRequest, RequestParser},
    registry,
    request::{reason_phrase, status, Request, Response},
    server::{ServerShared, WorkItem},
};

/// One accepted HTTP/1.x connection, owned by the event loop.
///
/// Pipelined requests are answered in arrival order: each dispatched
/// request takes a slot, and replies park in their slot until every
/// earlier reply has been written.
pub(crate) struct HttpConnection {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    parser: RequestParser,
    pending: VecDeque<Slot>,
    next_slot: u64,
    out: BytesMut,
    watching_writable: bool,
    last_activity: Instant,
    closing: bool,
}

struct Slot {
    id: u64,
    response: Option<Response>,
    keep_alive: bool,
}

impl HttpConnection {
    /// Register the accepted stream and start its inactivity timer.
    pub(crate) fn accept(
        cx: &mut LoopCx<'_>,
        mut stream: TcpStream,
        peer: SocketAddr,
        shared: Arc<ServerShared>,
    ) -> Result<(), Error> {
        let token = cx.next_token();
        cx.registry()
            .register(&mut stream, token, Interest::READABLE)?;

        let timeout = shared.server_timeout;
        let conn = Self {
            token,
            stream,
            peer,
            shared,
            parser: RequestParser::new(),
            pending: VecDeque::new(),
            next_slot: 0,
            out: BytesMut::new(),
            watching_writable: false,
            last_activity: Instant::now(),
            closing: false,
        };
        cx.insert(token, Box::new(conn));
        arm_idle_timer(cx, token, timeout);

        Ok(())
    }

    fn dispatch_parsed(&mut self, cx: &mut LoopCx<'_>) -> Result<(), Error> {
        while !self.closing {
            match self.parser.next() {
                Ok(Some(parsed)) => self.dispatch_request(parsed),
                Ok(None) => break,
                Err(error) => {
                    event!(Level::DEBUG, peer = %self.peer, %error, "rejecting malformed request");
                    let code = match error {
                        ParseError::HeadTooLarge(_) | ParseError::BodyTooLarge(_) => {
                            status::PAYLOAD_TOO_LARGE
                        }
                        ParseError::Malformed(_) => status::BAD_REQUEST,
                    };
                    self.push_error_response(code);
                    self.closing = true;
                }
            }
        }
        self.flush(cx)?;
        Ok(())
    }

    /// Gate and dispatch one request; mirrors the generic request
    /// callback order: shutdown, ACL, method, route, backpressure.
    fn dispatch_request(&mut self, parsed: ParsedRequest) {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.pending.push_back(Slot {
            id: slot,
            response: None,
            keep_alive: parsed.keep_alive,
        });

        let mut req = Request::new(
            self.token,
            slot,
            parsed,
            self.peer,
            self.shared.handle.clone(),
        );

        event!(
            Level::DEBUG,
            method = %req.method(),
            uri = %req.uri(),
            peer = %self.peer,
            "received request"
        );

        if self.shared.rejecting.load(Ordering::SeqCst) {
            event!(Level::DEBUG, "rejecting request while shutting down");
            req.write_reply(status::SERVICE_UNAVAILABLE, "");
            return;
        }

        if !self.shared.acl.is_allowed(self.peer.ip()) {
            req.write_reply(status::FORBIDDEN, "");
            return;
        }

        if req.method() == Method::Unknown {
            req.write_reply(status::BAD_METHOD, "");
            return;
        }

        let Some((handler, path)) = registry::lookup(req.uri()) else {
            req.write_reply(status::NOT_FOUND, "");
            return;
        };

        let item = WorkItem { req, handler, path };
        if let Err(mut item) = self.shared.queue.enqueue(item) {
            item.req
                .write_reply(status::INTERNAL_SERVER_ERROR, "Work queue depth exceeded");
        }
    }

    /// Immediate response for a request that never parsed far enough to
    /// be dispatched.
    fn push_error_response(&mut self, code: u16) {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.pending.push_back(Slot {
            id: slot,
            response: Some(Response {
                slot,
                status: code,
                headers: Vec::new(),
                body: Default::default(),
                head_only: false,
            }),
            keep_alive: false,
        });
    }

    /// A worker's reply arriving back on the loop thread.
    fn on_response(&mut self, cx: &mut LoopCx<'_>, response: Response) -> Result<Status, Error> {
        let Some(slot) = self.pending.iter_mut().find(|s| s.id == response.slot) else {
            event!(Level::DEBUG, "response for unknown slot, dropping");
            return Ok(self.close_status());
        };
        slot.response = Some(response);

        self.flush(cx)?;
        Ok(self.close_status())
    }

    /// Encode replies that are next in line, then write as much as the
    /// socket accepts.
    fn flush(&mut self, cx: &mut LoopCx<'_>) -> Result<(), Error> {
        self.drain_ready_responses();

        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(Error::msg("stream write returned zero")),
                Ok(n) => {
                    self.out.advance(n);
                    self.last_activity = Instant::now();
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }

        self.update_write_interest(cx)?;
        Ok(())
    }

    fn drain_ready_responses(&mut self) {
        while let Some(front) = self.pending.front() {
            if front.response.is_none() {
                break;
            }
            let slot = self.pending.pop_front().expect("front slot present");
            let response = slot.response.expect("front slot has a response");

            let keep_alive = slot.keep_alive && !self.closing;
            encode_response(&mut self.out, &response, keep_alive);
            if !keep_alive {
                self.closing = true;
            }
        }
    }

    fn update_write_interest(&mut self, cx: &mut LoopCx<'_>) -> Result<(), Error> {
        let want = !self.out.is_empty();
        if want != self.watching_writable {
            let interest = if want {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            cx.registry()
                .reregister(&mut self.stream, self.token, interest)?;
            self.watching_writable = want;
        }
        Ok(())
    }

    /// Read until the socket would block. Returns whether EOF was seen.
    fn read_available(&mut self) -> Result<bool, Error> {
        let mut buffer = [0u8; 4096];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    event!(Level::TRACE, count = n, "received data");
                    self.parser.push(&buffer[..n]);
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn close_status(&self) -> Status {
        if self.closing && self.pending.is_empty() && self.out.is_empty() {
            Status::Closed
        } else {
            Status::Active
        }
    }
}

impl EventSource for HttpConnection {
    fn on_ready(&mut self, cx: &mut LoopCx<'_>, ready: Ready) -> Result<Status, Error> {
        self.last_activity = Instant::now();

        if ready.readable {
            let eof = self.read_available()?;
            self.dispatch_parsed(cx)?;
            if eof {
                self.closing = true;
            }
        }

        if ready.writable {
            self.flush(cx)?;
        }

        Ok(self.close_status())
    }

    fn deregister(&mut self, registry: &mio::Registry) -> Result<(), Error> {
        registry.deregister(&mut self.stream)?;
        Ok(())
    }

    fn has_pending_write(&self) -> bool {
        !self.out.is_empty()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Hand a worker's finished reply to its connection. The connection may
/// have gone away in the meantime; the reply is then dropped.
pub(crate) fn deliver_response(cx: &mut LoopCx<'_>, token: Token, response: Response) {
    cx.with_source(token, move |source, cx| {
        let Some(conn) = source.as_any_mut().downcast_mut::<HttpConnection>() else {
            return Ok(Status::Active);
        };
        conn.on_response(cx, response)
    });
}

fn encode_response(out: &mut BytesMut, response: &Response, keep_alive: bool) {
    out.put_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            response.status,
            reason_phrase(response.status)
        )
        .as_bytes(),
    );
    for (name, value) in &response.headers {
        out.put_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.put_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    out.put_slice(if keep_alive {
        &b"Connection: keep-alive\r\n"[..]
    } else {
        &b"Connection: close\r\n"[..]
    });
    out.put_slice(b"\r\n");
    if !response.head_only {
        out.put_slice(&response.body);
    }
}

/// Close connections that have been quiet past the server timeout.
/// Connections with requests in flight are left alone and re-checked a
/// full timeout later.
fn arm_idle_timer(cx: &mut LoopCx<'_>, token: Token, timeout: Duration) {
    cx.post_after(timeout, move |cx| {
        cx.with_source(token, |source, cx| {
            let Some(conn) = source.as_any_mut().downcast_mut::<HttpConnection>() else {
                return Ok(Status::Active);
            };

            let busy = !conn.pending.is_empty();
            let idle_for = conn.last_activity.elapsed();
            if !busy && idle_for >= timeout {
                event!(Level::DEBUG, peer = %conn.peer, "closing idle connection");
                return Ok(Status::Closed);
            }

            let remaining = if busy { timeout } else { timeout - idle_for };
            arm_idle_timer(cx, token, remaining);
            Ok(Status::Active)
        });
    });
}
