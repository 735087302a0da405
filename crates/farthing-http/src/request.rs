use std::net::SocketAddr;

use bytes::Bytes;
use farthing_reactor::LoopHandle;
use mio::Token;
use tracing::{event, Level};

use crate::{
    conn,
    parser::{find_header, Method, ParsedRequest},
};

/// HTTP status codes emitted by the server core.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const BAD_METHOD: u16 = 405;
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        status::OK => "OK",
        status::BAD_REQUEST => "Bad Request",
        status::FORBIDDEN => "Forbidden",
        status::NOT_FOUND => "Not Found",
        status::BAD_METHOD => "Method Not Allowed",
        status::PAYLOAD_TOO_LARGE => "Payload Too Large",
        status::INTERNAL_SERVER_ERROR => "Internal Server Error",
        status::SERVICE_UNAVAILABLE => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A finished reply travelling back to the connection's event-loop slot.
pub(crate) struct Response {
    pub(crate) slot: u64,
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Bytes,
    pub(crate) head_only: bool,
}

/// An in-flight HTTP exchange.
///
/// Ownership moves from the event loop into a work item on dispatch and
/// back to the loop when the reply is posted. Exactly one reply is sent
/// per request: dropping a request that never called
/// [`Request::write_reply`] synthesizes a 500.
pub struct Request {
    conn: Token,
    slot: u64,
    method: Method,
    uri: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    peer: SocketAddr,
    reply_headers: Vec<(String, String)>,
    reply_sent: bool,
    handle: LoopHandle,
}

impl Request {
    pub(crate) fn new(
        conn: Token,
        slot: u64,
        parsed: ParsedRequest,
        peer: SocketAddr,
        handle: LoopHandle,
    ) -> Self {
        Self {
            conn,
            slot,
            method: parsed.method,
            uri: parsed.uri,
            headers: parsed.headers,
            body: Some(parsed.body),
            peer,
            reply_headers: Vec::new(),
            reply_sent: false,
            handle,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Peer address of the underlying connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Case-insensitive lookup of a request header.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Take the request body. Subsequent calls return empty bytes.
    pub fn read_body(&mut self) -> Bytes {
        self.body.take().unwrap_or_default()
    }

    /// Queue a header to be sent with the reply.
    pub fn write_header(&mut self, name: &str, value: &str) {
        self.reply_headers.push((name.to_string(), value.to_string()));
    }

    /// Send the reply.
    ///
    /// The socket write itself always happens on the event-loop thread:
    /// this posts a one-shot callback carrying the finished response and
    /// hands the exchange back to the loop. Callable from any thread,
    /// at most once per request.
    pub fn write_reply(&mut self, status: u16, body: impl AsRef<[u8]>) {
        if self.reply_sent {
            event!(Level::WARN, uri = %self.uri, "reply already sent");
            return;
        }
        self.reply_sent = true;

        let response = Response {
            slot: self.slot,
            status,
            headers: std::mem::take(&mut self.reply_headers),
            body: Bytes::copy_from_slice(body.as_ref()),
            head_only: self.method == Method::Head,
        };

        let conn = self.conn;
        let result = self
            .handle
            .post(move |cx| conn::deliver_response(cx, conn, response));
        if let Err(error) = result {
            event!(Level::DEBUG, %error, "dropping reply, event loop is gone");
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // Keep track of whether a reply was sent to avoid request leaks.
        if !self.reply_sent {
            event!(Level::WARN, uri = %self.uri, "unhandled request");
            self.write_reply(status::INTERNAL_SERVER_ERROR, "Unhandled request");
        }
    }
}
