use bytes::{Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::config::{MAX_BODY_SIZE, MAX_HEADERS_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Unknown,
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("request line and headers exceed {0} bytes")]
    HeadTooLarge(usize),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

/// A fully received request, ready for dispatch.
#[derive(Debug, PartialEq)]
pub(crate) struct ParsedRequest {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Bytes,
    pub(crate) keep_alive: bool,
}

struct Head {
    method: Method,
    uri: String,
    headers: Vec<(String, String)>,
    keep_alive: bool,
}

enum State {
    Head,
    Body { head: Head, need: usize },
}

/// Incremental HTTP/1.x request parser.
///
/// Bytes are pushed as they arrive off the socket; [`RequestParser::next`]
/// yields one complete request at a time, so pipelined requests come out
/// in arrival order.
pub(crate) struct RequestParser {
    buf: BytesMut,
    state: State,
    max_head: usize,
    max_body: usize,
}

impl RequestParser {
    pub(crate) fn new() -> Self {
        Self::with_limits(MAX_HEADERS_SIZE, MAX_BODY_SIZE)
    }

    pub(crate) fn with_limits(max_head: usize, max_body: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::Head,
            max_head,
            max_body,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete request, if one is buffered.
    ///
    /// A parse error poisons the connection; the caller is expected to
    /// reply with the matching status and stop reading.
    pub(crate) fn next(&mut self) -> Result<Option<ParsedRequest>, ParseError> {
        loop {
            match &mut self.state {
                State::Head => {
                    let Some(end) = find_head_end(&self.buf) else {
                        if self.buf.len() > self.max_head {
                            return Err(ParseError::HeadTooLarge(self.max_head));
                        }
                        return Ok(None);
                    };
                    if end > self.max_head {
                        return Err(ParseError::HeadTooLarge(self.max_head));
                    }

                    let head_bytes = self.buf.split_to(end);
                    let head = parse_head(&head_bytes)?;
                    let need = content_length(&head.headers)?;
                    if need > self.max_body {
                        return Err(ParseError::BodyTooLarge(self.max_body));
                    }

                    self.state = State::Body { head, need };
                }
                State::Body { need, .. } => {
                    if self.buf.len() < *need {
                        return Ok(None);
                    }

                    let body = self.buf.split_to(*need).freeze();
                    let State::Body { head, .. } = std::mem::replace(&mut self.state, State::Head)
                    else {
                        unreachable!()
                    };

                    return Ok(Some(ParsedRequest {
                        method: head.method,
                        uri: head.uri,
                        headers: head.headers,
                        body,
                        keep_alive: head.keep_alive,
                    }));
                }
            }
        }
    }
}

/// Case-insensitive header lookup; first match wins.
pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Offset just past the blank line ending the head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_head(bytes: &[u8]) -> Result<Head, ParseError> {
    let text =
        std::str::from_utf8(bytes).map_err(|_| ParseError::Malformed("head is not valid UTF-8"))?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::Malformed("incomplete request line"));
    };

    let http_10 = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        _ => return Err(ParseError::Malformed("unsupported protocol version")),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::Malformed("header line missing colon"));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let connection = find_header(&headers, "connection")
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let keep_alive = if http_10 {
        connection.split(',').any(|t| t.trim() == "keep-alive")
    } else {
        !connection.split(',').any(|t| t.trim() == "close")
    };

    Ok(Head {
        method: Method::parse(method),
        uri: uri.to_string(),
        headers,
        keep_alive,
    })
}

fn content_length(headers: &[(String, String)]) -> Result<usize, ParseError> {
    if find_header(headers, "transfer-encoding").is_some() {
        return Err(ParseError::Malformed("transfer-encoding is not supported"));
    }

    match find_header(headers, "content-length") {
        None => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|_| ParseError::Malformed("invalid content-length")),
    }
}
