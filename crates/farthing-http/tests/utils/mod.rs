use std::{
    io::{Read, Write},
    net::{IpAddr, SocketAddr, TcpStream, UdpSocket},
    time::Duration,
};

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect to server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

pub fn send_request(stream: &mut TcpStream, method: &str, path: &str, body: &str) {
    send_request_with_headers(stream, method, path, &[], body);
}

pub fn send_request_with_headers(
    stream: &mut TcpStream,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) {
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: farthing\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    stream.write_all(request.as_bytes()).expect("send request");
}

/// Read one response. `head_only` skips the body read for HEAD
/// exchanges, whose Content-Length describes the suppressed body.
///
/// The head is read a byte at a time so pipelined responses behind it
/// are never consumed.
pub fn read_response(stream: &mut TcpStream, head_only: bool) -> HttpResponse {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read response head");
        assert!(n > 0, "connection closed before response head");
        head.push(byte[0]);
    }

    let head = std::str::from_utf8(&head).expect("response head is UTF-8");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("numeric status");

    let headers: Vec<(String, String)> = lines
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, value) = line.split_once(':').expect("header line");
            (name.trim().to_string(), value.trim().to_string())
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.parse().expect("numeric content-length"))
        .unwrap_or(0);

    let mut body = vec![0u8; if head_only { 0 } else { content_length }];
    stream.read_exact(&mut body).expect("read response body");

    HttpResponse {
        status,
        headers,
        body: String::from_utf8(body).expect("response body is UTF-8"),
    }
}

pub fn roundtrip(stream: &mut TcpStream, method: &str, path: &str, body: &str) -> HttpResponse {
    send_request(stream, method, path, body);
    read_response(stream, method == "HEAD")
}

/// One-shot request on a fresh connection.
pub fn get(addr: SocketAddr, path: &str) -> HttpResponse {
    let mut stream = connect(addr);
    roundtrip(&mut stream, "GET", path, "")
}

/// A non-loopback address of this host, if it has one. Connecting to it
/// gives the connection a peer address the ACL can deny. No traffic is
/// sent; the UDP connect only resolves routing.
pub fn non_loopback_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}
