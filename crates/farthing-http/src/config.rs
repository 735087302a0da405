use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    time::Duration,
};

/// Maximum size of the request line plus headers.
pub const MAX_HEADERS_SIZE: usize = 8192;
/// Maximum size of a request body.
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

pub const DEFAULT_RPC_PORT: u16 = 9732;
pub const DEFAULT_HTTP_THREADS: usize = 4;
pub const DEFAULT_HTTP_WORKQUEUE: usize = 16;
pub const DEFAULT_HTTP_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP RPC server options, mirroring the node's `-rpc*` settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// `-rpcbind`: addresses to bind, as `host[:port]`. Ignored with a
    /// warning unless `allow_ip` is also set, to refuse implicit open
    /// exposure.
    pub bind: Vec<String>,
    /// `-rpcallowip`: subnets allowed to connect, beyond loopback.
    pub allow_ip: Vec<String>,
    /// `-rpcport`: default port for binds that do not name one.
    pub port: u16,
    /// `-rpcthreads`: work-queue worker count, minimum 1.
    pub threads: usize,
    /// `-rpcworkqueue`: work-queue capacity, minimum 1.
    pub work_queue_depth: usize,
    /// `-rpcservertimeout`: per-connection inactivity timeout.
    pub server_timeout: Duration,
    /// `-rpcssl`: no longer supported; initialization fails when set.
    pub ssl: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Vec::new(),
            allow_ip: Vec::new(),
            port: DEFAULT_RPC_PORT,
            threads: DEFAULT_HTTP_THREADS,
            work_queue_depth: DEFAULT_HTTP_WORKQUEUE,
            server_timeout: DEFAULT_HTTP_SERVER_TIMEOUT,
            ssl: false,
        }
    }
}

/// Parse `host[:port]`, defaulting the port. IPv6 hosts with a port use
/// bracket notation, `[::1]:9732`.
pub(crate) fn split_host_port(spec: &str, default_port: u16) -> Option<SocketAddr> {
    if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let ip: Ipv6Addr = host.parse().ok()?;
        let port = match tail {
            "" => default_port,
            _ => tail.strip_prefix(':')?.parse().ok()?,
        };
        Some(SocketAddr::new(IpAddr::V6(ip), port))
    } else if spec.matches(':').count() == 1 {
        let (host, port) = spec.split_once(':')?;
        Some(SocketAddr::new(host.parse().ok()?, port.parse().ok()?))
    } else {
        // No port: a bare IPv4 or (multi-colon) IPv6 literal.
        Some(SocketAddr::new(spec.parse().ok()?, default_port))
    }
}
