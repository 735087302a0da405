use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use farthing_reactor::{EventLoop, LoopHandle};
use mio::Token;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{event, Level};

use crate::{
    acl::{Acl, AclError},
    config::{split_host_port, Config},
    listener::HttpListener,
    registry::Handler,
    request::Request,
    workqueue::{WorkQueue, WorkUnit},
};

/// How long Stop gives the event loop to exit before breaking it.
const LOOP_EXIT_GRACE: Duration = Duration::from_secs(2);

/// HTTP request work item: a request, the handler matched to it, and the
/// URI remainder after the matched prefix.
pub(crate) struct WorkItem {
    pub(crate) req: Request,
    pub(crate) handler: Handler,
    pub(crate) path: String,
}

impl WorkUnit for WorkItem {
    fn execute(mut self) {
        (self.handler)(&mut self.req, &self.path);
    }
}

/// State shared between the listener/connection sources on the loop
/// thread and the lifecycle entry points.
pub(crate) struct ServerShared {
    pub(crate) acl: Acl,
    pub(crate) queue: Arc<WorkQueue<WorkItem>>,
    /// Set during Interrupt: in-flight connections get 503 from here on.
    pub(crate) rejecting: AtomicBool,
    pub(crate) server_timeout: Duration,
    pub(crate) handle: LoopHandle,
}

enum Phase {
    Initialized,
    Started,
    Interrupted,
}

struct HttpServer {
    /// Present between Init and Start, then moved into the loop thread.
    event_loop: Option<EventLoop>,
    handle: LoopHandle,
    shared: Arc<ServerShared>,
    queue: Arc<WorkQueue<WorkItem>>,
    listeners: Vec<Token>,
    bound: Vec<SocketAddr>,
    threads: usize,
    loop_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    phase: Phase,
}

static SERVER: Mutex<Option<HttpServer>> = Mutex::new(None);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("SSL mode for RPC (-rpcssl) is no longer supported")]
    TlsUnsupported,
    #[error(transparent)]
    Acl(#[from] AclError),
    #[error("invalid -rpcbind address: {0}")]
    BadBindAddress(String),
    #[error("unable to bind any endpoint for RPC server")]
    BindFailed,
    #[error("HTTP server already initialized")]
    AlreadyInitialized,
    #[error("HTTP server not initialized")]
    NotInitialized,
    #[error("HTTP server already started")]
    AlreadyStarted,
    #[error("failed to create event loop: {0}")]
    Reactor(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Build the ACL, create the event loop and work queue, and bind the
/// listening sockets. Fails without side effects; nothing runs until
/// [`start_http_server`].
pub fn init_http_server(config: &Config) -> Result<(), ServerError> {
    let mut server = SERVER.lock();
    if server.is_some() {
        return Err(ServerError::AlreadyInitialized);
    }

    let acl = Acl::new(&config.allow_ip)?;
    event!(Level::DEBUG, allowed = %acl, "allowing HTTP connections");

    if config.ssl {
        return Err(ServerError::TlsUnsupported);
    }

    let mut event_loop = EventLoop::new().map_err(ServerError::Reactor)?;
    let handle = event_loop.handle();

    let depth = config.work_queue_depth.max(1);
    event!(Level::INFO, depth, "creating work queue");
    let queue = Arc::new(WorkQueue::new(depth));

    let shared = Arc::new(ServerShared {
        acl,
        queue: Arc::clone(&queue),
        rejecting: AtomicBool::new(false),
        server_timeout: config.server_timeout,
        handle: handle.clone(),
    });

    let mut listeners = Vec::new();
    let mut bound = Vec::new();
    for addr in bind_endpoints(config)? {
        match HttpListener::bind(&mut event_loop, addr, Arc::clone(&shared)) {
            Ok((token, local_addr)) => {
                listeners.push(token);
                bound.push(local_addr);
            }
            Err(error) => {
                event!(Level::WARN, %addr, %error, "binding RPC listener failed");
            }
        }
    }
    if bound.is_empty() {
        return Err(ServerError::BindFailed);
    }

    *server = Some(HttpServer {
        event_loop: Some(event_loop),
        handle,
        shared,
        queue,
        listeners,
        bound,
        threads: config.threads.max(1),
        loop_thread: None,
        workers: Vec::new(),
        phase: Phase::Initialized,
    });

    event!(Level::DEBUG, "initialized HTTP server");
    Ok(())
}

/// Addresses to bind, per the exposure policy: loopback only unless an
/// allow list was configured, then explicit `-rpcbind` addresses, then
/// wildcard.
fn bind_endpoints(config: &Config) -> Result<Vec<SocketAddr>, ServerError> {
    let port = config.port;
    let mut endpoints = Vec::new();

    if config.allow_ip.is_empty() {
        endpoints.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port));
        endpoints.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        if !config.bind.is_empty() {
            event!(
                Level::WARN,
                "option -rpcbind was ignored because -rpcallowip was not specified, refusing to allow everyone to connect"
            );
        }
    } else if !config.bind.is_empty() {
        for spec in &config.bind {
            let addr = split_host_port(spec, port)
                .ok_or_else(|| ServerError::BadBindAddress(spec.clone()))?;
            endpoints.push(addr);
        }
    } else {
        endpoints.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
        endpoints.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    Ok(endpoints)
}

/// Spawn the event-loop thread and the work-queue workers.
pub fn start_http_server() -> Result<(), ServerError> {
    let mut guard = SERVER.lock();
    let server = guard.as_mut().ok_or(ServerError::NotInitialized)?;
    if !matches!(server.phase, Phase::Initialized) {
        return Err(ServerError::AlreadyStarted);
    }

    event!(Level::INFO, threads = server.threads, "starting HTTP server");

    let event_loop = server.event_loop.take().expect("event loop present before start");
    let loop_thread = thread::Builder::new().name("http".into()).spawn(move || {
        event!(Level::DEBUG, "entering http event loop");
        if let Err(error) = event_loop.run() {
            event!(Level::ERROR, %error, "http event loop failed");
        }
        event!(Level::DEBUG, "exited http event loop");
    })?;
    server.loop_thread = Some(loop_thread);

    for i in 0..server.threads {
        let queue = Arc::clone(&server.queue);
        let worker = thread::Builder::new()
            .name(format!("httpworker-{i}"))
            .spawn(move || queue.run())?;
        server.workers.push(worker);
    }

    server.phase = Phase::Started;
    Ok(())
}

/// Stop accepting: detach the listeners, answer 503 on connections that
/// stay open, and interrupt the work queue. In-flight handlers run to
/// completion. Idempotent; a no-op before Init.
pub fn interrupt_http_server() {
    let mut guard = SERVER.lock();
    let Some(server) = guard.as_mut() else {
        return;
    };

    event!(Level::DEBUG, "interrupting HTTP server");

    server.shared.rejecting.store(true, Ordering::SeqCst);

    let listeners = std::mem::take(&mut server.listeners);
    if !listeners.is_empty() {
        let _ = server.handle.post(move |cx| {
            for token in listeners {
                cx.remove(token);
            }
        });
    }

    server.queue.interrupt();
    server.phase = Phase::Interrupted;
}

/// Drain the workers, then wind down the event loop, breaking it if it
/// has not exited within the grace period. A no-op before Init.
pub fn stop_http_server() {
    let Some(mut server) = SERVER.lock().take() else {
        return;
    };

    event!(Level::DEBUG, "stopping HTTP server");

    // Interrupt may not have run; make the queue reject and drain either
    // way. Workers finish first so every reply is posted before the loop
    // winds down.
    server.shared.rejecting.store(true, Ordering::SeqCst);
    server.queue.interrupt();
    event!(Level::DEBUG, "waiting for HTTP worker threads to exit");
    server.queue.wait_exit();
    for worker in server.workers.drain(..) {
        let _ = worker.join();
    }

    if let Some(loop_thread) = server.loop_thread.take() {
        event!(Level::DEBUG, "waiting for HTTP event thread to exit");
        server.handle.request_exit();
        if !server.handle.wait_exited(LOOP_EXIT_GRACE) {
            event!(
                Level::WARN,
                "HTTP event loop did not exit within allotted time, sending loopbreak"
            );
            server.handle.break_loop();
        }
        let _ = loop_thread.join();
    }

    event!(Level::DEBUG, "stopped HTTP server");
}

/// Addresses actually listening, with ephemeral ports resolved.
pub fn bound_addrs() -> Vec<SocketAddr> {
    SERVER
        .lock()
        .as_ref()
        .map(|server| server.bound.clone())
        .unwrap_or_default()
}

/// Handle to the server's event loop, for collaborators that piggyback
/// their own timers or callbacks on the loop thread.
pub fn event_loop_handle() -> Option<LoopHandle> {
    SERVER.lock().as_ref().map(|server| server.handle.clone())
}
