//! HTTP RPC server front-end.
//!
//! A single event-loop thread owns the listening sockets and all
//! per-connection I/O. Parsed requests are gated (ACL, method, route)
//! and handed to a bounded work queue drained by worker threads; the
//! worker's reply is routed back to the loop thread, which performs the
//! socket write. See [`init_http_server`] for the lifecycle entry point.

mod acl;
mod config;
mod conn;
mod listener;
mod parser;
mod registry;
mod request;
mod server;
mod workqueue;

pub use self::{
    acl::{Acl, AclError, Subnet},
    config::{
        Config, DEFAULT_HTTP_SERVER_TIMEOUT, DEFAULT_HTTP_THREADS, DEFAULT_HTTP_WORKQUEUE,
        DEFAULT_RPC_PORT, MAX_BODY_SIZE, MAX_HEADERS_SIZE,
    },
    parser::Method,
    registry::{register_http_handler, unregister_http_handler, Handler},
    request::{status, Request},
    server::{
        bound_addrs, event_loop_handle, init_http_server, interrupt_http_server,
        start_http_server, stop_http_server, ServerError,
    },
    workqueue::{WorkQueue, WorkUnit},
};
