mod utils;

use std::{
    io::{Read, Write},
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use farthing_http::{
    bound_addrs, init_http_server, interrupt_http_server, register_http_handler,
    start_http_server, status, stop_http_server, unregister_http_handler, Config, Handler,
};
use parking_lot::Mutex;
use tracing_test::traced_test;

use crate::utils::{
    connect, get, non_loopback_local_ip, read_response, roundtrip, send_request_with_headers,
};

fn test_config() -> Config {
    Config {
        bind: vec!["127.0.0.1:0".to_string()],
        allow_ip: vec!["127.0.0.1".to_string()],
        threads: 2,
        ..Config::default()
    }
}

/// The server and its handler registry are process-global; tests
/// serialize on this lock.
static SERVER_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` against a started server, cleaning up even when an assertion
/// fails.
fn with_server(config: Config, f: impl FnOnce(SocketAddr)) {
    let _guard = SERVER_LOCK.lock();

    init_http_server(&config).expect("init HTTP server");
    start_http_server().expect("start HTTP server");

    let addr = *bound_addrs().first().expect("at least one bound address");
    assert_ne!(addr.port(), 0, "ephemeral port resolved");

    let result = catch_unwind(AssertUnwindSafe(|| f(addr)));

    interrupt_http_server();
    stop_http_server();

    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
}

fn reply_with(code: u16, body: &'static str) -> Handler {
    Arc::new(move |req, _path| req.write_reply(code, body))
}

#[test]
#[traced_test]
fn routes_requests_and_exposes_suffix() {
    with_server(test_config(), |addr| {
        register_http_handler("/hello", true, reply_with(status::OK, "hello world"));
        register_http_handler(
            "/echo/",
            false,
            Arc::new(|req, path| {
                let body = format!("suffix={path}");
                req.write_reply(status::OK, body)
            }),
        );

        let response = get(addr, "/hello");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "hello world");
        assert_eq!(response.header("content-length"), Some("11"));

        let response = get(addr, "/echo/sub/path");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "suffix=sub/path");

        unregister_http_handler("/hello", true);
        unregister_http_handler("/echo/", false);
        let response = get(addr, "/hello");
        assert_eq!(response.status, 404);
    });
}

#[test]
#[traced_test]
fn first_registered_handler_wins() {
    with_server(test_config(), |addr| {
        register_http_handler("/dup", true, reply_with(status::OK, "first"));
        register_http_handler("/dup", true, reply_with(status::OK, "second"));

        let response = get(addr, "/dup");
        assert_eq!(response.body, "first");

        unregister_http_handler("/dup", true);
        unregister_http_handler("/dup", true);
    });
}

#[test]
#[traced_test]
fn gates_method_and_route() {
    with_server(test_config(), |addr| {
        register_http_handler("/gate", true, reply_with(status::OK, "ok"));

        // No handler matches.
        assert_eq!(get(addr, "/nope").status, 404);

        // Exact match does not cover longer URIs.
        assert_eq!(get(addr, "/gate/more").status, 404);

        // Unsupported method.
        let mut stream = connect(addr);
        let response = roundtrip(&mut stream, "OPTIONS", "/gate", "");
        assert_eq!(response.status, 405);

        unregister_http_handler("/gate", true);
    });
}

#[test]
#[traced_test]
fn acl_gates_peers_before_handler_dispatch() {
    // The allow list covers only a documentation subnet, so every real
    // peer address is outside it; loopback is admitted regardless.
    let config = Config {
        bind: vec!["0.0.0.0:0".to_string()],
        allow_ip: vec!["192.0.2.0/24".to_string()],
        ..test_config()
    };
    with_server(config, |addr| {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        register_http_handler(
            "/acl",
            true,
            Arc::new(move |req, _path| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                req.write_reply(status::OK, "ok");
            }),
        );

        // A loopback peer passes the gate even though the allow list
        // does not mention it.
        let loopback = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let response = get(loopback, "/acl");
        assert_eq!(response.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A peer outside the allow list gets 403 before any dispatch.
        // Needs a non-loopback route back to this host; hosts with only
        // a loopback interface skip this half.
        if let Some(ip) = non_loopback_local_ip() {
            let mut stream = connect(SocketAddr::new(ip, addr.port()));
            let response = roundtrip(&mut stream, "GET", "/acl", "");
            assert_eq!(response.status, 403);
            assert_eq!(
                calls.load(Ordering::SeqCst),
                1,
                "handler must not run for a denied peer"
            );
        }

        unregister_http_handler("/acl", true);
    });
}

#[test]
#[traced_test]
fn request_body_and_headers_reach_the_handler() {
    with_server(test_config(), |addr| {
        register_http_handler(
            "/inspect",
            true,
            Arc::new(|req, _path| {
                let header = req.header("X-Probe").unwrap_or("missing").to_string();
                let body = req.read_body();
                let reply = format!("{header}:{}", String::from_utf8_lossy(&body));
                req.write_header("Content-Type", "text/plain");
                req.write_header("X-Reply", "yes");
                req.write_reply(status::OK, reply);
            }),
        );

        let mut stream = connect(addr);
        send_request_with_headers(
            &mut stream,
            "POST",
            "/inspect",
            &[("x-probe", "probe-value")],
            "the body",
        );
        let response = read_response(&mut stream, false);

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "probe-value:the body");
        assert_eq!(response.header("x-reply"), Some("yes"));
        assert_eq!(response.header("content-type"), Some("text/plain"));

        unregister_http_handler("/inspect", true);
    });
}

#[test]
#[traced_test]
fn head_reply_omits_the_body() {
    with_server(test_config(), |addr| {
        register_http_handler("/head", true, reply_with(status::OK, "payload"));

        let mut stream = connect(addr);
        let response = roundtrip(&mut stream, "HEAD", "/head", "");
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-length"), Some("7"));

        // The connection is still usable: the body was really omitted.
        let response = roundtrip(&mut stream, "GET", "/head", "");
        assert_eq!(response.body, "payload");

        unregister_http_handler("/head", true);
    });
}

#[test]
#[traced_test]
fn handler_dropping_request_yields_500() {
    with_server(test_config(), |addr| {
        register_http_handler("/drop", true, Arc::new(|_req, _path| {}));

        let response = get(addr, "/drop");
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "Unhandled request");

        unregister_http_handler("/drop", true);
    });
}

#[test]
#[traced_test]
fn panicking_handler_yields_500_and_server_survives() {
    with_server(test_config(), |addr| {
        register_http_handler("/panic", true, Arc::new(|_req, _path| panic!("handler fault")));
        register_http_handler("/alive", true, reply_with(status::OK, "alive"));

        let response = get(addr, "/panic");
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "Unhandled request");

        let response = get(addr, "/alive");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "alive");

        unregister_http_handler("/panic", true);
        unregister_http_handler("/alive", true);
    });
}

#[test]
#[traced_test]
fn work_queue_backpressure_returns_500() {
    let config = Config {
        threads: 1,
        work_queue_depth: 1,
        ..test_config()
    };
    with_server(config, |addr| {
        register_http_handler(
            "/slow",
            true,
            Arc::new(|req, _path| {
                thread::sleep(Duration::from_millis(300));
                req.write_reply(status::OK, "slow done");
            }),
        );

        // First request occupies the worker, second fills the queue,
        // third exceeds the depth.
        let mut first = connect(addr);
        send_request_with_headers(&mut first, "GET", "/slow", &[], "");
        thread::sleep(Duration::from_millis(50));
        let mut second = connect(addr);
        send_request_with_headers(&mut second, "GET", "/slow", &[], "");
        thread::sleep(Duration::from_millis(50));
        let mut third = connect(addr);
        send_request_with_headers(&mut third, "GET", "/slow", &[], "");

        let rejected = read_response(&mut third, false);
        assert_eq!(rejected.status, 500);
        assert_eq!(rejected.body, "Work queue depth exceeded");

        assert_eq!(read_response(&mut first, false).body, "slow done");
        assert_eq!(read_response(&mut second, false).body, "slow done");

        unregister_http_handler("/slow", true);
    });
}

#[test]
#[traced_test]
fn keep_alive_and_pipelining_preserve_reply_order() {
    with_server(test_config(), |addr| {
        register_http_handler(
            "/first",
            true,
            Arc::new(|req, _path| {
                // Finish after /second's handler to prove replies are
                // ordered by arrival, not completion.
                thread::sleep(Duration::from_millis(100));
                req.write_reply(status::OK, "first");
            }),
        );
        register_http_handler("/second", true, reply_with(status::OK, "second"));

        let mut stream = connect(addr);
        stream
            .write_all(b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n")
            .unwrap();

        assert_eq!(read_response(&mut stream, false).body, "first");
        assert_eq!(read_response(&mut stream, false).body, "second");

        // Keep-alive: the same connection serves another exchange.
        let response = roundtrip(&mut stream, "GET", "/second", "");
        assert_eq!(response.body, "second");

        unregister_http_handler("/first", true);
        unregister_http_handler("/second", true);
    });
}

#[test]
#[traced_test]
fn connection_close_is_honored() {
    with_server(test_config(), |addr| {
        register_http_handler("/bye", true, reply_with(status::OK, "bye"));

        let mut stream = connect(addr);
        send_request_with_headers(&mut stream, "GET", "/bye", &[("Connection", "close")], "");
        let response = read_response(&mut stream, false);
        assert_eq!(response.status, 200);
        assert_eq!(response.header("connection"), Some("close"));

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).expect("read until EOF");
        assert!(rest.is_empty());

        unregister_http_handler("/bye", true);
    });
}

#[test]
#[traced_test]
fn malformed_and_oversized_requests_are_rejected() {
    with_server(test_config(), |addr| {
        let mut stream = connect(addr);
        stream.write_all(b"GARBAGE\r\n\r\n").unwrap();
        assert_eq!(read_response(&mut stream, false).status, 400);

        let mut stream = connect(addr);
        let mut oversized = Vec::from(&b"GET / HTTP/1.1\r\nX-Padding: "[..]);
        oversized.resize(10_000, b'a');
        stream.write_all(&oversized).unwrap();
        assert_eq!(read_response(&mut stream, false).status, 413);
    });
}

#[test]
#[traced_test]
fn shutdown_window_returns_503() {
    with_server(test_config(), |addr| {
        register_http_handler("/live", true, reply_with(status::OK, "live"));

        let mut stream = connect(addr);
        assert_eq!(roundtrip(&mut stream, "GET", "/live", "").status, 200);

        interrupt_http_server();
        // Interrupt is idempotent.
        interrupt_http_server();
        thread::sleep(Duration::from_millis(200));

        // The still-open connection gets 503 rather than a handler run.
        let response = roundtrip(&mut stream, "POST", "/live", "");
        assert_eq!(response.status, 503);

        // Listeners are detached: new connections are refused.
        assert!(std::net::TcpStream::connect(addr).is_err());

        unregister_http_handler("/live", true);
    });
}

#[test]
#[traced_test]
fn init_rejects_ssl_and_double_init() {
    with_server(test_config(), |_addr| {
        // Double init while a server exists.
        let error = init_http_server(&test_config()).unwrap_err();
        assert!(matches!(
            error,
            farthing_http::ServerError::AlreadyInitialized
        ));
    });

    let _guard = SERVER_LOCK.lock();

    // -rpcssl aborts init with a user-visible error.
    let config = Config {
        ssl: true,
        ..test_config()
    };
    let error = init_http_server(&config).unwrap_err();
    assert!(matches!(error, farthing_http::ServerError::TlsUnsupported));

    // Invalid ACL spec aborts init.
    let config = Config {
        allow_ip: vec!["299.0.0.1/33".to_string()],
        ..test_config()
    };
    let error = init_http_server(&config).unwrap_err();
    assert!(matches!(error, farthing_http::ServerError::Acl(_)));

    // Stop before init is a harmless no-op.
    stop_http_server();
}
