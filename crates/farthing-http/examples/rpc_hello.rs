//! Minimal JSON-RPC-flavoured server. Run it, then:
//!
//! ```text
//! curl -d '{"method":"ping"}' http://127.0.0.1:9732/
//! ```

use std::{io::stdin, sync::Arc, time::Duration};

use anyhow::Error;
use farthing_http::{
    bound_addrs, init_http_server, interrupt_http_server, register_http_handler,
    start_http_server, status, stop_http_server, Config,
};
use farthing_sched::Scheduler;
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<(), Error> {
    init_logging();

    register_http_handler(
        "/",
        false,
        Arc::new(|req, _path| {
            let body = req.read_body();
            let reply = match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(call) => serde_json::json!({
                    "result": format!("called {}", call["method"]),
                    "error": null,
                }),
                Err(error) => serde_json::json!({
                    "result": null,
                    "error": error.to_string(),
                }),
            };
            req.write_header("Content-Type", "application/json");
            req.write_reply(status::OK, reply.to_string());
        }),
    );

    let config = Config {
        bind: vec!["127.0.0.1:9732".to_string()],
        allow_ip: vec!["127.0.0.1".to_string()],
        ..Config::default()
    };
    init_http_server(&config)?;
    start_http_server()?;
    event!(Level::INFO, addrs = ?bound_addrs(), "RPC server up, press enter to stop");

    // Piggyback a periodic heartbeat the way node subsystems do.
    let sched = Arc::new(Scheduler::new());
    let service = sched.spawn_service_thread();
    sched.schedule_every(
        || event!(Level::INFO, "heartbeat"),
        Duration::from_secs(10),
    );

    stdin().read_line(&mut String::new())?;

    interrupt_http_server();
    stop_http_server();
    sched.stop(false);
    service.join().expect("scheduler thread exits");

    Ok(())
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter("info")
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();
}
