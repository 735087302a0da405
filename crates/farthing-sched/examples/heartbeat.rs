use std::{sync::Arc, time::Duration};

use farthing_sched::Scheduler;
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter("debug")
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let sched = Arc::new(Scheduler::new());
    let service = sched.spawn_service_thread();

    sched.schedule_in(
        || event!(Level::INFO, "one-shot task fired"),
        Duration::from_millis(500),
    );
    sched.schedule_every(
        || event!(Level::INFO, "heartbeat"),
        Duration::from_millis(200),
    );

    std::thread::sleep(Duration::from_secs(2));
    let info = sched.queue_info();
    event!(Level::INFO, pending = info.count, "shutting down");

    sched.stop(false);
    service.join().expect("scheduler thread exits");
}
