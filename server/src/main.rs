mod dispatcher;

use dispatcher::Dispatcher;
use opcua_core::{logging, Acceptor, NodeStore, ServerConfig};
use slog::info;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICK_TIMEOUT: Duration = Duration::from_millis(100);

fn main() {
    let config = match env::args().nth(1) {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::default(),
    };

    let logger = logging::init(&config.logging);
    info!(logger, "starting server"; "port" => config.network.port);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .expect("failed to install Ctrl-C handler");
    }

    let store = Arc::new(NodeStore::new());
    let mut acceptor = Acceptor::start(logger.clone(), config.network)
        .expect("failed to start network acceptor");
    info!(logger, "discovery url"; "url" => acceptor.discovery_url());

    let dispatcher = Dispatcher::start(config.workers.worker_count, Arc::clone(&store), logger.clone());

    run_tick_loop(&mut acceptor, &dispatcher, &shutdown);

    let final_jobs = acceptor.stop();
    dispatcher.dispatch(final_jobs);
    acceptor.delete_members();
    dispatcher.shutdown();

    info!(logger, "server stopped");
}

/// Drives `getJobs` → dispatch → repeat until `shutdown` is set by the
/// Ctrl-C handler. Split out so a test can pre-set `shutdown` and exercise
/// exactly zero or one tick instead of running forever.
fn run_tick_loop(acceptor: &mut Acceptor, dispatcher: &Dispatcher, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        let jobs = acceptor.get_jobs(TICK_TIMEOUT);
        if !jobs.is_empty() {
            dispatcher.dispatch(jobs);
        }
    }
}
