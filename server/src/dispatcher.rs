use opcua_core::{Job, Node, NodeClass, NodeId, NodeStore};
use slog::{debug, info, o, Logger};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Fixed-size worker pool draining `Job`s the acceptor thread produces.
/// Plain `std::thread` + `std::sync::mpsc`, matching the crate's
/// parallel-OS-threads model - no async runtime anywhere in this binary.
///
/// Each `BinaryMessage` is demo wiring, not protocol logic: it treats the
/// message bytes as a pre-serialized `Node` payload and inserts it under a
/// synthesized id, which is enough to exercise the NodeStore concurrently
/// from multiple worker threads the way a real session layer would.
pub struct Dispatcher {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(worker_count: usize, store: Arc<NodeStore>, logger: Logger) -> Dispatcher {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let store = Arc::clone(&store);
                let logger = logger.new(o!("worker" => id));
                thread::spawn(move || worker_loop(receiver, store, logger))
            })
            .collect();

        Dispatcher {
            sender: Some(sender),
            workers,
        }
    }

    /// Hand a tick's job batch to the pool. Each connection's jobs are
    /// pushed in the order the acceptor produced them; since `Job` carries
    /// an `Arc<Connection>`, a `DelayedFree` only actually drops the
    /// connection once every earlier clone - including the ones held by
    /// `BinaryMessage` jobs already drained by some worker - has gone out
    /// of scope.
    pub fn dispatch(&self, jobs: Vec<Job>) {
        let sender = self.sender.as_ref().expect("dispatcher not yet shut down");
        for job in jobs {
            let _ = sender.send(job);
        }
    }

    /// Close the channel and join every worker. Call only after the
    /// acceptor has stopped and its final job batch has been dispatched.
    pub fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<mpsc::Receiver<Job>>>, store: Arc<NodeStore>, logger: Logger) {
    loop {
        let job = {
            let rx = receiver.lock().expect("job channel mutex poisoned");
            rx.recv()
        };
        let Ok(job) = job else {
            break;
        };
        handle_job(job, &store, &logger);
    }
}

fn handle_job(job: Job, store: &NodeStore, logger: &Logger) {
    match job {
        Job::BinaryMessage { connection, bytes } => {
            let node = Node::new(NodeId::null(), NodeClass::Variable, bytes);
            // want_handle=true is the only way to learn the id the store
            // synthesized for this null-id insert.
            match store.insert(node, true) {
                Ok(handle) => debug!(logger, "stored inbound message";
                    "peer_addr" => %connection.peer_addr(),
                    "node_id" => format!("{:?}", handle.expect("want_handle requested").node_id())),
                Err(e) => debug!(logger, "failed to store inbound message"; "error" => %e),
            }
        }
        Job::DetachConnection { connection } => {
            info!(logger, "connection detached"; "peer_addr" => %connection.peer_addr());
        }
        Job::DelayedFree { connection } => {
            debug!(logger, "connection freed"; "peer_addr" => %connection.peer_addr());
        }
    }
}
