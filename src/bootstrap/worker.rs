//! Worker threads. Each worker owns a single-threaded tokio runtime, a
//! dispatcher bound to it, and one connection handler.

use std::sync::Arc;
use std::thread;

use tokio::runtime::Builder;
use tracing::{error, info, span, Level};

use crate::dispatcher::Dispatcher;
use crate::limit::Resource;
use crate::listener::ConnectionHandler;
use crate::telemetry::Metrics;

use super::shutdown::Shutdown;

const WORKER_STACK_SIZE: usize = 2 * 1024 * 1024;

/// One worker thread plus the handles the main thread keeps to reach it.
pub struct Worker {
    index: usize,
    dispatcher: Arc<Dispatcher>,
    conn_handler: Arc<ConnectionHandler>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker thread and wait for its runtime to come up.
    pub fn spawn(
        index: usize,
        metrics: Arc<Metrics>,
        global_connections: Resource,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let name = format!("relayd-worker-{index}");
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let handle = thread::Builder::new()
            .name(name)
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let span = span!(Level::INFO, "worker", index);
                let _enter = span.enter();

                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build worker runtime");

                runtime.block_on(async {
                    let dispatcher = Dispatcher::new(format!("worker_{index}"), Some(index));
                    let conn_handler = ConnectionHandler::new(
                        dispatcher.clone(),
                        Some(index),
                        metrics,
                        global_connections,
                    );
                    let _ = ready_tx.send((dispatcher, conn_handler.clone()));

                    info!("worker started");

                    let mut shutdown_rx = shutdown.subscribe();
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }

                    conn_handler.stop_listeners_all();
                    info!("worker stopped");
                });
            })
            .expect("failed to spawn worker thread");

        let (dispatcher, conn_handler) = ready_rx
            .recv()
            .expect("worker thread died before signalling ready");

        Self {
            index,
            dispatcher,
            conn_handler,
            handle: Some(handle),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn conn_handler(&self) -> &Arc<ConnectionHandler> {
        &self.conn_handler
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                error!(worker = self.index, "worker thread panicked: {:?}", e);
            }
        }
    }
}

/// The worker pool.
pub struct Workers {
    inner: Vec<Worker>,
}

impl Workers {
    pub fn new(
        count: usize,
        metrics: Arc<Metrics>,
        global_connections: Resource,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let count = if count == 0 { num_cpus::get() } else { count };

        info!(workers = count, "starting worker pool");
        let inner = (0..count)
            .map(|index| {
                Worker::spawn(
                    index,
                    metrics.clone(),
                    global_connections.clone(),
                    shutdown.clone(),
                )
            })
            .collect();

        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.inner.iter()
    }

    pub fn join_all(&mut self) {
        for worker in &mut self.inner {
            worker.join();
        }
        info!("workers stopped");
    }
}
