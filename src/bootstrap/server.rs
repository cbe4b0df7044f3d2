//! Main server wiring: workers, listeners, signals and drain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use crate::config::{Config, ListenerInfo};
use crate::limit::Resource;
use crate::telemetry::Metrics;

use super::shutdown::Shutdown;
use super::worker::Workers;

pub struct Server {
    config: Arc<Config>,
    shutdown: Arc<Shutdown>,
    metrics: Arc<Metrics>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            shutdown: Shutdown::new(),
            metrics: Metrics::new()?,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    /// Run until SIGINT or an explicit shutdown signal, then drain.
    pub async fn run(self) -> Result<()> {
        let global_connections = self
            .config
            .settings
            .max_connections
            .map(Resource::new)
            .unwrap_or_else(Resource::unlimited);

        let mut workers = Workers::new(
            self.config.settings.workers,
            self.metrics.clone(),
            global_connections,
            self.shutdown.clone(),
        );

        // Every worker gets every listener; the shared listen sockets let
        // the kernel spread accepts across them.
        for (index, listener_config) in self.config.listeners.iter().enumerate() {
            let info = ListenerInfo::from_config(listener_config, index as u64 + 1, workers.len())?;
            info!(
                listener = %listener_config.name,
                protocol = ?listener_config.protocol,
                address = %listener_config.address,
                "listener configured"
            );
            for worker in workers.iter() {
                let handler = worker.conn_handler().clone();
                let info = info.clone();
                worker.dispatcher().post(move || {
                    if let Err(e) = handler.add_listener(None, info) {
                        error!(error = %e, "failed to install listener");
                    }
                });
            }
        }

        info!(workers = workers.len(), "relayd running");

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for interrupt");
                }
                info!("shutting down");
                self.shutdown.signal();
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown requested");
            }
        }

        self.drain(&workers).await;
        workers.join_all();
        Ok(())
    }

    async fn drain(&self, workers: &Workers) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.settings.drain_timeout_ms);
        loop {
            let active: u64 = workers.iter().map(|w| w.conn_handler().num_connections()).sum();
            if active == 0 {
                info!("all connections drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                info!(active, "drain timeout reached with connections still active");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
