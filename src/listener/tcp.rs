//! Active TCP listener: kernel accept loop, admission, balancing and the
//! `BalancedConnectionHandler` surface used for cross-worker hand-off.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::balance::{same_handler, BalancedConnectionHandler, ConnectionBalancer};
use crate::config::{FilterChain, ListenSocket, ListenerInfo};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::network::ConnectionSocket;

use super::handler::ConnectionHandler;
use super::StreamListenerCore;

pub struct ActiveTcpListener {
    pub(crate) core: Arc<StreamListenerCore>,
    local_addr: SocketAddr,
    balancer: Arc<dyn ConnectionBalancer>,
    source: Mutex<Option<TcpAcceptSource>>,
}

impl ActiveTcpListener {
    pub(crate) fn new(
        handler: &Arc<ConnectionHandler>,
        info: Arc<ListenerInfo>,
    ) -> Result<Arc<Self>> {
        let ListenSocket::Tcp(listen_socket) = info.listen_socket() else {
            return Err(Error::Config(format!(
                "listener {:?} is not a TCP listener",
                info.name()
            )));
        };

        // Each worker accepts on its own dup of the shared listen socket.
        let std_listener = listen_socket.try_clone()?;
        std_listener.set_nonblocking(true)?;
        let tokio_listener = tokio::net::TcpListener::from_std(std_listener)?;
        let local_addr = tokio_listener.local_addr()?;

        let balancer = info.balancer().clone();
        let listener = Arc::new(Self {
            core: StreamListenerCore::new(handler, info),
            local_addr,
            balancer,
            source: Mutex::new(None),
        });

        let source = TcpAcceptSource::spawn(
            listener.core.dispatcher(),
            tokio_listener,
            Arc::downgrade(&listener),
        );
        *listener.source.lock().unwrap() = Some(source);

        listener
            .balancer
            .register_handler(listener.clone() as Arc<dyn BalancedConnectionHandler>);

        debug!(
            listener = %listener.core.name(),
            address = %local_addr,
            "tcp listener active"
        );
        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tag(&self) -> u64 {
        self.core.tag()
    }

    /// Connections currently owned by this worker's listener, including
    /// sockets still in the pre-connection pipeline.
    pub fn num_connections(&self) -> u64 {
        self.core.num_listener_connections()
    }

    /// Entry point from the accept source.
    pub(crate) fn on_accept(self: &Arc<Self>, mut socket: ConnectionSocket) {
        // Global admission first.
        if !socket.has_conn_guard() {
            match self.core.global_connections.try_acquire() {
                Some(guard) => socket.set_conn_guard(guard),
                None => {
                    debug!(
                        listener = %self.core.name(),
                        remote = %socket.remote_addr(),
                        "rejecting connection: global connection limit reached"
                    );
                    self.core.stats.downstream_global_cx_overflow.inc();
                    return;
                }
            }
        }

        // Then the per-listener limit.
        if !self.core.open_connections().can_create() {
            debug!(
                listener = %self.core.name(),
                remote = %socket.remote_addr(),
                "rejecting connection: listener connection limit reached"
            );
            self.core.stats.downstream_cx_overflow.inc();
            return;
        }

        let current: Arc<dyn BalancedConnectionHandler> = self.clone();
        let target = self.balancer.pick_target_handler(&current);
        if !same_handler(&target, &current) {
            // Commit locally while the socket is in transit, then transfer
            // the count to the destination worker. Counts briefly
            // double-count during the window; balancers treat them as hints.
            self.core.inc_num_connections();
            target.post(socket);
            self.core.dec_num_connections();
            return;
        }

        self.core.inc_num_connections();
        let hand_off = self.core.info().hand_off_restored_destinations();
        self.on_accept_worker(socket, hand_off, false);
    }

    pub(crate) fn on_accept_worker(
        &self,
        socket: ConnectionSocket,
        hand_off_restored_destinations: bool,
        rebalanced: bool,
    ) {
        self.core
            .spawn_pipeline(socket, hand_off_restored_destinations, rebalanced, None);
    }

    pub(crate) fn update_info(&self, info: Arc<ListenerInfo>) {
        self.core.update_info(info);
    }

    pub(crate) fn deferred_remove_filter_chains(
        &self,
        chains: &[Arc<FilterChain>],
        completion: Box<dyn FnOnce() + Send>,
    ) {
        self.core.deferred_remove_filter_chains(chains, completion);
    }

    pub(crate) fn pause(&self) {
        if let Some(source) = &*self.source.lock().unwrap() {
            source.pause();
        }
    }

    pub(crate) fn resume(&self) {
        if let Some(source) = &*self.source.lock().unwrap() {
            source.resume();
        }
    }

    /// Release the accepting source. In-flight sockets and existing
    /// connections keep running.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        self.core.set_deleting();
        let current: Arc<dyn BalancedConnectionHandler> = self.clone();
        self.balancer.unregister_handler(&current);
        if let Some(source) = self.source.lock().unwrap().take() {
            drop(source);
            debug!(listener = %self.core.name(), "tcp listener shut down");
        }
    }
}

impl BalancedConnectionHandler for ActiveTcpListener {
    fn num_connections(&self) -> u64 {
        self.core.num_listener_connections()
    }

    fn inc_num_connections(&self) {
        self.core.inc_num_connections();
    }

    /// Called on the source worker with a socket rebalanced to this
    /// listener's worker. The destination increments when it dequeues.
    fn post(&self, socket: ConnectionSocket) {
        let core = self.core.clone();
        self.core.dispatcher().post(move || {
            core.inc_num_connections();
            core.spawn_pipeline(socket, false, true, None);
        });
    }
}

/// Accept loop over one worker's dup of the listen socket, with
/// pause/resume.
struct TcpAcceptSource {
    enabled: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpAcceptSource {
    fn spawn(
        dispatcher: &Arc<Dispatcher>,
        listener: tokio::net::TcpListener,
        callbacks: Weak<ActiveTcpListener>,
    ) -> Self {
        let (enabled, mut enabled_rx) = watch::channel(true);

        let task = dispatcher.spawn(async move {
            loop {
                if !*enabled_rx.borrow() {
                    if enabled_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            let Some(active) = callbacks.upgrade() else { return };
                            let local_addr = match stream.local_addr() {
                                Ok(addr) => addr,
                                Err(e) => {
                                    warn!(error = %e, "failed to read accepted socket address");
                                    continue;
                                }
                            };
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(error = %e, "failed to set TCP_NODELAY");
                            }
                            active.on_accept(ConnectionSocket::new_tcp(
                                stream, local_addr, peer_addr,
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                    changed = enabled_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self { enabled, task }
    }

    fn pause(&self) {
        let _ = self.enabled.send(false);
    }

    fn resume(&self) {
        let _ = self.enabled.send(true);
    }
}

impl Drop for TcpAcceptSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}
