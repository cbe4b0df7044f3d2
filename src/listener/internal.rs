//! Active internal listener: accepts sockets handed off in-process through
//! the dispatcher registry instead of from the kernel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::config::{FilterChain, ListenSocket, ListenerInfo};
use crate::dispatcher::InternalListenerCallbacks;
use crate::error::{Error, Result};
use crate::network::{ConnectionSocket, DynamicMetadata};

use super::handler::ConnectionHandler;
use super::StreamListenerCore;

pub struct ActiveInternalListener {
    pub(crate) core: Arc<StreamListenerCore>,
    listener_id: String,
    /// The underlying primitive has no enable/disable; pausing instead
    /// queues hand-offs here and replays them on resume.
    disabled: AtomicBool,
    pending: Mutex<Vec<(ConnectionSocket, DynamicMetadata)>>,
}

impl ActiveInternalListener {
    pub(crate) fn new(
        handler: &Arc<ConnectionHandler>,
        info: Arc<ListenerInfo>,
    ) -> Result<Arc<Self>> {
        let ListenSocket::Internal(listener_id) = info.listen_socket() else {
            return Err(Error::Config(format!(
                "listener {:?} is not an internal listener",
                info.name()
            )));
        };
        let listener_id = listener_id.clone();

        let listener = Arc::new(Self {
            core: StreamListenerCore::new(handler, info),
            listener_id: listener_id.clone(),
            disabled: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        });

        // Id collisions are a configuration error and reject the listener.
        let callbacks: Weak<dyn InternalListenerCallbacks> =
            Arc::downgrade(&(listener.clone() as Arc<dyn InternalListenerCallbacks>));
        handler
            .dispatcher()
            .register_internal_listener(&listener_id, callbacks)?;

        debug!(
            listener = %listener.core.name(),
            id = %listener_id,
            "internal listener active"
        );
        Ok(listener)
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn tag(&self) -> u64 {
        self.core.tag()
    }

    /// Connections currently owned by this worker's listener, including
    /// sockets still in the pre-connection pipeline.
    pub fn num_connections(&self) -> u64 {
        self.core.num_listener_connections()
    }

    fn accept_socket(&self, mut socket: ConnectionSocket, metadata: DynamicMetadata) {
        // A socket that travelled here via hand-off already holds its global
        // slot; freshly created internal sockets are admitted now.
        if !socket.has_conn_guard() {
            match self.core.global_connections.try_acquire() {
                Some(guard) => socket.set_conn_guard(guard),
                None => {
                    debug!(
                        listener = %self.core.name(),
                        "rejecting internal socket: global connection limit reached"
                    );
                    self.core.stats.downstream_global_cx_overflow.inc();
                    return;
                }
            }
        }

        if !self.core.open_connections().can_create() {
            debug!(
                listener = %self.core.name(),
                "rejecting internal socket: listener connection limit reached"
            );
            self.core.stats.downstream_cx_overflow.inc();
            return;
        }

        self.core.inc_num_connections();
        self.core.spawn_pipeline(socket, false, false, Some(metadata));
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

    /// Queue hand-offs instead of refusing peers.
    pub(crate) fn pause(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// Replay queued hand-offs through the dispatcher.
    pub(crate) fn resume(self: &Arc<Self>) {
        self.disabled.store(false, Ordering::Release);
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        debug!(
            listener = %self.core.name(),
            queued = pending.len(),
            "replaying hand-offs queued while paused"
        );
        for (socket, metadata) in pending {
            let listener = self.clone();
            self.core
                .dispatcher()
                .post(move || listener.accept_socket(socket, metadata));
        }
    }

    /// Unregister from the dispatcher registry. Queued hand-offs are
    /// dropped; in-flight sockets and connections keep running.
    pub(crate) fn shutdown(&self) {
        self.core.set_deleting();
        self.core
            .dispatcher()
            .unregister_internal_listener(&self.listener_id);
        let dropped = std::mem::take(&mut *self.pending.lock().unwrap());
        if !dropped.is_empty() {
            debug!(
                listener = %self.core.name(),
                dropped = dropped.len(),
                "dropping hand-offs queued on a shut down internal listener"
            );
        }
    }
}

impl InternalListenerCallbacks for ActiveInternalListener {
    fn on_new_socket(&self, socket: ConnectionSocket, metadata: DynamicMetadata) {
        if self.disabled.load(Ordering::Acquire) {
            debug!(
                listener = %self.core.name(),
                "internal listener paused, queueing hand-off"
            );
            self.pending.lock().unwrap().push((socket, metadata));
            return;
        }
        self.accept_socket(socket, metadata);
    }
}
