//! State shared by the stream-oriented (TCP and internal) active listeners:
//! per-listener stats and counters, the current config, the filter-chain
//! buckets, and chain draining.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::config::{FilterChain, ListenerInfo};
use crate::dispatcher::Dispatcher;
use crate::limit::Resource;
use crate::network::{Connection, ConnectionSocket, DynamicMetadata, StreamInfo};
use crate::telemetry::{ListenerStats, PerHandlerStats, Timespan};

use super::handler::ConnectionHandler;
use super::socket::ActiveSocket;
use super::{ActiveConnection, ActiveConnections};

/// Buckets key off the filter chain *instance*, so a hot-replaced config's
/// same-named chain drains independently of its successor.
pub(crate) type ChainKey = usize;

pub(crate) fn chain_key(chain: &Arc<FilterChain>) -> ChainKey {
    Arc::as_ptr(chain) as usize
}

struct DrainWaiter {
    remaining: HashSet<ChainKey>,
    completion: Option<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct StreamListenerCore {
    name: String,
    tag: u64,
    handler: Weak<ConnectionHandler>,
    dispatcher: Arc<Dispatcher>,
    info: Mutex<Arc<ListenerInfo>>,
    pub(crate) stats: ListenerStats,
    per_handler_stats: PerHandlerStats,
    /// Captured at listener creation; hot replacement preserves the limiter
    /// along with the counters.
    open_connections: Resource,
    pub(crate) global_connections: Resource,
    connections_by_chain: Mutex<HashMap<ChainKey, Arc<ActiveConnections>>>,
    drain_waiters: Mutex<Vec<DrainWaiter>>,
    num_listener_connections: AtomicU64,
    is_deleting: AtomicBool,
    next_connection_id: AtomicU64,
}

impl StreamListenerCore {
    pub(crate) fn new(handler: &Arc<ConnectionHandler>, info: Arc<ListenerInfo>) -> Arc<Self> {
        let metrics = handler.metrics();
        let stats = metrics.listener_stats(info.name());
        let per_handler_stats = metrics.per_handler_stats(info.name(), handler.stat_prefix());

        Arc::new(Self {
            name: info.name().to_string(),
            tag: info.tag(),
            handler: Arc::downgrade(handler),
            dispatcher: handler.dispatcher().clone(),
            open_connections: info.open_connections().clone(),
            global_connections: handler.global_connections().clone(),
            info: Mutex::new(info),
            stats,
            per_handler_stats,
            connections_by_chain: Mutex::new(HashMap::new()),
            drain_waiters: Mutex::new(Vec::new()),
            num_listener_connections: AtomicU64::new(0),
            is_deleting: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn tag(&self) -> u64 {
        self.tag
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Current config snapshot. Sockets accepted after a hot replacement see
    /// the new config; in-flight sockets keep the snapshot they were
    /// accepted under.
    pub(crate) fn info(&self) -> Arc<ListenerInfo> {
        self.info.lock().unwrap().clone()
    }

    pub(crate) fn update_info(&self, info: Arc<ListenerInfo>) {
        debug!(listener = %self.name, tag = self.tag, "listener config replaced in place");
        *self.info.lock().unwrap() = info;
    }

    pub(crate) fn set_deleting(&self) {
        self.is_deleting.store(true, Ordering::Release);
    }

    pub(crate) fn is_deleting(&self) -> bool {
        self.is_deleting.load(Ordering::Acquire)
    }

    pub(crate) fn num_listener_connections(&self) -> u64 {
        self.num_listener_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_num_connections(&self) {
        self.num_listener_connections.fetch_add(1, Ordering::Relaxed);
        self.open_connections.inc();
    }

    pub(crate) fn dec_num_connections(&self) {
        let _ = self
            .num_listener_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
        self.open_connections.dec();
    }

    pub(crate) fn open_connections(&self) -> &Resource {
        &self.open_connections
    }

    fn on_new_connection(&self) {
        self.stats.downstream_cx_total.inc();
        self.stats.downstream_cx_active.inc();
        self.per_handler_stats.downstream_cx_total.inc();
        self.per_handler_stats.downstream_cx_active.inc();
        // The per-listener count was committed on the accept path; only the
        // handler-wide count moves here.
        if let Some(handler) = self.handler.upgrade() {
            handler.inc_num_connections();
        }
    }

    fn on_destroy_connection(&self) {
        self.stats.downstream_cx_active.dec();
        self.stats.downstream_cx_destroy.inc();
        self.per_handler_stats.downstream_cx_active.dec();
        self.dec_num_connections();
        if let Some(handler) = self.handler.upgrade() {
            handler.dec_num_connections();
        }
    }

    /// Start the pre-connection pipeline for a socket whose per-listener
    /// count has already been committed by the caller.
    pub(crate) fn spawn_pipeline(
        self: &Arc<Self>,
        socket: ConnectionSocket,
        hand_off_restored_destinations: bool,
        rebalanced: bool,
        metadata: Option<DynamicMetadata>,
    ) {
        if self.is_deleting() {
            // Listener went away while the socket was in flight (e.g. a
            // rebalance landing after removal). Reconcile the commitment.
            debug!(listener = %self.name, "dropping socket posted to a deleting listener");
            self.dec_num_connections();
            return;
        }
        let info = self.info();
        let active = ActiveSocket::new(
            self.clone(),
            info,
            socket,
            hand_off_restored_destinations,
            rebalanced,
            metadata,
        );
        self.dispatcher.spawn(active.run());
    }

    /// Select a filter chain and promote the socket to a live connection.
    pub(crate) fn new_connection(
        self: &Arc<Self>,
        socket: ConnectionSocket,
        stream_info: StreamInfo,
        info: &ListenerInfo,
    ) {
        let Some(chain) = info.filter_chain_manager().find(&socket) else {
            debug!(
                listener = %self.name,
                remote = %socket.remote_addr(),
                "closing connection: no matching filter chain found"
            );
            self.stats.no_filter_chain_match.inc();
            self.dec_num_connections();
            return;
        };

        let bucket = self.get_or_create_active_connections(&chain);
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, socket, stream_info, chain.create_network_filters());
        let active = ActiveConnection::new(
            id,
            self.clone(),
            &bucket,
            connection.clone(),
            Timespan::new(self.stats.downstream_cx_length_ms.clone()),
        );
        connection.add_callbacks(active.clone());
        bucket.connections.lock().unwrap().insert(id, active);
        self.on_new_connection();
        connection.start(&self.dispatcher);

        debug!(
            listener = %self.name,
            id,
            chain = chain.name(),
            remote = %connection.remote_addr(),
            "new connection"
        );
    }

    fn get_or_create_active_connections(
        self: &Arc<Self>,
        chain: &Arc<FilterChain>,
    ) -> Arc<ActiveConnections> {
        self.connections_by_chain
            .lock()
            .unwrap()
            .entry(chain_key(chain))
            .or_insert_with(|| ActiveConnections::new(chain.clone()))
            .clone()
    }

    /// Destroy one connection: stop its length timespan, settle the stats
    /// and counters, unlink it from its bucket and defer the deletions.
    pub(crate) fn remove_connection(
        self: &Arc<Self>,
        bucket: &Arc<ActiveConnections>,
        conn: &ActiveConnection,
    ) {
        debug!(
            listener = %self.name,
            id = conn.id,
            remote = %conn.connection.remote_addr(),
            "connection destroyed"
        );

        if let Some(timespan) = conn.conn_length.lock().unwrap().take() {
            timespan.complete();
        }
        self.on_destroy_connection();

        let (removed, empty) = {
            let mut connections = bucket.connections.lock().unwrap();
            let removed = connections.remove(&conn.id);
            (removed, connections.is_empty())
        };
        if let Some(removed) = removed {
            self.dispatcher.defer_delete(Box::new(removed));
        }
        if empty && bucket.draining.load(Ordering::Acquire) {
            self.destroy_bucket(bucket);
        }
    }

    /// Mark the given chains' buckets as draining and force-close everything
    /// in them. The completion runs via the dispatcher once every connection
    /// rooted in those buckets has been destroyed; never inline.
    pub(crate) fn deferred_remove_filter_chains(
        self: &Arc<Self>,
        chains: &[Arc<FilterChain>],
        completion: Box<dyn FnOnce() + Send>,
    ) {
        let mut buckets = Vec::new();
        {
            let map = self.connections_by_chain.lock().unwrap();
            for chain in chains {
                if let Some(bucket) = map.get(&chain_key(chain)) {
                    buckets.push(bucket.clone());
                }
            }
        }

        if buckets.is_empty() {
            self.dispatcher.post(completion);
            return;
        }

        let remaining: HashSet<ChainKey> = buckets.iter().map(|b| chain_key(&b.chain)).collect();
        self.drain_waiters.lock().unwrap().push(DrainWaiter {
            remaining,
            completion: Some(completion),
        });

        for bucket in buckets {
            bucket.draining.store(true, Ordering::Release);
            let connections: Vec<Arc<ActiveConnection>> = bucket
                .connections
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            if connections.is_empty() {
                self.destroy_bucket(&bucket);
            } else {
                debug!(
                    listener = %self.name,
                    chain = bucket.chain.name(),
                    connections = connections.len(),
                    "draining filter chain"
                );
                for conn in connections {
                    conn.connection.close();
                }
            }
        }
    }

    fn destroy_bucket(self: &Arc<Self>, bucket: &Arc<ActiveConnections>) {
        let key = chain_key(&bucket.chain);
        if let Some(removed) = self.connections_by_chain.lock().unwrap().remove(&key) {
            self.dispatcher.defer_delete(Box::new(removed));
        }
        self.notify_bucket_drained(key);
    }

    fn notify_bucket_drained(&self, key: ChainKey) {
        let mut fire = Vec::new();
        {
            let mut waiters = self.drain_waiters.lock().unwrap();
            waiters.retain_mut(|waiter| {
                waiter.remaining.remove(&key);
                if waiter.remaining.is_empty() {
                    if let Some(completion) = waiter.completion.take() {
                        fire.push(completion);
                    }
                    false
                } else {
                    true
                }
            });
        }
        for completion in fire {
            self.dispatcher.post(completion);
        }
    }
}
