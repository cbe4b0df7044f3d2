//! Per-worker connection handler: the control surface owning every active
//! listener bound to one worker thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::{FilterChain, ListenSocket, ListenerInfo};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::limit::Resource;
use crate::network::Address;
use crate::telemetry::Metrics;

use super::internal::ActiveInternalListener;
use super::tcp::ActiveTcpListener;
use super::udp::ActiveUdpListener;

/// The typed listener variant held by one [`ListenerDetails`].
#[derive(Clone)]
pub(crate) enum ActiveListenerKind {
    Tcp(Arc<ActiveTcpListener>),
    Internal(Arc<ActiveInternalListener>),
    Udp(Arc<ActiveUdpListener>),
}

impl ActiveListenerKind {
    fn tag(&self) -> u64 {
        match self {
            ActiveListenerKind::Tcp(l) => l.tag(),
            ActiveListenerKind::Internal(l) => l.tag(),
            ActiveListenerKind::Udp(l) => l.tag(),
        }
    }

    fn shutdown(&self) {
        match self {
            ActiveListenerKind::Tcp(l) => l.shutdown(),
            ActiveListenerKind::Internal(l) => l.shutdown(),
            ActiveListenerKind::Udp(l) => l.shutdown_listener(),
        }
    }
}

/// One entry in the handler's listener list.
pub(crate) struct ListenerDetails {
    pub(crate) kind: ActiveListenerKind,
}

pub struct ConnectionHandler {
    dispatcher: Arc<Dispatcher>,
    worker_index: Option<usize>,
    per_handler_stat_prefix: String,
    metrics: Arc<Metrics>,
    global_connections: Resource,
    listeners: Mutex<Vec<(Address, ListenerDetails)>>,
    num_handler_connections: AtomicU64,
    disable_listeners: AtomicBool,
}

impl ConnectionHandler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        worker_index: Option<usize>,
        metrics: Arc<Metrics>,
        global_connections: Resource,
    ) -> Arc<Self> {
        let per_handler_stat_prefix = match worker_index {
            Some(index) => format!("worker_{index}"),
            None => "main_thread".to_string(),
        };
        Arc::new(Self {
            dispatcher,
            worker_index,
            per_handler_stat_prefix,
            metrics,
            global_connections,
            listeners: Mutex::new(Vec::new()),
            num_handler_connections: AtomicU64::new(0),
            disable_listeners: AtomicBool::new(false),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn worker_index(&self) -> Option<usize> {
        self.worker_index
    }

    pub fn stat_prefix(&self) -> &str {
        &self.per_handler_stat_prefix
    }

    pub(crate) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn global_connections(&self) -> &Resource {
        &self.global_connections
    }

    pub fn num_connections(&self) -> u64 {
        self.num_handler_connections.load(Ordering::Relaxed)
    }

    pub fn inc_num_connections(&self) {
        self.num_handler_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_num_connections(&self) {
        let _ = self
            .num_handler_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }

    /// Install a listener on this worker. With `overridden_tag` naming an
    /// existing TCP or internal listener, the config is replaced in place:
    /// the accepting source, in-flight sockets, buckets and counters are
    /// preserved, and only sockets accepted from now on see the new config.
    pub fn add_listener(
        self: &Arc<Self>,
        overridden_tag: Option<u64>,
        info: Arc<ListenerInfo>,
    ) -> Result<()> {
        if let Some(tag) = overridden_tag {
            let existing = self.find_by_tag(tag);
            if let Some(kind) = existing {
                return match kind {
                    ActiveListenerKind::Tcp(l) => {
                        l.update_info(info);
                        Ok(())
                    }
                    ActiveListenerKind::Internal(l) => {
                        l.update_info(info);
                        Ok(())
                    }
                    ActiveListenerKind::Udp(_) => {
                        Err(Error::UnsupportedReplacement(info.name().to_string()))
                    }
                };
            }
        }

        if self.find_by_tag(info.tag()).is_some() {
            return Err(Error::DuplicateListener(info.tag()));
        }

        let (address, kind) = match info.listen_socket() {
            ListenSocket::Tcp(_) => {
                let listener = ActiveTcpListener::new(self, info.clone())?;
                if self.disable_listeners.load(Ordering::Acquire) {
                    listener.pause();
                }
                (
                    Address::Socket(listener.local_addr()),
                    ActiveListenerKind::Tcp(listener),
                )
            }
            ListenSocket::Internal(id) => {
                let address = Address::Internal {
                    listener_id: id.clone(),
                    endpoint_id: "listener".to_string(),
                };
                let listener = ActiveInternalListener::new(self, info.clone())?;
                if self.disable_listeners.load(Ordering::Acquire) {
                    listener.pause();
                }
                (address, ActiveListenerKind::Internal(listener))
            }
            ListenSocket::Udp(_) => {
                let listener = ActiveUdpListener::new(self, info.clone())?;
                (
                    Address::Socket(listener.local_addr()),
                    ActiveListenerKind::Udp(listener),
                )
            }
        };

        info!(
            worker = %self.per_handler_stat_prefix,
            listener = %info.name(),
            tag = info.tag(),
            address = %address,
            "listener added"
        );
        self.listeners
            .lock()
            .unwrap()
            .push((address, ListenerDetails { kind }));
        Ok(())
    }

    /// Remove every listener with this tag. The accepting sources are
    /// released immediately; in-flight sockets and existing connections run
    /// to completion.
    pub fn remove_listeners(self: &Arc<Self>, listener_tag: u64) {
        let mut removed = Vec::new();
        self.listeners.lock().unwrap().retain(|(_, details)| {
            if details.kind.tag() == listener_tag {
                removed.push(details.kind.clone());
                false
            } else {
                true
            }
        });
        for kind in removed {
            kind.shutdown();
            self.dispatcher.defer_delete(Box::new(kind));
        }
    }

    /// Drain the given filter-chain instances on the named listener.
    /// `completion` runs via the dispatcher once every connection rooted in
    /// those chains has been destroyed; it never runs inline.
    pub fn remove_filter_chains(
        &self,
        listener_tag: u64,
        chains: &[Arc<FilterChain>],
        completion: impl FnOnce() + Send + 'static,
    ) {
        match self.find_by_tag(listener_tag) {
            Some(ActiveListenerKind::Tcp(l)) => {
                l.deferred_remove_filter_chains(chains, Box::new(completion));
            }
            Some(ActiveListenerKind::Internal(l)) => {
                l.deferred_remove_filter_chains(chains, Box::new(completion));
            }
            _ => {
                warn!(tag = listener_tag, "no stream listener to drain filter chains on");
                self.dispatcher.post(completion);
            }
        }
    }

    /// Stop accepting on the named listener. Existing connections survive.
    pub fn stop_listeners(&self, listener_tag: u64) {
        let listeners = self.listeners.lock().unwrap();
        for (_, details) in listeners.iter() {
            if details.kind.tag() == listener_tag {
                details.kind.shutdown();
            }
        }
    }

    /// Stop accepting on every listener. Existing connections survive.
    pub fn stop_listeners_all(&self) {
        let listeners = self.listeners.lock().unwrap();
        for (_, details) in listeners.iter() {
            details.kind.shutdown();
        }
    }

    /// Pause accepting on all TCP and internal listeners. Sticky: listeners
    /// added while disabled start paused.
    pub fn disable_listeners(&self) {
        self.disable_listeners.store(true, Ordering::Release);
        let listeners = self.listeners.lock().unwrap();
        for (_, details) in listeners.iter() {
            match &details.kind {
                ActiveListenerKind::Tcp(l) => l.pause(),
                ActiveListenerKind::Internal(l) => l.pause(),
                ActiveListenerKind::Udp(_) => {}
            }
        }
    }

    pub fn enable_listeners(&self) {
        self.disable_listeners.store(false, Ordering::Release);
        let listeners = self.listeners.lock().unwrap();
        for (_, details) in listeners.iter() {
            match &details.kind {
                ActiveListenerKind::Tcp(l) => l.resume(),
                ActiveListenerKind::Internal(l) => l.resume(),
                ActiveListenerKind::Udp(_) => {}
            }
        }
    }

    /// Typed accessor for the UDP variant.
    pub fn get_udp_listener_callbacks(&self, listener_tag: u64) -> Option<Arc<ActiveUdpListener>> {
        match self.find_by_tag(listener_tag) {
            Some(ActiveListenerKind::Udp(l)) => Some(l),
            _ => None,
        }
    }

    /// Look up a TCP listener by address. An exact address+port match wins;
    /// failing that, an any-address listener on the same port matches.
    pub fn find_tcp_listener_by_address(&self, addr: SocketAddr) -> Option<Arc<ActiveTcpListener>> {
        let listeners = self.listeners.lock().unwrap();

        for (address, details) in listeners.iter() {
            if let ActiveListenerKind::Tcp(l) = &details.kind {
                if address.socket_addr() == Some(addr) {
                    return Some(l.clone());
                }
            }
        }

        listeners.iter().find_map(|(address, details)| match &details.kind {
            ActiveListenerKind::Tcp(l)
                if address.is_any() && address.port() == Some(addr.port()) =>
            {
                Some(l.clone())
            }
            _ => None,
        })
    }

    fn find_by_tag(&self, listener_tag: u64) -> Option<ActiveListenerKind> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .find(|(_, details)| details.kind.tag() == listener_tag)
            .map(|(_, details)| details.kind.clone())
    }
}
