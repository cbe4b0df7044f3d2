//! Server-side L4 connection.
//!
//! A [`Connection`] takes ownership of an accepted socket once the
//! pre-connection pipeline completes, drives the filter chain's network
//! filters over the byte stream, and reports exactly one terminal close
//! event to registered observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::dispatcher::Dispatcher;
use crate::filter::{NetworkFilter, NetworkFilterContext};

use super::{Address, ConnectionSocket, StreamInfo};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Terminal connection events. Exactly one is delivered per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer closed or the transport failed.
    RemoteClose,
    /// We closed via [`Connection::close`].
    LocalClose,
}

pub trait ConnectionCallbacks: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

pub struct Connection {
    id: u64,
    local_addr: Address,
    remote_addr: Address,
    stream_info: StreamInfo,
    socket: Mutex<Option<ConnectionSocket>>,
    filters: Mutex<Option<Vec<Box<dyn NetworkFilter>>>>,
    callbacks: Mutex<Vec<Arc<dyn ConnectionCallbacks>>>,
    close_notify: Notify,
    close_requested: AtomicBool,
    event_fired: AtomicBool,
}

impl Connection {
    pub fn new(
        id: u64,
        socket: ConnectionSocket,
        stream_info: StreamInfo,
        filters: Vec<Box<dyn NetworkFilter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            local_addr: socket.local_addr().clone(),
            remote_addr: socket.remote_addr().clone(),
            stream_info,
            socket: Mutex::new(Some(socket)),
            filters: Mutex::new(Some(filters)),
            callbacks: Mutex::new(Vec::new()),
            close_notify: Notify::new(),
            close_requested: AtomicBool::new(false),
            event_fired: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream info captured through the pre-connection pipeline, including
    /// any dynamic metadata set by listener filters.
    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Address {
        &self.remote_addr
    }

    /// Register an observer. Must happen before [`Connection::start`] to
    /// guarantee delivery of the terminal event.
    pub fn add_callbacks(&self, callbacks: Arc<dyn ConnectionCallbacks>) {
        self.callbacks.lock().unwrap().push(callbacks);
    }

    /// Request a local close. Idempotent; the `LocalClose` event is
    /// delivered from the io driver, not inline.
    pub fn close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.close_notify.notify_one();
    }

    /// Spawn the io driver on the dispatcher.
    pub fn start(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let conn = self.clone();
        dispatcher.spawn(async move { conn.drive().await });
    }

    fn fire(&self, event: ConnectionEvent) {
        if self.event_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(id = self.id, ?event, "connection event");
        let callbacks = self.callbacks.lock().unwrap().clone();
        for cb in callbacks {
            cb.on_event(event);
        }
    }

    async fn drive(self: Arc<Self>) {
        let Some(mut socket) = self.socket.lock().unwrap().take() else {
            return;
        };
        let mut filters = self.filters.lock().unwrap().take().unwrap_or_default();

        for filter in &mut filters {
            if let Err(e) = filter.on_new_connection().await {
                debug!(id = self.id, error = %e, "network filter rejected connection");
                self.fire(ConnectionEvent::LocalClose);
                return;
            }
        }

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            if self.close_requested.load(Ordering::Acquire) {
                self.fire(ConnectionEvent::LocalClose);
                return;
            }
            tokio::select! {
                _ = self.close_notify.notified() => {
                    self.fire(ConnectionEvent::LocalClose);
                    return;
                }
                result = socket.io_mut().read_buf(&mut buf) => match result {
                    Ok(0) => {
                        self.fire(ConnectionEvent::RemoteClose);
                        return;
                    }
                    Ok(_) => {
                        let mut cx = NetworkFilterContext { io: socket.io_mut() };
                        for filter in &mut filters {
                            if let Err(e) = filter.on_data(&mut buf, &mut cx).await {
                                debug!(id = self.id, error = %e, "network filter error");
                                self.fire(ConnectionEvent::RemoteClose);
                                return;
                            }
                        }
                        buf.clear();
                    }
                    Err(e) => {
                        trace!(id = self.id, error = %e, "read error");
                        self.fire(ConnectionEvent::RemoteClose);
                        return;
                    }
                }
            }
        }
    }
}
