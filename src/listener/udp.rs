//! Active raw UDP listener: one read filter, one packet writer, and
//! datagram routing across workers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::{ListenSocket, ListenerInfo};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::filter::UdpListenerReadFilter;
use crate::network::{UdpPacketWriter, UdpRecvData};

use super::handler::ConnectionHandler;

const RECV_BUFFER_SIZE: usize = 65_535;

/// Routes datagrams to the sibling worker's listener when the destination
/// hook picks a different worker. Registration is advisory: a missing slot
/// drops the datagram.
pub struct UdpWorkerRouter {
    slots: Mutex<HashMap<usize, Weak<ActiveUdpListener>>>,
}

impl UdpWorkerRouter {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, worker_index: usize, listener: &Arc<ActiveUdpListener>) {
        self.slots
            .lock()
            .unwrap()
            .insert(worker_index, Arc::downgrade(listener));
    }

    fn unregister(&self, worker_index: usize) {
        self.slots.lock().unwrap().remove(&worker_index);
    }

    fn post_to(&self, worker_index: usize, data: UdpRecvData) -> bool {
        let target = self
            .slots
            .lock()
            .unwrap()
            .get(&worker_index)
            .and_then(Weak::upgrade);
        match target {
            Some(listener) => {
                listener.post(data);
                true
            }
            None => false,
        }
    }
}

impl Default for UdpWorkerRouter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ActiveUdpListener {
    name: String,
    tag: u64,
    worker_index: usize,
    info: Arc<ListenerInfo>,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<tokio::net::UdpSocket>>>,
    posted_tx: mpsc::UnboundedSender<UdpRecvData>,
    enabled: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveUdpListener {
    pub(crate) fn new(
        handler: &Arc<ConnectionHandler>,
        info: Arc<ListenerInfo>,
    ) -> Result<Arc<Self>> {
        let ListenSocket::Udp(listen_socket) = info.listen_socket() else {
            return Err(Error::Config(format!(
                "listener {:?} is not a UDP listener",
                info.name()
            )));
        };

        let std_socket = listen_socket.try_clone()?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(tokio::net::UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;

        let worker_index = handler.worker_index().unwrap_or(0);
        let (posted_tx, posted_rx) = mpsc::unbounded_channel();
        let (enabled, enabled_rx) = watch::channel(true);

        let listener = Arc::new(Self {
            name: info.name().to_string(),
            tag: info.tag(),
            worker_index,
            info: info.clone(),
            local_addr,
            socket: Mutex::new(Some(socket.clone())),
            posted_tx,
            enabled,
            task: Mutex::new(None),
        });

        let filter: Box<dyn UdpListenerReadFilter> = match info.udp_read_filter() {
            Some(factory) => (**factory)(),
            None => Box::new(crate::filter::UdpEchoFilter),
        };
        let task = Self::spawn_recv_task(
            handler.dispatcher(),
            socket,
            local_addr,
            Arc::downgrade(&listener),
            filter,
            posted_rx,
            enabled_rx,
        );
        *listener.task.lock().unwrap() = Some(task);

        info.udp_router().register(worker_index, &listener);

        debug!(listener = %listener.name, address = %local_addr, "udp listener active");
        Ok(listener)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_recv_task(
        dispatcher: &Arc<Dispatcher>,
        socket: Arc<tokio::net::UdpSocket>,
        local_addr: SocketAddr,
        listener: Weak<ActiveUdpListener>,
        mut filter: Box<dyn UdpListenerReadFilter>,
        mut posted_rx: mpsc::UnboundedReceiver<UdpRecvData>,
        mut enabled_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let writer = UdpPacketWriter::new(socket.clone());
        dispatcher.spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let is_enabled = *enabled_rx.borrow();
                tokio::select! {
                    posted = posted_rx.recv() => match posted {
                        Some(data) => {
                            if let Err(e) = filter.on_data(data, &writer).await {
                                debug!(error = %e, "udp read filter error");
                            }
                        }
                        None => return,
                    },
                    result = socket.recv_from(&mut buf), if is_enabled => match result {
                        Ok((len, peer_addr)) => {
                            let Some(active) = listener.upgrade() else { return };
                            let data = UdpRecvData {
                                local_addr,
                                peer_addr,
                                data: BytesMut::from(&buf[..len]),
                            };
                            let destination = active.destination(&data);
                            if destination == active.worker_index {
                                if let Err(e) = filter.on_data(data, &writer).await {
                                    debug!(error = %e, "udp read filter error");
                                }
                            } else if !active.info.udp_router().post_to(destination, data) {
                                debug!(
                                    listener = %active.name,
                                    destination,
                                    "dropping datagram: destination worker has no udp listener"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "udp receive error");
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
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Destination worker for a datagram. Routes to the current worker
    /// unless the listener carries an override hook.
    fn destination(&self, data: &UdpRecvData) -> usize {
        match self.info.udp_destination_picker() {
            Some(picker) => (**picker)(data) % self.info.concurrency().max(1),
            None => self.worker_index,
        }
    }

    /// Hand a datagram to this listener's worker.
    pub fn post(&self, data: UdpRecvData) {
        let _ = self.posted_tx.send(data);
    }

    pub(crate) fn pause(&self) {
        let _ = self.enabled.send(false);
    }

    pub(crate) fn resume(&self) {
        let _ = self.enabled.send(true);
    }

    /// The read filter (owned by the receive task) is released before the
    /// listener socket; it may reference the listener while shutting down.
    pub fn shutdown_listener(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        *self.socket.lock().unwrap() = None;
        self.info.udp_router().unregister(self.worker_index);
        debug!(listener = %self.name, "udp listener shut down");
    }
}
