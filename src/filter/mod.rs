//! Filter traits: pre-connection listener filters, L4 network filters and
//! UDP read filters, plus the stock implementations shipped with the daemon.

mod echo;
mod handoff;
mod proxy_protocol;
mod server_name;
mod udp_echo;

pub use echo::{BlackholeFilter, EchoFilter};
pub use handoff::InternalHandoffFilter;
pub use proxy_protocol::ProxyProtocolFilter;
pub use server_name::ServerNameFilter;
pub use udp_echo::UdpEchoFilter;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::dispatcher::Dispatcher;
use crate::network::{ConnectionSocket, DynamicMetadata, SocketIo, StreamInfo, UdpPacketWriter, UdpRecvData};

/// Outcome of one listener filter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Advance to the next filter.
    Continue,
    /// Suspend the chain on this filter until `continue_filter_chain` is
    /// called through a [`FilterChainResumer`].
    StopIteration,
}

pub(crate) struct ResumeMessage {
    pub(crate) index: usize,
    pub(crate) success: bool,
}

/// Handle a suspended filter uses to resume (or abort) its pipeline.
///
/// Safe to invoke from inside `on_accept` before returning
/// `StopIteration`, from a spawned task, or from a timer: delivery goes
/// through the socket's resume queue, never by direct recursion. A resumer
/// outliving its pipeline position becomes a no-op.
#[derive(Clone)]
pub struct FilterChainResumer {
    pub(crate) tx: mpsc::UnboundedSender<ResumeMessage>,
    pub(crate) index: usize,
}

impl FilterChainResumer {
    /// Resume the chain. `false` aborts the pipeline and closes the socket
    /// without creating a connection.
    pub fn continue_filter_chain(&self, success: bool) {
        let _ = self.tx.send(ResumeMessage {
            index: self.index,
            success,
        });
    }
}

/// Callbacks available to a listener filter while it runs.
pub struct ListenerFilterContext<'a> {
    pub(crate) socket: &'a mut ConnectionSocket,
    pub(crate) stream_info: &'a mut StreamInfo,
    pub(crate) resumer: FilterChainResumer,
    pub(crate) dispatcher: &'a Arc<Dispatcher>,
    pub(crate) handoff: &'a mut Option<String>,
}

impl<'a> ListenerFilterContext<'a> {
    pub fn socket(&mut self) -> &mut ConnectionSocket {
        &mut *self.socket
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &*self.stream_info
    }

    /// Merge a value into the pre-connection dynamic metadata; visible to
    /// subsequent filters and to the eventual connection.
    pub fn set_dynamic_metadata(&mut self, namespace: &str, value: serde_json::Value) {
        self.stream_info.set_dynamic_metadata(namespace, value);
    }

    pub fn dynamic_metadata(&self) -> &DynamicMetadata {
        self.stream_info.dynamic_metadata()
    }

    /// Obtain a resumer for this filter's pipeline position.
    pub fn resumer(&self) -> FilterChainResumer {
        self.resumer.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.dispatcher
    }

    /// Ask the pipeline to hand this socket off to an internal listener once
    /// the filter returns. No connection is created on the current listener.
    pub fn request_internal_handoff(&mut self, listener_id: impl Into<String>) {
        *self.handoff = Some(listener_id.into());
    }
}

/// A pre-connection (listener) filter: inspects a raw accepted socket before
/// any connection object exists.
#[async_trait]
pub trait ListenerFilter: Send {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus>;
}

/// Decides whether a listener filter applies to a given socket. A filter
/// whose matcher declines is skipped and the cursor advances.
pub trait ListenerFilterMatcher: Send + Sync {
    fn applies(&self, socket: &ConnectionSocket) -> bool;
}

/// Matches every socket.
pub struct AnyMatcher;

impl ListenerFilterMatcher for AnyMatcher {
    fn applies(&self, _socket: &ConnectionSocket) -> bool {
        true
    }
}

/// Applies a filter only to sockets accepted on one destination port.
pub struct DestinationPortMatcher {
    pub port: u16,
}

impl ListenerFilterMatcher for DestinationPortMatcher {
    fn applies(&self, socket: &ConnectionSocket) -> bool {
        socket.local_addr().port() == Some(self.port)
    }
}

/// Creates one listener filter instance per accepted socket.
pub trait ListenerFilterFactory: Send + Sync {
    fn create(&self) -> Box<dyn ListenerFilter>;
}

impl<F> ListenerFilterFactory for F
where
    F: Fn() -> Box<dyn ListenerFilter> + Send + Sync,
{
    fn create(&self) -> Box<dyn ListenerFilter> {
        self()
    }
}

/// A listener filter paired with its matcher, instantiated per socket.
pub struct FilterWrapper {
    pub matcher: Arc<dyn ListenerFilterMatcher>,
    pub filter: Box<dyn ListenerFilter>,
}

/// Write access a network filter gets to its connection.
pub struct NetworkFilterContext<'a> {
    pub(crate) io: &'a mut SocketIo,
}

impl<'a> NetworkFilterContext<'a> {
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.io.write_all(data).await
    }
}

/// An L4 filter over the connection's byte stream.
#[async_trait]
pub trait NetworkFilter: Send {
    async fn on_new_connection(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Handle freshly read bytes. The filter owns the buffer contents;
    /// whatever it leaves in `data` is discarded after the chain runs.
    async fn on_data(
        &mut self,
        data: &mut BytesMut,
        cx: &mut NetworkFilterContext<'_>,
    ) -> io::Result<()>;
}

/// The single read filter owned by a raw UDP listener.
#[async_trait]
pub trait UdpListenerReadFilter: Send {
    async fn on_data(&mut self, data: UdpRecvData, writer: &UdpPacketWriter) -> io::Result<()>;
}
