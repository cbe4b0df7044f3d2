//! Accepted-socket wrapper shared by the TCP and internal accept paths.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

use crate::limit::ResourceGuard;

use super::Address;

/// The io half of an accepted socket.
pub enum SocketIo {
    Tcp(TcpStream),
    Internal(DuplexStream),
}

impl AsyncRead for SocketIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            SocketIo::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            SocketIo::Internal(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            SocketIo::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            SocketIo::Internal(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            SocketIo::Tcp(s) => Pin::new(s).poll_flush(cx),
            SocketIo::Internal(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            SocketIo::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            SocketIo::Internal(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// An accepted socket travelling through the pre-connection pipeline.
///
/// Owns the io half, the downstream addresses (which listener filters may
/// restore, e.g. from a PROXY header) and, once admitted, the global
/// open-connection slot. Dropping the socket closes it and releases the slot.
pub struct ConnectionSocket {
    io: SocketIo,
    local_addr: Address,
    remote_addr: Address,
    direct_remote_addr: Address,
    restored_local: bool,
    requested_server_name: Option<String>,
    conn_guard: Option<ResourceGuard>,
}

impl ConnectionSocket {
    pub fn new_tcp(stream: TcpStream, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            io: SocketIo::Tcp(stream),
            local_addr: local.into(),
            remote_addr: peer.into(),
            direct_remote_addr: peer.into(),
            restored_local: false,
            requested_server_name: None,
            conn_guard: None,
        }
    }

    pub fn new_internal(io: DuplexStream, local: Address, peer: Address) -> Self {
        Self {
            io: SocketIo::Internal(io),
            local_addr: local,
            remote_addr: peer.clone(),
            direct_remote_addr: peer,
            restored_local: false,
            requested_server_name: None,
            conn_guard: None,
        }
    }

    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Address {
        &self.remote_addr
    }

    pub fn direct_remote_addr(&self) -> &Address {
        &self.direct_remote_addr
    }

    pub fn local_address_restored(&self) -> bool {
        self.restored_local
    }

    /// Restore the downstream destination, e.g. from a PROXY protocol header
    /// or an original-destination lookup.
    pub fn restore_local_address(&mut self, addr: SocketAddr) {
        self.local_addr = addr.into();
        self.restored_local = true;
    }

    /// Override the downstream source address. The direct remote address is
    /// unaffected and keeps identifying the actual peer.
    pub fn set_remote_address(&mut self, addr: SocketAddr) {
        self.remote_addr = addr.into();
    }

    pub fn requested_server_name(&self) -> Option<&str> {
        self.requested_server_name.as_deref()
    }

    pub fn set_requested_server_name(&mut self, name: impl Into<String>) {
        self.requested_server_name = Some(name.into());
    }

    pub(crate) fn has_conn_guard(&self) -> bool {
        self.conn_guard.is_some()
    }

    pub(crate) fn set_conn_guard(&mut self, guard: ResourceGuard) {
        self.conn_guard = Some(guard);
    }

    pub fn io_mut(&mut self) -> &mut SocketIo {
        &mut self.io
    }

    /// Peek at pending bytes without consuming them. Only kernel sockets
    /// support this; internal sockets report `Unsupported`.
    pub async fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.io {
            SocketIo::Tcp(s) => s.peek(buf).await,
            SocketIo::Internal(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "peek is not supported on internal sockets",
            )),
        }
    }
}

impl std::fmt::Debug for ConnectionSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSocket")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("restored_local", &self.restored_local)
            .finish()
    }
}
