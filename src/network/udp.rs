//! UDP datagram surface.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;

/// One received datagram plus its addressing.
#[derive(Debug)]
pub struct UdpRecvData {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub data: BytesMut,
}

/// Packet writer bound to a listener's socket. Cloneable so the read filter
/// can keep one while the listener owns another.
#[derive(Clone)]
pub struct UdpPacketWriter {
    socket: Arc<UdpSocket>,
}

impl UdpPacketWriter {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, peer).await
    }
}
