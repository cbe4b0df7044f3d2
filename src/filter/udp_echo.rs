//! UDP echo read filter.

use std::io;

use async_trait::async_trait;

use super::UdpListenerReadFilter;
use crate::network::{UdpPacketWriter, UdpRecvData};

pub struct UdpEchoFilter;

#[async_trait]
impl UdpListenerReadFilter for UdpEchoFilter {
    async fn on_data(&mut self, data: UdpRecvData, writer: &UdpPacketWriter) -> io::Result<()> {
        let peer = data.peer_addr;
        writer.send_to(&data.data, peer).await.map(|_| ())
    }
}
