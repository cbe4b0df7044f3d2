//! Stock network filters.

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;

use super::{NetworkFilter, NetworkFilterContext};

/// Writes every received byte back to the peer.
pub struct EchoFilter;

#[async_trait]
impl NetworkFilter for EchoFilter {
    async fn on_data(
        &mut self,
        data: &mut BytesMut,
        cx: &mut NetworkFilterContext<'_>,
    ) -> io::Result<()> {
        let out = data.split();
        cx.write(&out).await
    }
}

/// Consumes and discards every received byte.
pub struct BlackholeFilter;

#[async_trait]
impl NetworkFilter for BlackholeFilter {
    async fn on_data(
        &mut self,
        data: &mut BytesMut,
        _cx: &mut NetworkFilterContext<'_>,
    ) -> io::Result<()> {
        data.clear();
        Ok(())
    }
}
