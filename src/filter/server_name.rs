//! Server-name preamble listener filter.
//!
//! Reads a one-byte length-prefixed server name from the front of the
//! stream and records it on the socket for filter-chain matching. A zero
//! length means the client did not advertise a name. This is the plaintext
//! stand-in for TLS inspection, which this layer does not do.

use std::io;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{FilterStatus, ListenerFilter, ListenerFilterContext};

pub struct ServerNameFilter;

#[async_trait]
impl ListenerFilter for ServerNameFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        let mut len = [0u8; 1];
        cx.socket().io_mut().read_exact(&mut len).await?;
        if len[0] == 0 {
            return Ok(FilterStatus::Continue);
        }

        let mut name = vec![0u8; len[0] as usize];
        cx.socket().io_mut().read_exact(&mut name).await?;
        let name = String::from_utf8(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "server name is not UTF-8"))?;

        debug!(server_name = %name, "server name preamble consumed");
        cx.socket().set_requested_server_name(name.clone());
        cx.set_dynamic_metadata("relayd.server_name", json!({ "value": name }));

        Ok(FilterStatus::Continue)
    }
}
