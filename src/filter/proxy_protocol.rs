//! PROXY protocol v1 listener filter.
//!
//! Consumes the text header from the front of the stream and restores the
//! downstream addresses it carries. A malformed header fails the chain and
//! the socket is closed.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{FilterStatus, ListenerFilter, ListenerFilterContext};

/// v1 headers are at most 107 bytes including CRLF.
const MAX_HEADER_LEN: usize = 107;

pub struct ProxyProtocolFilter;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("proxy protocol: {msg}"))
}

/// Parse a full v1 header line (CRLF included). Returns the advertised
/// (source, destination) pair, or `None` for `PROXY UNKNOWN`.
fn parse_v1(line: &[u8]) -> io::Result<Option<(SocketAddr, SocketAddr)>> {
    let line = line
        .strip_suffix(b"\r\n")
        .ok_or_else(|| invalid("missing CRLF"))?;
    let line = std::str::from_utf8(line).map_err(|_| invalid("header is not ASCII"))?;

    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(invalid("missing PROXY signature"));
    }

    match parts.next() {
        Some("UNKNOWN") => return Ok(None),
        Some("TCP4") | Some("TCP6") => {}
        _ => return Err(invalid("unsupported protocol family")),
    }

    let src_ip: IpAddr = parts
        .next()
        .ok_or_else(|| invalid("missing source address"))?
        .parse()
        .map_err(|_| invalid("bad source address"))?;
    let dst_ip: IpAddr = parts
        .next()
        .ok_or_else(|| invalid("missing destination address"))?
        .parse()
        .map_err(|_| invalid("bad destination address"))?;
    let src_port: u16 = parts
        .next()
        .ok_or_else(|| invalid("missing source port"))?
        .parse()
        .map_err(|_| invalid("bad source port"))?;
    let dst_port: u16 = parts
        .next()
        .ok_or_else(|| invalid("missing destination port"))?
        .parse()
        .map_err(|_| invalid("bad destination port"))?;

    if parts.next().is_some() {
        return Err(invalid("trailing fields"));
    }

    Ok(Some((
        SocketAddr::new(src_ip, src_port),
        SocketAddr::new(dst_ip, dst_port),
    )))
}

#[async_trait]
impl ListenerFilter for ProxyProtocolFilter {
    async fn on_accept(
        &mut self,
        cx: &mut ListenerFilterContext<'_>,
    ) -> io::Result<FilterStatus> {
        let socket = cx.socket();

        let mut line = Vec::with_capacity(MAX_HEADER_LEN);
        let mut byte = [0u8; 1];
        loop {
            socket.io_mut().read_exact(&mut byte).await?;
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                break;
            }
            if line.len() >= MAX_HEADER_LEN {
                return Err(invalid("header too long"));
            }
        }

        if let Some((source, destination)) = parse_v1(&line)? {
            debug!(%source, %destination, "proxy protocol header consumed");
            socket.set_remote_address(source);
            socket.restore_local_address(destination);
        }

        Ok(FilterStatus::Continue)
    }
}
