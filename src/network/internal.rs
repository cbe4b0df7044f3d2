//! In-process socket plumbing for internal listeners.
//!
//! An internal "socket" is one half of an in-memory duplex pipe. The server
//! half is wrapped as a [`ConnectionSocket`] and delivered to the internal
//! listener through the dispatcher registry; the client half stays with the
//! initiating peer.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::DuplexStream;

use crate::dispatcher::InternalListenerHandle;

use super::{Address, ConnectionSocket, DynamicMetadata};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Create a connected (server socket, client half) pair addressed to the
/// given internal listener.
pub fn socket_pair(listener_id: &str) -> (ConnectionSocket, DuplexStream) {
    let (client, server) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    let endpoint = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);

    let local = Address::Internal {
        listener_id: listener_id.to_string(),
        endpoint_id: "listener".to_string(),
    };
    let peer = Address::Internal {
        listener_id: listener_id.to_string(),
        endpoint_id: format!("client_{endpoint}"),
    };

    (ConnectionSocket::new_internal(server, local, peer), client)
}

/// Open a client connection to an internal listener, delivering `metadata`
/// to its pre-connection pipeline. Returns the client half of the pipe.
pub fn connect(
    handle: &InternalListenerHandle,
    metadata: DynamicMetadata,
) -> io::Result<DuplexStream> {
    let (socket, client) = socket_pair(handle.listener_id());
    if handle.push(socket, metadata) {
        Ok(client)
    } else {
        Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "internal listener is gone",
        ))
    }
}
