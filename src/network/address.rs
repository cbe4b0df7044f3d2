use std::fmt;
use std::net::SocketAddr;

/// A downstream address: either a real socket address or an in-process
/// internal endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Internal {
        listener_id: String,
        endpoint_id: String,
    },
}

impl Address {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Internal { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.socket_addr().map(|a| a.port())
    }

    /// Whether this is an any-address binding (0.0.0.0 / ::).
    pub fn is_any(&self) -> bool {
        matches!(self, Address::Socket(addr) if addr.ip().is_unspecified())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Internal {
                listener_id,
                endpoint_id,
            } => write!(f, "internal:{listener_id}/{endpoint_id}"),
        }
    }
}
