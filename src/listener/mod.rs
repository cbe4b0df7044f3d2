//! The per-worker connection handler and its active listeners.
//!
//! A [`ConnectionHandler`] owns every listener bound to one worker thread.
//! TCP and internal listeners share the pre-connection pipeline (listener
//! filters with suspension and timeout), the filter-chain buckets that group
//! live connections, and the accounting invariants; UDP listeners carry the
//! baseline read-filter surface.

mod connections;
mod handler;
mod internal;
mod socket;
mod stream;
mod tcp;
pub mod udp;

pub use handler::ConnectionHandler;
pub use internal::ActiveInternalListener;
pub use tcp::ActiveTcpListener;
pub use udp::{ActiveUdpListener, UdpWorkerRouter};

pub(crate) use connections::{ActiveConnection, ActiveConnections};
pub(crate) use stream::StreamListenerCore;
