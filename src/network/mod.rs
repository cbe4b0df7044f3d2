//! Network primitives: addresses, accepted sockets, server connections and
//! in-process socket plumbing.

mod address;
pub mod connection;
pub mod internal;
mod socket;
mod stream_info;
pub mod udp;

pub use address::Address;
pub use connection::{Connection, ConnectionCallbacks, ConnectionEvent};
pub use socket::{ConnectionSocket, SocketIo};
pub use stream_info::{DynamicMetadata, StreamInfo};
pub use udp::{UdpPacketWriter, UdpRecvData};
