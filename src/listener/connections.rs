//! Filter-chain buckets and the live connections inside them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::FilterChain;
use crate::network::{Connection, ConnectionCallbacks, ConnectionEvent};
use crate::telemetry::Timespan;

use super::StreamListenerCore;

/// All live connections sharing one filter chain instance: the unit of
/// drain. Ownership is strictly listener → bucket → connection; connections
/// reach their listener through their own back reference.
pub(crate) struct ActiveConnections {
    pub(crate) chain: Arc<FilterChain>,
    pub(crate) connections: Mutex<HashMap<u64, Arc<ActiveConnection>>>,
    pub(crate) draining: AtomicBool,
}

impl ActiveConnections {
    pub(crate) fn new(chain: Arc<FilterChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            connections: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        })
    }
}

/// One live L4 connection, owned by its bucket from `new_connection` until
/// the terminal connection event destroys it.
///
/// The back reference to the bucket is non-owning. The listener core is
/// pinned directly so a listener removed while this connection is still
/// serving stays around to settle the stats and counters on close.
pub(crate) struct ActiveConnection {
    pub(crate) id: u64,
    pub(crate) listener: Arc<StreamListenerCore>,
    pub(crate) bucket: Weak<ActiveConnections>,
    pub(crate) connection: Arc<Connection>,
    pub(crate) conn_length: Mutex<Option<Timespan>>,
    removed: AtomicBool,
}

impl ActiveConnection {
    pub(crate) fn new(
        id: u64,
        listener: Arc<StreamListenerCore>,
        bucket: &Arc<ActiveConnections>,
        connection: Arc<Connection>,
        conn_length: Timespan,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            listener,
            bucket: Arc::downgrade(bucket),
            connection,
            conn_length: Mutex::new(Some(conn_length)),
            removed: AtomicBool::new(false),
        })
    }
}

impl ConnectionCallbacks for ActiveConnection {
    fn on_event(&self, event: ConnectionEvent) {
        // Any terminal event destroys the connection, exactly once.
        let terminal = matches!(event, ConnectionEvent::LocalClose | ConnectionEvent::RemoteClose);
        if !terminal || self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(bucket) = self.bucket.upgrade() {
            self.listener.remove_connection(&bucket, self);
        }
    }
}
