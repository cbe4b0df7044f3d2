//! Per-stream bookkeeping carried from accept to the live connection.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;

use super::{Address, ConnectionSocket};

/// Namespaced dynamic metadata, set by listener filters and by internal
/// listener peers, visible to later filters and to the eventual connection.
pub type DynamicMetadata = HashMap<String, Value>;

pub struct StreamInfo {
    start_time: Instant,
    downstream_local_addr: Address,
    downstream_remote_addr: Address,
    downstream_direct_remote_addr: Address,
    dynamic_metadata: DynamicMetadata,
}

impl StreamInfo {
    pub fn new(socket: &ConnectionSocket) -> Self {
        Self {
            start_time: Instant::now(),
            downstream_local_addr: socket.local_addr().clone(),
            downstream_remote_addr: socket.remote_addr().clone(),
            downstream_direct_remote_addr: socket.direct_remote_addr().clone(),
            dynamic_metadata: DynamicMetadata::new(),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn downstream_local_addr(&self) -> &Address {
        &self.downstream_local_addr
    }

    pub fn downstream_remote_addr(&self) -> &Address {
        &self.downstream_remote_addr
    }

    pub fn downstream_direct_remote_addr(&self) -> &Address {
        &self.downstream_direct_remote_addr
    }

    /// Re-read the addresses from the socket. Listener filters may have
    /// restored them since this stream info was created.
    pub fn refresh_addresses(&mut self, socket: &ConnectionSocket) {
        self.downstream_local_addr = socket.local_addr().clone();
        self.downstream_remote_addr = socket.remote_addr().clone();
        self.downstream_direct_remote_addr = socket.direct_remote_addr().clone();
    }

    pub fn dynamic_metadata(&self) -> &DynamicMetadata {
        &self.dynamic_metadata
    }

    /// Merge a value into one metadata namespace. Object values merge
    /// key-by-key with the newer keys winning; anything else replaces the
    /// namespace wholesale.
    pub fn set_dynamic_metadata(&mut self, namespace: &str, value: Value) {
        match (self.dynamic_metadata.get_mut(namespace), value) {
            (Some(Value::Object(existing)), Value::Object(new)) => {
                existing.extend(new);
            }
            (_, value) => {
                self.dynamic_metadata.insert(namespace.to_string(), value);
            }
        }
    }

    /// Merge a whole metadata blob, namespace by namespace.
    pub fn merge_metadata(&mut self, blob: DynamicMetadata) {
        for (namespace, value) in blob {
            self.set_dynamic_metadata(&namespace, value);
        }
    }

    /// Take the metadata out, e.g. to travel with a socket hand-off.
    pub fn take_metadata(&mut self) -> DynamicMetadata {
        std::mem::take(&mut self.dynamic_metadata)
    }
}
