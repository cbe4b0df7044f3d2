//! Per-worker dispatcher services.
//!
//! Each worker thread owns one single-threaded tokio runtime; the
//! [`Dispatcher`] fronts that runtime for the connection handler: it runs
//! closures posted from other workers, spawns pipeline tasks, batches
//! deferred deletions to a later event-loop turn, and holds the
//! dispatcher-scoped internal listener registry.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::network::{ConnectionSocket, DynamicMetadata};

/// Receiver side of an internal listener registration.
pub trait InternalListenerCallbacks: Send + Sync {
    /// Deliver a socket handed off by another listener or filter, together
    /// with the dynamic metadata accumulated by the initiating peer.
    fn on_new_socket(&self, socket: ConnectionSocket, metadata: DynamicMetadata);
}

pub struct Dispatcher {
    name: String,
    worker_index: Option<usize>,
    handle: Handle,
    deferred: Mutex<Vec<Box<dyn Any + Send>>>,
    drain_scheduled: AtomicBool,
    internal_listeners: Mutex<HashMap<String, Weak<dyn InternalListenerCallbacks>>>,
}

impl Dispatcher {
    /// Bind a dispatcher to the current runtime. Must be called from inside
    /// the worker's runtime so posted closures land on that worker.
    pub fn new(name: impl Into<String>, worker_index: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            worker_index,
            handle: Handle::current(),
            deferred: Mutex::new(Vec::new()),
            drain_scheduled: AtomicBool::new(false),
            internal_listeners: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_index(&self) -> Option<usize> {
        self.worker_index
    }

    /// Run a closure on this dispatcher's worker. Safe to call from any
    /// thread. If the worker has already shut down the closure (and anything
    /// it captured, such as a socket in flight) is dropped.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    pub fn spawn<Fut>(&self, fut: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Enqueue an object for destruction at a later event-loop turn.
    ///
    /// The object stays addressable until the batch drains. A destructor
    /// that re-enters `defer_delete` lands in the next batch, never the one
    /// currently draining.
    pub fn defer_delete(self: &Arc<Self>, item: Box<dyn Any + Send>) {
        self.deferred.lock().unwrap().push(item);
        if !self.drain_scheduled.swap(true, Ordering::AcqRel) {
            let dispatcher = Arc::clone(self);
            self.post(move || {
                dispatcher.drain_scheduled.store(false, Ordering::Release);
                let batch = std::mem::take(&mut *dispatcher.deferred.lock().unwrap());
                drop(batch);
            });
        }
    }

    /// Register an internal listener id. The id is dispatcher-scoped; a
    /// collision with a live registration is rejected.
    pub fn register_internal_listener(
        &self,
        id: &str,
        callbacks: Weak<dyn InternalListenerCallbacks>,
    ) -> Result<()> {
        let mut map = self.internal_listeners.lock().unwrap();
        if let Some(existing) = map.get(id) {
            if existing.upgrade().is_some() {
                return Err(Error::InternalListenerIdInUse(id.to_string()));
            }
        }
        map.insert(id.to_string(), callbacks);
        debug!(dispatcher = %self.name, id, "internal listener registered");
        Ok(())
    }

    pub fn unregister_internal_listener(&self, id: &str) {
        if self.internal_listeners.lock().unwrap().remove(id).is_some() {
            debug!(dispatcher = %self.name, id, "internal listener unregistered");
        }
    }

    /// Resolve a live internal listener id to a hand-off handle.
    pub fn internal_listener(self: &Arc<Self>, id: &str) -> Option<InternalListenerHandle> {
        let map = self.internal_listeners.lock().unwrap();
        let callbacks = map.get(id)?;
        callbacks.upgrade()?;
        Some(InternalListenerHandle {
            listener_id: id.to_string(),
            dispatcher: Arc::downgrade(self),
            callbacks: callbacks.clone(),
        })
    }
}

/// Hand-off handle to one internal listener. Pushing a socket posts it onto
/// the owning worker's dispatcher; delivery happens on that worker's next
/// event-loop turn.
#[derive(Clone)]
pub struct InternalListenerHandle {
    listener_id: String,
    dispatcher: Weak<Dispatcher>,
    callbacks: Weak<dyn InternalListenerCallbacks>,
}

impl InternalListenerHandle {
    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    /// Returns false if the listener or its worker is gone; the socket is
    /// dropped in that case.
    pub fn push(&self, socket: ConnectionSocket, metadata: DynamicMetadata) -> bool {
        let (Some(dispatcher), Some(callbacks)) =
            (self.dispatcher.upgrade(), self.callbacks.upgrade())
        else {
            return false;
        };
        dispatcher.post(move || callbacks.on_new_socket(socket, metadata));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NoisyDrop {
        order: Arc<Mutex<Vec<&'static str>>>,
        reschedule: Option<(Arc<Dispatcher>, Arc<Mutex<Vec<&'static str>>>)>,
    }

    impl Drop for NoisyDrop {
        fn drop(&mut self) {
            self.order.lock().unwrap().push("dropped");
            if let Some((dispatcher, order)) = self.reschedule.take() {
                dispatcher.defer_delete(Box::new(NoisyDrop {
                    order,
                    reschedule: None,
                }));
            }
        }
    }

    #[tokio::test]
    async fn deferred_deletion_is_not_inline() {
        let dispatcher = Dispatcher::new("test", None);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        dispatcher.defer_delete(Box::new(NoisyDrop {
            order: order.clone(),
            reschedule: None,
        }));
        order.lock().unwrap().push("enqueued");

        // Give the drain task a few turns.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(&*order.lock().unwrap(), &["enqueued", "dropped"]);
    }

    #[tokio::test]
    async fn destructor_reschedules_into_next_batch() {
        let dispatcher = Dispatcher::new("test", None);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        dispatcher.defer_delete(Box::new(NoisyDrop {
            order: order.clone(),
            reschedule: Some((dispatcher.clone(), order.clone())),
        }));

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        // Both the original and the rescheduled object dropped, in two batches.
        assert_eq!(&*order.lock().unwrap(), &["dropped", "dropped"]);
    }

    #[tokio::test]
    async fn internal_registry_rejects_live_collisions() {
        struct Sink(AtomicUsize);
        impl InternalListenerCallbacks for Sink {
            fn on_new_socket(&self, _socket: ConnectionSocket, _metadata: DynamicMetadata) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dispatcher = Dispatcher::new("test", None);
        let sink = Arc::new(Sink(AtomicUsize::new(0)));
        let weak: Weak<dyn InternalListenerCallbacks> =
            Arc::downgrade(&(sink.clone() as Arc<dyn InternalListenerCallbacks>));

        dispatcher.register_internal_listener("lds", weak.clone()).unwrap();
        assert!(matches!(
            dispatcher.register_internal_listener("lds", weak),
            Err(Error::InternalListenerIdInUse(_))
        ));

        dispatcher.unregister_internal_listener("lds");
        assert!(dispatcher.internal_listener("lds").is_none());
    }
}
