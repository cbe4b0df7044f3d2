//! Connection balancing across per-worker listeners.
//!
//! Every worker's active listener for a given configured listener registers
//! itself with the shared balancer. On accept, the accepting listener asks
//! the balancer for a target; picking another worker's listener posts the
//! socket there. Decisions read the advisory atomic connection counts, so
//! balancing is approximate by design.

use std::sync::{Arc, Mutex, Weak};

use crate::network::ConnectionSocket;

/// The per-listener surface a balancer can route to.
pub trait BalancedConnectionHandler: Send + Sync {
    fn num_connections(&self) -> u64;
    fn inc_num_connections(&self);
    /// Schedule the socket onto this handler's worker.
    fn post(&self, socket: ConnectionSocket);
}

/// Compare two handlers by identity.
pub fn same_handler(
    a: &Arc<dyn BalancedConnectionHandler>,
    b: &Arc<dyn BalancedConnectionHandler>,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub trait ConnectionBalancer: Send + Sync {
    fn register_handler(&self, handler: Arc<dyn BalancedConnectionHandler>);
    fn unregister_handler(&self, handler: &Arc<dyn BalancedConnectionHandler>);
    /// Pick the handler that should own the socket. Returning `current`
    /// accepts locally.
    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler>;
}

/// No balancing: every socket stays on the accepting worker.
pub struct NopBalancer;

impl ConnectionBalancer for NopBalancer {
    fn register_handler(&self, _handler: Arc<dyn BalancedConnectionHandler>) {}

    fn unregister_handler(&self, _handler: &Arc<dyn BalancedConnectionHandler>) {}

    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler> {
        current.clone()
    }
}

/// Least-loaded balancing over the registered per-worker listeners.
#[derive(Default)]
pub struct ExactBalancer {
    handlers: Mutex<Vec<Weak<dyn BalancedConnectionHandler>>>,
}

impl ExactBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionBalancer for ExactBalancer {
    fn register_handler(&self, handler: Arc<dyn BalancedConnectionHandler>) {
        self.handlers.lock().unwrap().push(Arc::downgrade(&handler));
    }

    fn unregister_handler(&self, handler: &Arc<dyn BalancedConnectionHandler>) {
        self.handlers.lock().unwrap().retain(|candidate| {
            candidate
                .upgrade()
                .is_some_and(|candidate| !same_handler(&candidate, handler))
        });
    }

    fn pick_target_handler(
        &self,
        current: &Arc<dyn BalancedConnectionHandler>,
    ) -> Arc<dyn BalancedConnectionHandler> {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .iter()
            .filter_map(Weak::upgrade)
            .min_by_key(|handler| handler.num_connections())
            .unwrap_or_else(|| current.clone())
    }
}
