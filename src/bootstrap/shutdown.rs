use std::sync::Arc;

use tokio::sync::watch;

/// Graceful-shutdown signal shared by the main thread and the workers.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_wakes_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!shutdown.is_signaled());

        shutdown.signal();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(shutdown.is_signaled());
    }
}
