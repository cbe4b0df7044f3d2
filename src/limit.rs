//! Open-connection accounting and admission.
//!
//! A [`Resource`] is shared between every party that needs to observe or
//! charge the same connection budget: the global accept limit is one
//! `Resource` cloned into every worker's handler, the per-listener limit is
//! one `Resource` cloned into every worker's active listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    max: u64,
    current: AtomicU64,
}

/// Token-bucket style open-connection limiter with `can_create`/`inc`/`dec`.
#[derive(Debug, Clone)]
pub struct Resource {
    inner: Arc<Inner>,
}

impl Resource {
    pub fn new(max: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                max,
                current: AtomicU64::new(0),
            }),
        }
    }

    /// A limiter that never denies.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// Whether one more connection fits. Advisory: a concurrent `inc` can
    /// still push the count past `max`.
    pub fn can_create(&self) -> bool {
        self.inner.current.load(Ordering::Relaxed) < self.inner.max
    }

    pub fn inc(&self) {
        self.inner.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .inner
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }

    pub fn count(&self) -> u64 {
        self.inner.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.inner.max
    }

    /// Atomically admit one connection, returning a guard that releases the
    /// slot on drop. The guard travels with the socket, including across
    /// worker hand-offs.
    pub fn try_acquire(&self) -> Option<ResourceGuard> {
        self.inner
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c < self.inner.max {
                    Some(c + 1)
                } else {
                    None
                }
            })
            .ok()
            .map(|_| ResourceGuard {
                inner: self.inner.clone(),
            })
    }
}

/// RAII admission slot handed out by [`Resource::try_acquire`].
#[derive(Debug)]
pub struct ResourceGuard {
    inner: Arc<Inner>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let _ = self
            .inner
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let limit = Resource::new(2);
        assert!(limit.can_create());

        let a = limit.try_acquire().unwrap();
        let b = limit.try_acquire().unwrap();
        assert!(!limit.can_create());
        assert!(limit.try_acquire().is_none());
        assert_eq!(limit.count(), 2);

        drop(a);
        assert!(limit.can_create());
        assert!(limit.try_acquire().is_some());
        drop(b);
    }

    #[test]
    fn dec_never_underflows() {
        let limit = Resource::new(1);
        limit.dec();
        assert_eq!(limit.count(), 0);
        limit.inc();
        assert_eq!(limit.count(), 1);
    }
}
