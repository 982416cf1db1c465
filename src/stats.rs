//! Process-wide connection counters.
//!
//! One `Counters` handle is created per process role and passed to every
//! connection that needs it. All updates are atomic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub connections: u64,
    pub errors: u64,
}

/// Shared counters for one role (client or server).
#[derive(Debug, Default)]
pub struct Counters {
    /// Open connections (server) or cumulative successful connects (client)
    connections: AtomicU64,
    /// Connections that terminated abnormally
    errors: AtomicU64,
    /// Connection id allocator
    next_id: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate the next connection id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the open count, saturating at zero.
    ///
    /// Returns `false` when there was no open connection to close, which
    /// means an open/close pair got out of step.
    pub fn connection_closed(&self) -> bool {
        let closed = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !closed {
            warn!("Connection closed with no open connections recorded");
        }
        closed
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            connections: self.connections.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ids_are_monotonic() {
        let counters = Counters::new();
        assert_eq!(counters.next_id(), 0);
        assert_eq!(counters.next_id(), 1);
        assert_eq!(counters.next_id(), 2);
    }

    #[test]
    fn test_close_saturates() {
        let counters = Counters::new();
        assert!(!counters.connection_closed());
        assert_eq!(counters.snapshot().connections, 0);

        counters.connection_opened();
        counters.connection_opened();
        assert!(counters.connection_closed());
        assert_eq!(counters.snapshot().connections, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let counters = Counters::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.connection_opened();
                        counters.error();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            counters.snapshot(),
            Snapshot {
                connections: 8000,
                errors: 8000
            }
        );
    }
}
