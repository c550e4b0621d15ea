// Connection accounting for the in-process broker.
// Every accepted connection is represented by a `ConnectionGuard`; dropping the
// guard is the one and only release, so opened == closed + active at all times.
use ahash::RandomState;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStats {
    pub active: usize,
    pub opened: u64,
    pub closed: u64,
    pub refused: u64,
}

#[derive(Debug)]
pub(crate) struct ConnectionTable {
    // Zero means unlimited.
    max_connections: usize,
    accepting: AtomicBool,
    refused_clients: Mutex<HashSet<String, RandomState>>,
    active: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
    refused: AtomicU64,
}

impl ConnectionTable {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            accepting: AtomicBool::new(true),
            refused_clients: Mutex::new(HashSet::with_hasher(RandomState::new())),
            active: AtomicUsize::new(0),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    pub(crate) fn refuse_client(&self, client_id: impl Into<String>) {
        self.refused_clients.lock().insert(client_id.into());
    }

    pub(crate) fn admit(self: &Arc<Self>, client_id: &str) -> Result<ConnectionGuard> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(self.refuse(client_id, "broker not accepting connections"));
        }
        if self.refused_clients.lock().contains(client_id) {
            return Err(self.refuse(client_id, "client id refused"));
        }
        let max = self.max_connections;
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (max == 0 || active < max).then_some(active + 1)
            })
            .is_ok();
        if !admitted {
            return Err(self.refuse(client_id, "connection limit reached"));
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("fleetwatch_broker_connections_active")
            .set(self.active.load(Ordering::Relaxed) as f64);
        tracing::trace!(client_id, "connection accepted");
        Ok(ConnectionGuard {
            table: Arc::clone(self),
            client_id: client_id.to_string(),
        })
    }

    fn refuse(&self, client_id: &str, reason: &'static str) -> BrokerError {
        self.refused.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fleetwatch_broker_connections_refused_total").increment(1);
        BrokerError::ConnectionRefused {
            client_id: client_id.to_string(),
            reason,
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.closed.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("fleetwatch_broker_connections_active")
            .set(self.active.load(Ordering::Relaxed) as f64);
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active: self.active.load(Ordering::Acquire),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

/// RAII handle for one open connection; released exactly once on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    table: Arc<ConnectionTable>,
    client_id: String,
}

impl ConnectionGuard {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Explicit close; equivalent to dropping the guard.
    pub fn close(self) {}
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.table.release();
        tracing::trace!(client_id = %self.client_id, "connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_drop_releases_slot() {
        let table = Arc::new(ConnectionTable::new(1));
        let guard = table.admit("a").expect("admit");
        assert!(table.admit("b").is_err());
        drop(guard);
        let again = table.admit("b").expect("admit after release");
        again.close();
        let stats = table.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.refused, 1);
    }

    #[test]
    fn refused_client_is_rejected_by_id() {
        let table = Arc::new(ConnectionTable::new(0));
        table.refuse_client("bad");
        let err = table.admit("bad").expect_err("refused");
        assert!(matches!(err, BrokerError::ConnectionRefused { ref client_id, .. } if client_id == "bad"));
        assert!(table.admit("good").is_ok());
    }

    #[test]
    fn not_accepting_rejects_everyone() {
        let table = Arc::new(ConnectionTable::new(0));
        table.set_accepting(false);
        assert!(table.admit("a").is_err());
        table.set_accepting(true);
        assert!(table.admit("a").is_ok());
    }
}
