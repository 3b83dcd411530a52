use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Completion-waiters table coalescing concurrent cache fills: the first
/// caller for a key becomes the leader and runs the producer, later callers
/// wait and re-check the cache once the leader settles. A leader whose
/// future is dropped mid-flight releases the slot and wakes the waiters, so
/// cancellation cannot wedge a key.
pub(crate) struct SingleFlight<K> {
    inflight: Arc<Mutex<HashMap<K, watch::Receiver<()>>>>,
}

pub(crate) enum Flight<K: Eq + Hash> {
    /// The caller owns the fill. Dropping the guard (after inserting the
    /// result into the cache, or on error/cancellation) wakes all waiters.
    Leader(FlightGuard<K>),
    Waiter(watch::Receiver<()>),
}

pub(crate) struct FlightGuard<K: Eq + Hash> {
    key: Option<K>,
    inflight: Arc<Mutex<HashMap<K, watch::Receiver<()>>>>,
    // Dropped after the map entry is removed; closing the channel is what
    // wakes the waiters.
    _tx: watch::Sender<()>,
}

impl<K: Eq + Hash> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.lock().unwrap().remove(&key);
        }
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub(crate) fn new() -> Self {
        SingleFlight {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn join(&self, key: &K) -> Flight<K> {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(rx) = inflight.get(key) {
            return Flight::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(());
        inflight.insert(key.clone(), rx);
        Flight::Leader(FlightGuard {
            key: Some(key.clone()),
            inflight: self.inflight.clone(),
            _tx: tx,
        })
    }
}

/// Suspends until the leader for this key settles (successfully or not).
pub(crate) async fn await_leader(mut rx: watch::Receiver<()>) {
    // An Err means the sender is gone, which is exactly the wakeup we want.
    let _ = rx.changed().await;
}
