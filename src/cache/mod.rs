mod lru;
mod single_flight;

pub use lru::LruCache;
pub(crate) use single_flight::{await_leader, Flight, SingleFlight};

/// A bounded mapping from keys to shared values. `charge` is the weight an
/// entry contributes toward the capacity; eviction only removes the cache's
/// own reference, so values with outstanding handles stay alive until the
/// last handle drops.
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync + Clone,
{
    /// Inserts an entry, evicting from the cold end while over capacity.
    /// Returns the previous value under `key`, if any.
    fn insert(&self, key: K, value: V, charge: usize) -> Option<V>;

    /// Looks up `key` and marks the entry as recently used.
    fn get(&self, key: &K) -> Option<V>;

    fn erase(&self, key: &K);

    /// Sum of the charges of all resident entries.
    fn total_charge(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
