use std::hash::Hash;
use std::sync::Mutex;

use hashlink::linked_hash_map::RawEntryMut;
use hashlink::LinkedHashMap;

use crate::cache::Cache;

/// Charge-aware LRU. Insertion order in the backing `LinkedHashMap` is the
/// recency order: the front is the coldest entry, lookups refresh an entry
/// to the back.
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    map: LinkedHashMap<K, (V, usize)>,
    usage: usize,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        LruCache {
            capacity,
            inner: Mutex::new(Inner {
                map: LinkedHashMap::new(),
                usage: 0,
            }),
        }
    }
}

impl<K, V> Cache<K, V> for LruCache<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn insert(&self, key: K, value: V, charge: usize) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let old = inner.map.remove(&key).map(|(v, c)| {
            inner.usage -= c;
            v
        });
        inner.map.insert(key, (value, charge));
        inner.usage += charge;
        while inner.usage > self.capacity {
            match inner.map.pop_front() {
                Some((_, (_, c))) => inner.usage -= c,
                None => break,
            }
        }
        old
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        match inner.map.raw_entry_mut().from_key(key) {
            RawEntryMut::Occupied(mut entry) => {
                entry.to_back();
                Some(entry.get().0.clone())
            }
            RawEntryMut::Vacant(_) => None,
        }
    }

    fn erase(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, charge)) = inner.map.remove(key) {
            inner.usage -= charge;
        }
    }

    fn total_charge(&self) -> usize {
        self.inner.lock().unwrap().usage
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }
}
