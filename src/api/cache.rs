// Keyed value cache with at-most-one in-flight fetch per key and LRU eviction.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use crate::error::Result;

struct Slot<V> {
    cell: Arc<OnceCell<V>>,
    last_used: u64,
}

struct Slots<K, V> {
    map: HashMap<K, Slot<V>>,
    tick: u64,
}

/// Concurrent callers for the same key share one fetch. A failed fetch leaves the slot empty,
/// so the next caller fetches again.
pub struct ValueCache<K, V> {
    capacity: usize,
    slots: Mutex<Slots<K, V>>,
}

impl<K, V> ValueCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Cached value for `key`, or the result of `fetch`. With `force`, `fetch` runs even if a
    /// value is cached; the previous value stays in place until the new one arrives, so a failed
    /// forced fetch leaves the last-known value cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, force: bool, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if force {
            let cell = Arc::new(OnceCell::new());
            let value = cell.get_or_try_init(fetch).await?.clone();
            let mut slots = self.slots.lock().await;
            slots.tick += 1;
            let tick = slots.tick;
            slots.map.insert(
                key.clone(),
                Slot {
                    cell,
                    last_used: tick,
                },
            );
            self.evict(&mut slots, &key);
            return Ok(value);
        }

        let cell = {
            let mut slots = self.slots.lock().await;
            slots.tick += 1;
            let tick = slots.tick;
            let cell = {
                let slot = slots.map.entry(key.clone()).or_insert_with(|| Slot {
                    cell: Arc::new(OnceCell::new()),
                    last_used: tick,
                });
                slot.last_used = tick;
                Arc::clone(&slot.cell)
            };
            self.evict(&mut slots, &key);
            cell
        };
        cell.get_or_try_init(fetch).await.cloned()
    }

    /// Cached value without fetching.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.lock().await;
        slots.tick += 1;
        let tick = slots.tick;
        let slot = slots.map.get_mut(key)?;
        let value = slot.cell.get().cloned()?;
        slot.last_used = tick;
        Some(value)
    }

    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.map.remove(key);
    }

    pub async fn invalidate_all(&self) {
        self.slots.lock().await.map.clear();
    }

    /// Number of slots (filled or in flight).
    pub async fn len(&self) -> usize {
        self.slots.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn evict(&self, slots: &mut Slots<K, V>, keep: &K) {
        while slots.map.len() > self.capacity {
            let oldest = slots
                .map
                .iter()
                .filter(|(k, _)| *k != keep)
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    slots.map.remove(&k);
                }
                None => break,
            }
        }
    }
}
