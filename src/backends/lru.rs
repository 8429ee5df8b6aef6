//! Recency index shared by the in-process tiers
//!
//! Keeps values keyed by string together with a strictly increasing access
//! tick, so the least-recently-accessed key is always the first entry of the
//! `order` map. Ticks rather than timestamps keep the order total even when
//! two accesses land in the same millisecond.

use std::collections::{BTreeMap, HashMap};

struct Slot<V> {
    value: V,
    size: u64,
    tick: u64,
}

pub(crate) struct LruIndex<V> {
    slots: HashMap<String, Slot<V>>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    total_bytes: u64,
}

impl<V> Default for LruIndex<V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            total_bytes: 0,
        }
    }
}

impl<V> LruIndex<V> {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub(crate) fn peek(&self, key: &str) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Mark `key` as most recently used and hand back its value
    pub(crate) fn touch(&mut self, key: &str) -> Option<&mut V> {
        let tick = self.bump();
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.to_string());
        Some(&mut slot.value)
    }

    /// Insert or replace; the key becomes most recently used
    pub(crate) fn insert(&mut self, key: String, value: V, size: u64) -> Option<V> {
        let previous = self.remove(&key);
        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.total_bytes = self.total_bytes.saturating_add(size);
        self.slots.insert(key, Slot { value, size, tick });
        previous
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.total_bytes = self.total_bytes.saturating_sub(slot.size);
        Some(slot.value)
    }

    pub(crate) fn pop_lru(&mut self) -> Option<(String, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.size);
        Some((key, slot.value))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.total_bytes = 0;
    }

    /// Keys from least to most recently used
    pub(crate) fn keys_by_recency(&self) -> impl Iterator<Item = &String> {
        self.order.values()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.slots.iter().map(|(k, slot)| (k, &slot.value))
    }

    /// Remove every value selected by the predicate
    pub(crate) fn drain_where(&mut self, mut remove: impl FnMut(&str, &V) -> bool) -> Vec<(String, V)> {
        let doomed: Vec<String> = self
            .slots
            .iter()
            .filter(|(k, slot)| remove(k, &slot.value))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// Evict least-recently-used values until both bounds hold
    pub(crate) fn evict_over(&mut self, max_entries: usize, max_bytes: u64) -> Vec<(String, V)> {
        let mut evicted = Vec::new();
        while self.slots.len() > max_entries || self.total_bytes > max_bytes {
            match self.pop_lru() {
                Some(pair) => evicted.push(pair),
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_order_is_recency_order() {
        let mut idx = LruIndex::default();
        idx.insert("a".into(), 1, 10);
        idx.insert("b".into(), 2, 10);
        idx.insert("c".into(), 3, 10);
        let keys: Vec<_> = idx.keys_by_recency().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(idx.total_bytes(), 30);
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut idx = LruIndex::default();
        idx.insert("a".into(), 1, 1);
        idx.insert("b".into(), 2, 1);
        idx.touch("a");
        assert_eq!(idx.pop_lru().map(|(k, _)| k), Some("b".to_string()));
    }

    #[test]
    fn test_replace_updates_size() {
        let mut idx = LruIndex::default();
        idx.insert("a".into(), 1, 100);
        idx.insert("a".into(), 2, 40);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.total_bytes(), 40);
        assert_eq!(idx.peek("a"), Some(&2));
    }

    #[test]
    fn test_evict_over_respects_both_bounds() {
        let mut idx = LruIndex::default();
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            idx.insert((*key).to_string(), i, 10);
        }
        let evicted = idx.evict_over(3, 25);
        let keys: Vec<_> = evicted.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(idx.len(), 2);
    }
}
