// aff4 is a library implementing the AFF4 evidence container format.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// The fixed width of the bucket table.
const BUCKET_COUNT: usize = 256;

/// Sentinel for "no slot".
const NONE: i32 = -1;

/// An `LruCache` keeps up to `capacity` values keyed by raw bytes and
/// expires the least-recently-used entry when a new one does not fit.
///
/// Entries live in a slab; a fixed-width hash table of per-bucket chains
/// finds them by key while a doubly-linked list across all entries keeps
/// the usage order. [`LruCache::take`] removes an entry so a borrowed
/// value can never be expired under its holder; returning it via
/// [`LruCache::put`] reinserts at the hot end.
///
/// The cache itself is not synchronized. Callers that share it across
/// threads wrap it in a mutex guarding both the list and the chains.
pub struct LruCache<V> {
    capacity: usize,
    buckets: Vec<i32>,
    slots: Vec<Slot<V>>,
    free: Vec<i32>,
    head: i32,
    tail: i32,
    len: usize,
}

struct Slot<V> {
    key: Vec<u8>,
    value: Option<V>,
    prev: i32,
    next: i32,
    hash_next: i32,
}

impl<V> LruCache<V> {
    /// Returns a new `LruCache` holding at most `capacity` entries.
    /// A capacity of zero means the cache never expires entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buckets: vec![NONE; BUCKET_COUNT],
            slots: Vec::new(),
            free: Vec::new(),
            head: NONE,
            tail: NONE,
            len: 0,
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Reports whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value at the hot end, replacing any previous value
    /// under the same key. Expires the least-recently-used entry when
    /// the capacity is exceeded.
    pub fn put(&mut self, key: Vec<u8>, value: V) {
        if let Some(slot) = self.find(&key) {
            self.slots[slot as usize].value = Some(value);
            self.promote(slot);
            return;
        }

        let slot = self.allocate(key, value);
        self.bucket_insert(slot);
        self.list_push_front(slot);
        self.len += 1;

        if self.capacity > 0 && self.len > self.capacity {
            self.expire_tail();
        }
    }

    /// Returns a reference to the value under `key`, marking it
    /// most recently used.
    pub fn get(&mut self, key: &[u8]) -> Option<&V> {
        let slot = self.find(key)?;
        self.promote(slot);

        self.slots[slot as usize].value.as_ref()
    }

    /// Removes and returns the value under `key`. The caller owns the
    /// value until it chooses to `put` it back.
    pub fn take(&mut self, key: &[u8]) -> Option<V> {
        let slot = self.find(key)?;

        self.list_unlink(slot);
        self.bucket_remove(slot);
        self.len -= 1;

        let value = self.slots[slot as usize].value.take();
        self.free.push(slot);

        value
    }

    /// Reports whether a value is cached under `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);

        hasher.finish() as usize % BUCKET_COUNT
    }

    fn find(&self, key: &[u8]) -> Option<i32> {
        let mut slot = self.buckets[self.bucket_of(key)];

        while slot != NONE {
            let entry = &self.slots[slot as usize];
            if entry.key == key {
                return Some(slot);
            }

            slot = entry.hash_next;
        }

        None
    }

    fn allocate(&mut self, key: Vec<u8>, value: V) -> i32 {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.key = key;
                entry.value = Some(value);
                slot
            }
            None => {
                self.slots.push(Slot {
                    key,
                    value: Some(value),
                    prev: NONE,
                    next: NONE,
                    hash_next: NONE,
                });

                (self.slots.len() - 1) as i32
            }
        }
    }

    fn bucket_insert(&mut self, slot: i32) {
        let bucket = self.bucket_of(&self.slots[slot as usize].key);

        self.slots[slot as usize].hash_next = self.buckets[bucket];
        self.buckets[bucket] = slot;
    }

    fn bucket_remove(&mut self, slot: i32) {
        let bucket = self.bucket_of(&self.slots[slot as usize].key);
        let mut cursor = self.buckets[bucket];

        if cursor == slot {
            self.buckets[bucket] = self.slots[slot as usize].hash_next;
            return;
        }

        while cursor != NONE {
            let next = self.slots[cursor as usize].hash_next;
            if next == slot {
                self.slots[cursor as usize].hash_next = self.slots[slot as usize].hash_next;
                return;
            }

            cursor = next;
        }
    }

    fn list_push_front(&mut self, slot: i32) {
        self.slots[slot as usize].prev = NONE;
        self.slots[slot as usize].next = self.head;

        if self.head != NONE {
            self.slots[self.head as usize].prev = slot;
        }
        self.head = slot;

        if self.tail == NONE {
            self.tail = slot;
        }
    }

    fn list_unlink(&mut self, slot: i32) {
        let (prev, next) = {
            let entry = &self.slots[slot as usize];
            (entry.prev, entry.next)
        };

        if prev != NONE {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }

        if next != NONE {
            self.slots[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn promote(&mut self, slot: i32) {
        self.list_unlink(slot);
        self.list_push_front(slot);
    }

    fn expire_tail(&mut self) {
        let slot = self.tail;
        if slot == NONE {
            return;
        }

        self.list_unlink(slot);
        self.bucket_remove(slot);
        self.len -= 1;

        self.slots[slot as usize].value = None;
        self.free.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> Vec<u8> {
        name.as_bytes().to_vec()
    }

    #[test]
    fn put_get_take() {
        let mut cache = LruCache::new(4);

        cache.put(key("a"), 1);
        cache.put(key("b"), 2);

        assert_eq!(cache.get(&key("a")), Some(&1));
        assert_eq!(cache.take(&key("b")), Some(2));
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expires_least_recently_used() {
        let mut cache = LruCache::new(2);

        cache.put(key("a"), 1);
        cache.put(key("b"), 2);
        // Touch "a" so "b" becomes the expiry candidate.
        cache.get(&key("a"));
        cache.put(key("c"), 3);

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn taken_entry_cannot_be_expired() {
        let mut cache = LruCache::new(1);

        cache.put(key("a"), 1);
        let borrowed = cache.take(&key("a")).unwrap();

        // Churn far past the capacity while "a" is out.
        for i in 0..8 {
            cache.put(key(&format!("other{i}")), i);
        }

        cache.put(key("a"), borrowed);
        assert_eq!(cache.get(&key("a")), Some(&1));
    }

    #[test]
    fn replaces_value_under_same_key() {
        let mut cache = LruCache::new(2);

        cache.put(key("a"), 1);
        cache.put(key("a"), 9);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")), Some(&9));
    }

    #[test]
    fn zero_capacity_never_expires() {
        let mut cache = LruCache::new(0);

        for i in 0..1000 {
            cache.put(key(&format!("k{i}")), i);
        }

        assert_eq!(cache.len(), 1000);
        assert_eq!(cache.get(&key("k0")), Some(&0));
    }

    #[test]
    fn slot_reuse_keeps_chains_consistent() {
        let mut cache = LruCache::new(3);

        for round in 0..10 {
            for i in 0..5 {
                cache.put(key(&format!("r{round}k{i}")), i);
            }
        }

        assert_eq!(cache.len(), 3);
    }
}
