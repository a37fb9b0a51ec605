use std::hash::Hash;

use crate::container::hash_function::HashFunction;

pub trait HashTable<K, V> {
    /// Returns the first value stored under `key` that satisfies `pred`.
    fn find(&self, key: &K, pred: impl FnMut(&V) -> bool) -> Option<&V>;
    /// Removes the entry `(key, value)`; returns whether it was present.
    fn remove(&mut self, key: &K, value: &V) -> bool;
    fn insert(&mut self, key: K, value: V);
}

/// Fixed-size, separately chained multimap.
///
/// Several values may share a key; they are returned in insertion order.
/// The bucket count never changes, which keeps removal cheap for the short
/// chains this table is sized for.
pub struct ChainedHashTable<K, V> {
    buckets: Vec<Vec<(K, V)>>,
    bits: u32,
    hash_fn: HashFunction<K>,
    len: usize,
}

impl<K: Hash + Eq, V: PartialEq> ChainedHashTable<K, V> {
    pub fn new(bits: u32) -> Self {
        let mut buckets = Vec::with_capacity(1 << bits);
        buckets.resize_with(1 << bits, Vec::new);
        Self {
            buckets,
            bits,
            hash_fn: HashFunction::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.find(key, |v| v == value).is_some()
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(Vec::clear);
        self.len = 0;
    }

    fn bucket_of(&self, key: &K) -> usize {
        self.hash_fn.get_bucket(key, self.bits)
    }
}

impl<K: Hash + Eq, V: PartialEq> HashTable<K, V> for ChainedHashTable<K, V> {
    fn find(&self, key: &K, mut pred: impl FnMut(&V) -> bool) -> Option<&V> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, v)| k == key && pred(v))
            .map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K, value: &V) -> bool {
        let bucket = self.bucket_of(key);
        let chain = &mut self.buckets[bucket];
        match chain.iter().position(|(k, v)| k == key && v == value) {
            Some(pos) => {
                chain.remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: K, value: V) {
        let bucket = self.bucket_of(&key);
        self.buckets[bucket].push((key, value));
        self.len += 1;
    }
}
