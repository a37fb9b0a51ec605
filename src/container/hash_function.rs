use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use xxhash_rust::xxh3;

/// Represents a hash function for a given key type.
pub struct HashFunction<K> {
    _marker: PhantomData<K>,
}

impl<K> HashFunction<K> {
    /// Creates a new `HashFunction`.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K> Default for HashFunction<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash> HashFunction<K> {
    /// Returns the hash value of the given key.
    pub fn get_hash(&self, key: &K) -> u64 {
        let mut hasher = xxh3::Xxh3::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Folds the hash of `key` down to `bits` bits, for bucket selection.
    pub fn get_bucket(&self, key: &K, bits: u32) -> usize {
        debug_assert!(bits > 0 && bits < 32);
        let hash = self.get_hash(key);
        ((hash ^ (hash >> 32)) & ((1u64 << bits) - 1)) as usize
    }
}
