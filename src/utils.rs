//! Small internal helpers for hash-map bookkeeping.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{BuildHasher, Hash};

use rustc_hash::{FxBuildHasher, FxHashMap};

/// Insertion that treats duplicate keys as programmer errors.
pub trait HashMapInsertNew<K, V> {
    /// Inserts a key-value pair that must not be present yet.
    ///
    /// # Panics
    /// Panics when the key is already occupied.
    fn insert_new(&mut self, key: K, value: V);
}

impl<K, V, H> HashMapInsertNew<K, V> for HashMap<K, V, H>
where
    K: Eq + Hash + Debug,
    H: BuildHasher,
{
    #[inline]
    fn insert_new(&mut self, key: K, value: V) {
        match self.entry(key) {
            Entry::Occupied(occupied) => {
                panic!("key {:?} is already occupied", occupied.key())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(value);
            }
        }
    }
}

/// Construction with a pre-sized backing allocation.
pub trait WithCapacity {
    fn with_capacity(capacity: usize) -> Self;
}

impl<K, V> WithCapacity for FxHashMap<K, V> {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        FxHashMap::with_capacity_and_hasher(capacity, FxBuildHasher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_new_accepts_fresh_keys() {
        let mut map = FxHashMap::default();
        map.insert_new("left", 3);
        map.insert_new("right", 5);
        assert_eq!(map["left"], 3);
        assert_eq!(map["right"], 5);
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn test_insert_new_rejects_duplicates() {
        let mut map = FxHashMap::default();
        map.insert_new(7, ());
        map.insert_new(7, ());
    }

    #[test]
    fn test_with_capacity_pre_sizes() {
        let map = FxHashMap::<u64, u64>::with_capacity(32);
        assert!(map.capacity() >= 32);
    }
}
