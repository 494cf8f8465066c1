//! The hash map backing every per-database table.
//!
//! A chained table with power-of-two sizing. The one piece of behavior the
//! standard library map cannot give us is the incremental scan cursor:
//! `scan` walks one bucket per call and advances the cursor by incrementing
//! the masked bits in reversed-bit order, so entries inserted or rehashed
//! while an iteration is in progress are never skipped (they may be
//! revisited, which callers must tolerate).

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use rand::Rng;

use crate::types::Key;

const INITIAL_BUCKETS: usize = 4;

#[derive(Debug, Clone)]
pub struct Dict<V> {
    buckets: Vec<Vec<(Key, V)>>,
    len: usize,
    hasher: RandomState,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Dict::new()
    }
}

impl<V> Dict<V> {
    pub fn new() -> Self {
        Dict {
            buckets: (0..INITIAL_BUCKETS).map(|_| Vec::new()).collect(),
            len: 0,
            hasher: RandomState::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        (h.finish() as usize) & (self.buckets.len() - 1)
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, _)| &k[..] == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let b = self.bucket_of(key);
        self.buckets[b].iter_mut().find(|(k, _)| &k[..] == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace; returns the previous value when replacing.
    pub fn insert(&mut self, key: Key, value: V) -> Option<V> {
        let b = self.bucket_of(&key);
        if let Some(slot) = self.buckets[b].iter_mut().find(|(k, _)| k == &key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.buckets[b].push((key, value));
        self.len += 1;
        if self.len > self.buckets.len() {
            self.resize(self.buckets.len() * 2);
        }
        None
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let b = self.bucket_of(key);
        let pos = self.buckets[b].iter().position(|(k, _)| &k[..] == key)?;
        let (_, v) = self.buckets[b].swap_remove(pos);
        self.len -= 1;
        if self.buckets.len() > INITIAL_BUCKETS && self.len < self.buckets.len() / 8 {
            self.resize(self.buckets.len() / 2);
        }
        Some(v)
    }

    pub fn clear(&mut self) {
        self.buckets = (0..INITIAL_BUCKETS).map(|_| Vec::new()).collect();
        self.len = 0;
    }

    fn resize(&mut self, new_size: usize) {
        let old = std::mem::replace(
            &mut self.buckets,
            (0..new_size).map(|_| Vec::new()).collect(),
        );
        for bucket in old {
            for (k, v) in bucket {
                let b = self.bucket_of(&k);
                self.buckets[b].push((k, v));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> {
        self.buckets.iter().flatten().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Key, &mut V)> {
        self.buckets.iter_mut().flatten().map(|entry| (&entry.0, &mut entry.1))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.iter().map(|(k, _)| k)
    }

    /// Visit the bucket selected by `cursor` and return the next cursor,
    /// `0` when the table has been fully walked.
    pub fn scan<F>(&self, cursor: u64, mut visit: F) -> u64
    where
        F: FnMut(&Key, &V),
    {
        if self.len == 0 {
            return 0;
        }
        let mask = (self.buckets.len() - 1) as u64;
        for (k, v) in &self.buckets[(cursor & mask) as usize] {
            visit(k, v);
        }
        // Reversed-bit increment of the masked cursor bits.
        let mut next = cursor;
        next |= !mask;
        next = next.reverse_bits();
        next = next.wrapping_add(1);
        next.reverse_bits()
    }

    /// A uniformly-ish random entry, for eviction and expiration sampling.
    pub fn random_entry<R: Rng>(&self, rng: &mut R) -> Option<(&Key, &V)> {
        if self.len == 0 {
            return None;
        }
        for _ in 0..16 {
            let bucket = &self.buckets[rng.gen_range(0..self.buckets.len())];
            if !bucket.is_empty() {
                let (k, v) = &bucket[rng.gen_range(0..bucket.len())];
                return Some((k, v));
            }
        }
        // Sparse table: fall back to a linear pick.
        let skip = rng.gen_range(0..self.len);
        self.iter().nth(skip)
    }
}
