//! Sharded Concurrent Dictionary
//!
//! `ShardedMap` is the map every keyspace is built on: the data map, the TTL
//! map and the version map of a database are all instances of it.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        ShardedMap<V>                       │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐       ┌─────────┐     │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │  ...  │ Shard N │     │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │       │ RwLock  │     │
//! │  │ HashMap │ │ HashMap │ │ HashMap │       │ HashMap │     │
//! │  └─────────┘ └─────────┘ └─────────┘       └─────────┘     │
//! │                 shard = fnv32(key) & (N - 1)               │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The methods here take the shard lock themselves. Commands that must hold
//! several keys at once go through the lock manager in
//! [`lock`](crate::storage::lock) and operate on the returned
//! [`LockedShards`](crate::storage::LockedShards) view instead.

use crate::storage::pattern::{GlobPattern, PatternError};
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shard count used when none is configured.
pub const DEFAULT_SHARD_COUNT: usize = 16;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV hash (multiply, then xor) used to pick a key's shard.
pub fn fnv32(key: &[u8]) -> u32 {
    key.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        hash.wrapping_mul(FNV_PRIME) ^ u32::from(b)
    })
}

/// Rounds a requested shard count up to a power of two, minimum 16.
/// A request for exactly one shard is honoured.
pub fn shard_capacity(requested: usize) -> usize {
    match requested {
        1 => 1,
        n if n <= DEFAULT_SHARD_COUNT => DEFAULT_SHARD_COUNT,
        n => n.checked_next_power_of_two().unwrap_or(1 << 31),
    }
}

pub(crate) type Shard<V> = RwLock<HashMap<Bytes, V>>;

pub(crate) fn read_shard<V>(shard: &Shard<V>) -> RwLockReadGuard<'_, HashMap<Bytes, V>> {
    shard.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_shard<V>(shard: &Shard<V>) -> RwLockWriteGuard<'_, HashMap<Bytes, V>> {
    shard.write().unwrap_or_else(PoisonError::into_inner)
}

/// A hash map split into independently locked shards.
#[derive(Debug)]
pub struct ShardedMap<V> {
    shards: Vec<Shard<V>>,
    count: AtomicUsize,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl<V> ShardedMap<V> {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_capacity(shard_count))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            count: AtomicUsize::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard a key lives in. Stable for the lifetime of the map.
    #[inline]
    pub fn shard_index(&self, key: &[u8]) -> usize {
        (fnv32(key) as usize) & (self.shards.len() - 1)
    }

    pub(crate) fn shard(&self, index: usize) -> &Shard<V> {
        &self.shards[index]
    }

    pub(crate) fn note_inserted(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_removed(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of entries across all shards.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or overwrites. Always applies, so always returns 1.
    pub fn put(&self, key: Bytes, value: V) -> usize {
        let mut shard = write_shard(&self.shards[self.shard_index(&key)]);
        if shard.insert(key, value).is_none() {
            self.note_inserted();
        }
        1
    }

    /// Inserts only when the key is absent. Returns 1 if it inserted.
    pub fn put_if_absent(&self, key: Bytes, value: V) -> usize {
        let mut shard = write_shard(&self.shards[self.shard_index(&key)]);
        if shard.contains_key(&key) {
            return 0;
        }
        shard.insert(key, value);
        self.note_inserted();
        1
    }

    /// Overwrites only when the key is present. Returns 1 if it wrote.
    pub fn put_if_exists(&self, key: Bytes, value: V) -> usize {
        let mut shard = write_shard(&self.shards[self.shard_index(&key)]);
        match shard.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Removes a key, returning its value and 1, or `None` and 0.
    pub fn remove(&self, key: &[u8]) -> (Option<V>, usize) {
        let mut shard = write_shard(&self.shards[self.shard_index(key)]);
        match shard.remove(key) {
            Some(value) => {
                self.note_removed();
                (Some(value), 1)
            }
            None => (None, 0),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        read_shard(&self.shards[self.shard_index(key)]).contains_key(key)
    }

    /// Reads a value through a closure while the shard is read-locked.
    pub fn with_value<R>(&self, key: &[u8], f: impl FnOnce(Option<&V>) -> R) -> R {
        let shard = read_shard(&self.shards[self.shard_index(key)]);
        f(shard.get(key))
    }

    /// Read-modify-write of one entry under its shard's write lock.
    /// The closure returns the new value, or `None` to delete the entry.
    pub fn update(&self, key: Bytes, f: impl FnOnce(Option<&V>) -> Option<V>) {
        let mut shard = write_shard(&self.shards[self.shard_index(&key)]);
        let existed = shard.contains_key(&key);
        let next = f(shard.get(&key));
        match (next, existed) {
            (Some(value), false) => {
                shard.insert(key, value);
                self.note_inserted();
            }
            (Some(value), true) => {
                shard.insert(key, value);
            }
            (None, true) => {
                shard.remove(&key);
                self.note_removed();
            }
            (None, false) => {}
        }
    }

    /// Visits every entry, one shard read lock at a time, until `f` returns
    /// false. Entries changed concurrently in shards not yet visited may or
    /// may not be seen.
    pub fn for_each(&self, mut f: impl FnMut(&Bytes, &V) -> bool) {
        for shard in &self.shards {
            let shard = read_shard(shard);
            for (key, value) in shard.iter() {
                if !f(key, value) {
                    return;
                }
            }
        }
    }

    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    /// Removes everything, shard by shard.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = write_shard(shard);
            self.count.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }

    /// Picks `limit` keys at random; the same key may be returned twice.
    pub fn random_keys(&self, limit: usize) -> Vec<Bytes> {
        let mut rng = rand::thread_rng();
        let mut result = Vec::with_capacity(limit);
        while result.len() < limit && !self.is_empty() {
            let shard = read_shard(&self.shards[rng.gen_range(0..self.shards.len())]);
            if shard.is_empty() {
                continue;
            }
            let nth = rng.gen_range(0..shard.len());
            if let Some(key) = shard.keys().nth(nth) {
                result.push(key.clone());
            }
        }
        result
    }

    /// Picks up to `limit` distinct keys at random.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<Bytes> {
        if limit >= self.len() {
            return self.keys();
        }
        let mut picked = HashSet::with_capacity(limit);
        while picked.len() < limit && !self.is_empty() {
            for key in self.random_keys(limit - picked.len()) {
                picked.insert(key);
            }
        }
        picked.into_iter().collect()
    }

    /// Incremental scan over whole shards.
    ///
    /// Starts at shard `cursor` and collects keys matching `pattern`. A shard
    /// is never split: if taking the next shard would push the result past
    /// `count` and at least one shard was already visited, the scan stops and
    /// returns that shard's index as the next cursor. A next cursor of 0 means
    /// the scan is complete.
    pub fn scan(
        &self,
        cursor: usize,
        count: usize,
        pattern: &[u8],
    ) -> Result<(Vec<Bytes>, usize), PatternError> {
        let glob = GlobPattern::compile(pattern)?;
        if glob.matches_all() && cursor == 0 && count >= self.len() {
            return Ok((self.keys(), 0));
        }

        let mut result = Vec::new();
        for index in cursor..self.shards.len() {
            let shard = read_shard(&self.shards[index]);
            if !scan_shard(&mut result, index, cursor, count, &shard, &glob) {
                return Ok((result, index));
            }
        }
        Ok((result, 0))
    }
}

/// One step of a cursor scan. Returns false, leaving `result` untouched,
/// when the batch is full and the scan should resume at `index`.
///
/// The first shard of a batch is always taken whole, so a scan makes
/// progress even when a single shard holds more than `count` keys.
pub(crate) fn scan_shard<V>(
    result: &mut Vec<Bytes>,
    index: usize,
    cursor: usize,
    count: usize,
    entries: &HashMap<Bytes, V>,
    glob: &GlobPattern,
) -> bool {
    if result.len() + entries.len() > count && index > cursor {
        return false;
    }
    result.extend(entries.keys().filter(|key| glob.matches(key)).cloned());
    true
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.with_value(key, |value| value.cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_fnv32_reference_values() {
        assert_eq!(fnv32(b""), 2_166_136_261);
        // offset * prime, then xor 'a'
        assert_eq!(
            fnv32(b"a"),
            2_166_136_261u32.wrapping_mul(16_777_619) ^ 0x61
        );
    }

    #[test]
    fn test_shard_capacity() {
        assert_eq!(shard_capacity(1), 1);
        assert_eq!(shard_capacity(0), 16);
        assert_eq!(shard_capacity(5), 16);
        assert_eq!(shard_capacity(16), 16);
        assert_eq!(shard_capacity(17), 32);
        assert_eq!(shard_capacity(100), 128);
    }

    #[test]
    fn test_put_variants() {
        let map = ShardedMap::new(16);
        assert_eq!(map.put_if_exists(key("a"), 1), 0);
        assert_eq!(map.put_if_absent(key("a"), 1), 1);
        assert_eq!(map.put_if_absent(key("a"), 2), 0);
        assert_eq!(map.get(b"a"), Some(1));
        assert_eq!(map.put_if_exists(key("a"), 3), 1);
        assert_eq!(map.put(key("a"), 4), 1);
        assert_eq!(map.get(b"a"), Some(4));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_overwrite_does_not_grow_len() {
        let map = ShardedMap::new(16);
        for i in 0..10 {
            map.put(key("same"), i);
        }
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(b"same"), (Some(9), 1));
        assert_eq!(map.remove(b"same"), (None, 0));
        assert!(map.is_empty());
    }

    #[test]
    fn test_update() {
        let map: ShardedMap<u64> = ShardedMap::new(16);
        map.update(key("v"), |old| Some(old.copied().unwrap_or(0) + 1));
        map.update(key("v"), |old| Some(old.copied().unwrap_or(0) + 1));
        assert_eq!(map.get(b"v"), Some(2));
        map.update(key("v"), |_| None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_for_each_early_exit() {
        let map = ShardedMap::new(16);
        for i in 0..100 {
            map.put(key(&format!("k{i}")), i);
        }
        let mut seen = 0;
        map.for_each(|_, _| {
            seen += 1;
            seen < 10
        });
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_clear() {
        let map = ShardedMap::new(32);
        for i in 0..50 {
            map.put(key(&format!("k{i}")), i);
        }
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.keys().is_empty());
    }

    #[test]
    fn test_random_keys() {
        let map = ShardedMap::new(16);
        assert!(map.random_keys(5).is_empty());
        for i in 0..20 {
            map.put(key(&format!("k{i}")), i);
        }
        assert_eq!(map.random_keys(50).len(), 50);
        let distinct = map.random_distinct_keys(7);
        assert_eq!(distinct.len(), 7);
        assert_eq!(distinct.iter().collect::<HashSet<_>>().len(), 7);
        assert_eq!(map.random_distinct_keys(100).len(), 20);
    }

    #[test]
    fn test_scan_visits_every_key() {
        let map = ShardedMap::new(16);
        for i in 0..500 {
            map.put(key(&format!("key:{i}")), i);
        }

        let mut seen = HashSet::new();
        let mut cursor = 0;
        let mut rounds = 0;
        loop {
            let (chunk, next) = map.scan(cursor, 10, b"key:*").unwrap();
            seen.extend(chunk);
            rounds += 1;
            if next == 0 {
                break;
            }
            assert!(next > cursor, "cursor must advance");
            cursor = next;
        }
        assert_eq!(seen.len(), 500);
        assert!(rounds > 1);
    }

    #[test]
    fn test_scan_fast_path_and_filter() {
        let map = ShardedMap::new(16);
        for i in 0..20 {
            map.put(key(&format!("a{i}")), i);
            map.put(key(&format!("b{i}")), i);
        }
        let (all, next) = map.scan(0, 1000, b"*").unwrap();
        assert_eq!((all.len(), next), (40, 0));

        let (only_a, next) = map.scan(0, 1000, b"a*").unwrap();
        assert_eq!(next, 0);
        assert_eq!(only_a.len(), 20);
        assert!(only_a.iter().all(|k| k.starts_with(b"a")));

        assert!(map.scan(0, 10, b"[").is_err());
        assert_eq!(map.scan(999, 10, b"*").unwrap(), (vec![], 0));
    }

    #[test]
    fn test_concurrent_writers_same_shard() {
        let map = Arc::new(ShardedMap::<u64>::new(16));

        // Collect keys that all land in shard 0.
        let mut colliding = Vec::new();
        let mut i = 0;
        while colliding.len() < 8 {
            let k = key(&format!("c{i}"));
            if map.shard_index(&k) == 0 {
                colliding.push(k);
            }
            i += 1;
        }

        let handles: Vec<_> = colliding
            .iter()
            .cloned()
            .map(|k| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        map.update(k.clone(), |old| Some(old.copied().unwrap_or(0) + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for k in &colliding {
            assert_eq!(map.get(k), Some(1000));
        }
        assert_eq!(map.len(), colliding.len());
    }
}
