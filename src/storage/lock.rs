//! Multi-key Lock Manager
//!
//! Commands that touch several keys lock every shard those keys live in
//! before running, and keep the locks until the command (or the whole
//! transaction) finishes.
//!
//! ## Deadlock freedom
//!
//! Shard indices are de-duplicated and sorted, then acquired in ascending
//! order. Two callers with overlapping key sets therefore always request the
//! shared shards in the same global order and can never wait on each other in
//! a cycle. Guards are released in descending order when the
//! [`LockedShards`] view is dropped.
//!
//! ```text
//!   write = [b, a]   read = [c, a]
//!        │                  │
//!        ▼                  ▼
//!   shard(a)=3  shard(b)=9  shard(c)=3
//!        └───── plan: [(3, Write), (9, Write)] ─────┘
//! ```
//!
//! A shard is write-locked when any write key maps to it, even if read keys
//! map there too. Commands that walk the whole keyspace (KEYS, SCAN,
//! FLUSHDB) ask for every shard through [`LockRequest::whole_keyspace`]; the
//! plan is still one ascending pass, so they order against key-level
//! callers the same way.

use crate::error::LockError;
use crate::storage::dict::{read_shard, scan_shard, write_shard, ShardedMap};
use crate::storage::pattern::{GlobPattern, PatternError};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// `Write` sorts above `Read`, so `max` picks the stronger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Read,
    Write,
}

/// Computes the sorted, de-duplicated shard set for a key set.
pub fn lock_plan<V>(
    map: &ShardedMap<V>,
    write: &[Bytes],
    read: &[Bytes],
) -> Vec<(usize, LockMode)> {
    let mut plan = BTreeMap::new();
    for key in read {
        plan.entry(map.shard_index(key)).or_insert(LockMode::Read);
    }
    for key in write {
        plan.insert(map.shard_index(key), LockMode::Write);
    }
    plan.into_iter().collect()
}

/// The keys a command (or a whole transaction) needs locked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequest {
    pub write: Vec<Bytes>,
    pub read: Vec<Bytes>,
    /// Lock every shard in at least this mode.
    pub all_shards: Option<LockMode>,
}

impl LockRequest {
    pub fn new(write: Vec<Bytes>, read: Vec<Bytes>) -> Self {
        Self {
            write,
            read,
            all_shards: None,
        }
    }

    pub fn whole_keyspace(mode: LockMode) -> Self {
        Self {
            all_shards: Some(mode),
            ..Self::default()
        }
    }

    /// Folds another request into this one.
    pub fn merge(&mut self, other: LockRequest) {
        self.write.extend(other.write);
        self.read.extend(other.read);
        self.all_shards = self.all_shards.max(other.all_shards);
    }

    pub fn plan<V>(&self, map: &ShardedMap<V>) -> Vec<(usize, LockMode)> {
        let keyed = lock_plan(map, &self.write, &self.read);
        let Some(floor) = self.all_shards else {
            return keyed;
        };
        let mut plan: Vec<_> = (0..map.shard_count()).map(|i| (i, floor)).collect();
        for (index, mode) in keyed {
            plan[index].1 = plan[index].1.max(mode);
        }
        plan
    }
}

enum ShardGuard<'a, V> {
    Read(RwLockReadGuard<'a, HashMap<Bytes, V>>),
    Write(RwLockWriteGuard<'a, HashMap<Bytes, V>>),
}

impl<V> ShardGuard<'_, V> {
    fn entries(&self) -> &HashMap<Bytes, V> {
        match self {
            ShardGuard::Read(guard) => &**guard,
            ShardGuard::Write(guard) => &**guard,
        }
    }
}

/// A set of shards locked together.
///
/// All key access inside a command goes through this view. Touching a key
/// whose shard is not held, or writing through a read-held shard, returns a
/// [`LockError`] instead of silently taking another lock.
pub struct LockedShards<'a, V> {
    map: &'a ShardedMap<V>,
    /// Sorted by shard index.
    guards: Vec<(usize, ShardGuard<'a, V>)>,
}

impl<V> std::fmt::Debug for LockedShards<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held: Vec<_> = self
            .guards
            .iter()
            .map(|(index, guard)| match guard {
                ShardGuard::Read(_) => (*index, LockMode::Read),
                ShardGuard::Write(_) => (*index, LockMode::Write),
            })
            .collect();
        f.debug_struct("LockedShards").field("held", &held).finish()
    }
}

impl<'a, V> LockedShards<'a, V> {
    fn acquire(map: &'a ShardedMap<V>, plan: Vec<(usize, LockMode)>) -> Self {
        trace!(shards = ?plan, "acquiring shard locks");
        let guards = plan
            .into_iter()
            .map(|(index, mode)| {
                let guard = match mode {
                    LockMode::Read => ShardGuard::Read(read_shard(map.shard(index))),
                    LockMode::Write => ShardGuard::Write(write_shard(map.shard(index))),
                };
                (index, guard)
            })
            .collect();
        Self { map, guards }
    }

    /// The map this view locks.
    pub fn map(&self) -> &'a ShardedMap<V> {
        self.map
    }

    /// The mode a key's shard is held in, if any.
    pub fn mode(&self, key: &[u8]) -> Option<LockMode> {
        let shard = self.map.shard_index(key);
        self.position(shard).ok().map(|pos| match self.guards[pos].1 {
            ShardGuard::Read(_) => LockMode::Read,
            ShardGuard::Write(_) => LockMode::Write,
        })
    }

    /// Fails unless the key's shard is write-held.
    pub fn ensure_writable(&self, key: &[u8]) -> Result<(), LockError> {
        let shard = self.map.shard_index(key);
        match self.mode(key) {
            Some(LockMode::Write) => Ok(()),
            Some(LockMode::Read) => Err(LockError::ReadOnly { shard }),
            None => Err(LockError::NotHeld { shard }),
        }
    }

    fn position(&self, shard: usize) -> Result<usize, usize> {
        self.guards.binary_search_by_key(&shard, |(index, _)| *index)
    }

    fn entries(&self, key: &[u8]) -> Result<&HashMap<Bytes, V>, LockError> {
        let shard = self.map.shard_index(key);
        let pos = self
            .position(shard)
            .map_err(|_| LockError::NotHeld { shard })?;
        Ok(self.guards[pos].1.entries())
    }

    fn entries_mut(&mut self, key: &[u8]) -> Result<&mut HashMap<Bytes, V>, LockError> {
        let shard = self.map.shard_index(key);
        let pos = self
            .position(shard)
            .map_err(|_| LockError::NotHeld { shard })?;
        match &mut self.guards[pos].1 {
            ShardGuard::Write(guard) => Ok(&mut **guard),
            ShardGuard::Read(_) => Err(LockError::ReadOnly { shard }),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&V>, LockError> {
        Ok(self.entries(key)?.get(key))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, LockError> {
        Ok(self.entries(key)?.contains_key(key))
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Result<Option<&mut V>, LockError> {
        Ok(self.entries_mut(key)?.get_mut(key))
    }

    /// Inserts or overwrites. Returns 1.
    pub fn put(&mut self, key: Bytes, value: V) -> Result<usize, LockError> {
        let map = self.map;
        if self.entries_mut(&key)?.insert(key, value).is_none() {
            map.note_inserted();
        }
        Ok(1)
    }

    pub fn put_if_absent(&mut self, key: Bytes, value: V) -> Result<usize, LockError> {
        let map = self.map;
        let entries = self.entries_mut(&key)?;
        if entries.contains_key(&key) {
            return Ok(0);
        }
        entries.insert(key, value);
        map.note_inserted();
        Ok(1)
    }

    pub fn put_if_exists(&mut self, key: Bytes, value: V) -> Result<usize, LockError> {
        match self.entries_mut(&key)?.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<(Option<V>, usize), LockError> {
        let map = self.map;
        match self.entries_mut(key)?.remove(key) {
            Some(value) => {
                map.note_removed();
                Ok((Some(value), 1))
            }
            None => Ok((None, 0)),
        }
    }

    /// Visits every entry of every held shard in shard order. Stops early
    /// when `f` returns false.
    pub fn for_each(&self, mut f: impl FnMut(&Bytes, &V) -> bool) {
        for (_, guard) in &self.guards {
            for (key, value) in guard.entries() {
                if !f(key, value) {
                    return;
                }
            }
        }
    }

    /// Cursor scan over the held shards; behaves like [`ShardedMap::scan`]
    /// when every shard is held.
    pub fn scan(
        &self,
        cursor: usize,
        count: usize,
        pattern: &[u8],
    ) -> Result<(Vec<Bytes>, usize), PatternError> {
        let glob = GlobPattern::compile(pattern)?;
        let mut result = Vec::new();
        for (index, guard) in self.guards.iter().filter(|(index, _)| *index >= cursor) {
            if !scan_shard(&mut result, *index, cursor, count, guard.entries(), &glob) {
                return Ok((result, *index));
            }
        }
        Ok((result, 0))
    }

    /// Empties every shard. Every shard must be write-held.
    pub fn clear(&mut self) -> Result<usize, LockError> {
        if self.guards.len() != self.map.shard_count() {
            let held: Vec<usize> = self.guards.iter().map(|(index, _)| *index).collect();
            let shard = (0..self.map.shard_count())
                .find(|i| !held.contains(i))
                .unwrap_or_default();
            return Err(LockError::NotHeld { shard });
        }
        if let Some((shard, _)) = self
            .guards
            .iter()
            .find(|(_, guard)| matches!(guard, ShardGuard::Read(_)))
        {
            return Err(LockError::ReadOnly { shard: *shard });
        }
        let mut removed = 0;
        for (_, guard) in &mut self.guards {
            if let ShardGuard::Write(entries) = guard {
                removed += entries.len();
                entries.clear();
            }
        }
        for _ in 0..removed {
            self.map.note_removed();
        }
        Ok(removed)
    }

    /// Releases every shard, highest index first.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<V> Drop for LockedShards<'_, V> {
    fn drop(&mut self) {
        while let Some((index, guard)) = self.guards.pop() {
            drop(guard);
            trace!(shard = index, "released shard lock");
        }
    }
}

impl<V> ShardedMap<V> {
    /// Locks the shards of `write` and `read` keys in ascending order.
    pub fn lock_keys(&self, write: &[Bytes], read: &[Bytes]) -> LockedShards<'_, V> {
        LockedShards::acquire(self, lock_plan(self, write, read))
    }

    pub fn lock(&self, request: &LockRequest) -> LockedShards<'_, V> {
        LockedShards::acquire(self, request.plan(self))
    }

    pub fn lock_all(&self, mode: LockMode) -> LockedShards<'_, V> {
        self.lock(&LockRequest::whole_keyspace(mode))
    }

    pub fn lock_write(&self, key: &Bytes) -> LockedShards<'_, V> {
        self.lock_keys(std::slice::from_ref(key), &[])
    }

    pub fn lock_read(&self, key: &Bytes) -> LockedShards<'_, V> {
        self.lock_keys(&[], std::slice::from_ref(key))
    }
}
