//! Database
//!
//! One logical keyspace: the data, the per-key deadlines, the per-key
//! version counters, and the expiry timer that removes keys when their
//! deadline passes.
//!
//! ```text
//! ┌─────────────────────────── Database ───────────────────────────┐
//! │                                                                │
//! │   data      ShardedMap<Entity>      locked per command         │
//! │   ttl       ShardedMap<SystemTime>  deadline per key           │
//! │   versions  ShardedMap<u64>         bumped on every write      │
//! │                                                                │
//! │   ExpiryScheduler ──(deadline)──> callback ──> lock key,       │
//! │                                   re-check ttl, remove         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Commands reach `data` only through a [`LockedShards`] view acquired for
//! the keys they declared. The `ttl` and `versions` maps are touched while
//! that view is held, so a key's deadline and version only change under the
//! key's write lock. Lock order is always data shards, then the ttl shard,
//! then the version shard; the expiry callback follows the same order.
//!
//! ## Expiry
//!
//! Keys are removed actively by the timer callback and hidden lazily: a read
//! never returns a key whose deadline has passed, and a write purges such a
//! key before touching it.

pub mod server;
pub mod transaction;

pub use server::Server;

use crate::aof::AppendLog;
use crate::commands::registry::command_name;
use crate::commands::{CmdLine, CommandRegistry};
use crate::connection::Connection;
use crate::error::LockError;
use crate::protocol::Reply;
use crate::storage::{
    ExpiryScheduler, GlobPattern, LockMode, LockRequest, LockedShards, PatternError, ShardedMap,
    SortedSet, DEFAULT_SHARD_COUNT, DEFAULT_TICK_INTERVAL,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    String(Bytes),
    List(VecDeque<Bytes>),
    SortedSet(SortedSet),
}

impl Entity {
    /// The name `TYPE` reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::String(_) => "string",
            Entity::List(_) => "list",
            Entity::SortedSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseConfig {
    pub shard_count: usize,
    /// How often the expiry timer looks for due keys.
    pub expiry_tick: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            expiry_tick: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// The maps shared with expiry callbacks. Callbacks hold it weakly, so a
/// dropped database is never kept alive by its pending timers.
#[derive(Debug)]
struct Keyspace {
    data: ShardedMap<Entity>,
    ttl: ShardedMap<SystemTime>,
    versions: ShardedMap<u64>,
}

impl Keyspace {
    fn new(shard_count: usize) -> Self {
        Self {
            data: ShardedMap::new(shard_count),
            ttl: ShardedMap::new(shard_count),
            versions: ShardedMap::new(shard_count),
        }
    }

    fn is_expired(&self, key: &[u8], now: SystemTime) -> bool {
        self.ttl
            .with_value(key, |deadline| deadline.is_some_and(|d| *d <= now))
    }

    fn bump_version(&self, key: &[u8]) {
        self.versions.update(Bytes::copy_from_slice(key), |version| {
            Some(version.copied().unwrap_or(0) + 1)
        });
    }

    /// Timer callback body: removes the key if its current deadline has
    /// passed. A key re-armed with a later deadline is left alone.
    fn expire_if_due(&self, db: usize, key: &Bytes) -> bool {
        let mut locked = self.data.lock_write(key);
        if !self.is_expired(key, SystemTime::now()) {
            return false;
        }
        let removed = matches!(locked.remove(key), Ok((Some(_), _)));
        self.ttl.remove(key);
        if removed {
            self.bump_version(key);
        }
        drop(locked);

        debug!(db, key = ?key, removed, "key expired");
        removed
    }
}

/// A single numbered database.
pub struct Database {
    index: usize,
    keyspace: Arc<Keyspace>,
    scheduler: ExpiryScheduler,
    registry: Arc<CommandRegistry>,
    append_log: OnceLock<Arc<dyn AppendLog>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("index", &self.index)
            .field("keys", &self.len())
            .field("append_log", &self.append_log.get().is_some())
            .finish()
    }
}

impl Database {
    /// Creates an empty database. Must be called inside a Tokio runtime:
    /// the expiry timer task is spawned here.
    pub fn new(index: usize, registry: Arc<CommandRegistry>, config: DatabaseConfig) -> Self {
        Self {
            index,
            keyspace: Arc::new(Keyspace::new(config.shard_count)),
            scheduler: ExpiryScheduler::start(config.expiry_tick),
            registry,
            append_log: OnceLock::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Starts forwarding successful writes to `log`. Only the first call
    /// has an effect; returns whether this one did.
    pub fn attach_append_log(&self, log: Arc<dyn AppendLog>) -> bool {
        self.append_log.set(log).is_ok()
    }

    fn append(&self, lines: Vec<CmdLine>) {
        if let Some(log) = self.append_log.get() {
            for line in lines {
                log.append_command(self.index, line);
            }
        }
    }

    // ========================================================================
    // Locking
    // ========================================================================

    pub fn lock(&self, request: &LockRequest) -> LockedShards<'_, Entity> {
        self.keyspace.data.lock(request)
    }

    pub fn lock_keys(&self, write: &[Bytes], read: &[Bytes]) -> LockedShards<'_, Entity> {
        self.keyspace.data.lock_keys(write, read)
    }

    // ========================================================================
    // Entity primitives (caller holds the key's shard)
    // ========================================================================

    /// The live entity at `key`. A key past its deadline reads as absent.
    pub fn get_entity<'l>(
        &self,
        locked: &'l LockedShards<'_, Entity>,
        key: &[u8],
    ) -> Result<Option<&'l Entity>, LockError> {
        let entity = locked.get(key)?;
        if entity.is_some() && self.keyspace.is_expired(key, SystemTime::now()) {
            return Ok(None);
        }
        Ok(entity)
    }

    pub fn get_entity_mut<'l>(
        &self,
        locked: &'l mut LockedShards<'_, Entity>,
        key: &[u8],
    ) -> Result<Option<&'l mut Entity>, LockError> {
        self.purge_expired(locked, key)?;
        locked.get_mut(key)
    }

    /// Stores `entity`, keeping any live deadline the key already has.
    pub fn put_entity(
        &self,
        locked: &mut LockedShards<'_, Entity>,
        key: Bytes,
        entity: Entity,
    ) -> Result<usize, LockError> {
        self.purge_expired(locked, &key)?;
        locked.put(key, entity)
    }

    pub fn put_entity_if_absent(
        &self,
        locked: &mut LockedShards<'_, Entity>,
        key: Bytes,
        entity: Entity,
    ) -> Result<usize, LockError> {
        self.purge_expired(locked, &key)?;
        locked.put_if_absent(key, entity)
    }

    pub fn put_entity_if_exists(
        &self,
        locked: &mut LockedShards<'_, Entity>,
        key: Bytes,
        entity: Entity,
    ) -> Result<usize, LockError> {
        self.purge_expired(locked, &key)?;
        locked.put_if_exists(key, entity)
    }

    /// Removes the key together with its deadline.
    pub fn remove_entity(
        &self,
        locked: &mut LockedShards<'_, Entity>,
        key: &Bytes,
    ) -> Result<Option<Entity>, LockError> {
        self.purge_expired(locked, key)?;
        let (entity, _) = locked.remove(key)?;
        if entity.is_some() {
            self.persist_key(locked, key)?;
        }
        Ok(entity)
    }

    /// Drops a key whose deadline already passed. Needs the shard
    /// write-held.
    fn purge_expired(
        &self,
        locked: &mut LockedShards<'_, Entity>,
        key: &[u8],
    ) -> Result<(), LockError> {
        locked.ensure_writable(key)?;
        if !self.keyspace.is_expired(key, SystemTime::now()) {
            return Ok(());
        }
        if let (Some(_), _) = locked.remove(key)? {
            self.keyspace.bump_version(key);
        }
        self.keyspace.ttl.remove(key);
        trace!(db = self.index, key = ?key, "purged expired key");
        Ok(())
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Sets the key's deadline and arms its timer. A deadline that already
    /// passed removes the key immediately.
    pub fn expire(
        &self,
        locked: &mut LockedShards<'_, Entity>,
        key: &Bytes,
        deadline: SystemTime,
    ) -> Result<(), LockError> {
        locked.ensure_writable(key)?;
        if deadline <= SystemTime::now() {
            self.remove_entity(locked, key)?;
            return Ok(());
        }

        self.keyspace.ttl.put(key.clone(), deadline);
        let keyspace = Arc::downgrade(&self.keyspace);
        let (db, owned) = (self.index, key.clone());
        self.scheduler.schedule(
            key.clone(),
            deadline,
            Box::new(move || {
                if let Some(keyspace) = keyspace.upgrade() {
                    keyspace.expire_if_due(db, &owned);
                }
            }),
        );
        Ok(())
    }

    /// Clears the key's deadline. Returns whether it had one.
    pub fn persist_key(
        &self,
        locked: &LockedShards<'_, Entity>,
        key: &Bytes,
    ) -> Result<bool, LockError> {
        locked.ensure_writable(key)?;
        let (_, removed) = self.keyspace.ttl.remove(key);
        if removed == 1 {
            self.scheduler.cancel(key.clone());
        }
        Ok(removed == 1)
    }

    pub fn ttl(&self, key: &[u8]) -> Option<SystemTime> {
        self.keyspace.ttl.get(key)
    }

    /// `PEXPIREAT key <unix ms>` re-creating the key's current deadline.
    pub fn ttl_cmd(&self, key: &Bytes) -> Option<CmdLine> {
        let deadline = self.ttl(key)?;
        Some(vec![
            Bytes::from_static(b"PEXPIREAT"),
            key.clone(),
            Bytes::from(unix_millis(deadline).to_string()),
        ])
    }

    // ========================================================================
    // Versions
    // ========================================================================

    pub fn bump_version(&self, keys: &[Bytes]) {
        for key in keys {
            self.keyspace.bump_version(key);
        }
    }

    /// 0 for a key that was never written.
    pub fn get_version(&self, key: &[u8]) -> u64 {
        self.keyspace.versions.get(key).unwrap_or(0)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs one command line for a client: transaction verbs first, then
    /// queueing while the client is in MULTI, otherwise a normal locked run.
    pub fn exec(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        match command_name(cmdline).as_str() {
            "multi" => self.start_multi(conn, cmdline),
            "exec" => self.exec_multi(conn, cmdline),
            "discard" => self.discard(conn, cmdline),
            "watch" => self.watch(conn, cmdline),
            "unwatch" => self.unwatch(conn, cmdline),
            _ if conn.in_multi() => self.enqueue(conn, cmdline),
            _ => self.exec_normal(cmdline),
        }
    }

    fn exec_normal(&self, cmdline: &[Bytes]) -> Reply {
        let spec = match self.registry.resolve(cmdline) {
            Ok(spec) => spec,
            Err(err) => return err.into(),
        };
        let args = &cmdline[1..];
        let request = (spec.keys)(args);
        let mut locked = self.lock(&request);

        let reply = Reply::from((spec.exec)(self, &mut locked, args));
        if spec.is_write() && !reply.is_error() {
            self.bump_version(&request.write);
            self.append(spec.log_lines(self, &locked, cmdline));
        }
        trace!(db = self.index, command = spec.name, "executed");
        reply
    }

    /// Runs a command against shards the caller already holds. Versions are
    /// not bumped and nothing is logged; used to replay undo logs.
    pub fn exec_with_lock(&self, locked: &mut LockedShards<'_, Entity>, cmdline: &[Bytes]) -> Reply {
        match self.registry.resolve(cmdline) {
            Ok(spec) => (spec.exec)(self, locked, &cmdline[1..]).into(),
            Err(err) => err.into(),
        }
    }

    // ========================================================================
    // Whole keyspace
    // ========================================================================

    /// Visits every live key in the held shards.
    pub fn for_each(
        &self,
        locked: &LockedShards<'_, Entity>,
        mut f: impl FnMut(&Bytes, &Entity) -> bool,
    ) {
        let now = SystemTime::now();
        locked.for_each(|key, entity| {
            if self.keyspace.is_expired(key, now) {
                return true;
            }
            f(key, entity)
        });
    }

    pub fn keys(
        &self,
        locked: &LockedShards<'_, Entity>,
        pattern: &[u8],
    ) -> Result<Vec<Bytes>, PatternError> {
        let glob = GlobPattern::compile(pattern)?;
        let mut keys = Vec::new();
        self.for_each(locked, |key, _| {
            if glob.matches(key) {
                keys.push(key.clone());
            }
            true
        });
        Ok(keys)
    }

    pub fn scan(
        &self,
        locked: &LockedShards<'_, Entity>,
        cursor: usize,
        count: usize,
        pattern: &[u8],
    ) -> Result<(Vec<Bytes>, usize), PatternError> {
        let (mut keys, next) = locked.scan(cursor, count, pattern)?;
        let now = SystemTime::now();
        keys.retain(|key| !self.keyspace.is_expired(key, now));
        Ok((keys, next))
    }

    /// Stored keys, including ones past their deadline that no one has
    /// touched since.
    pub fn len(&self) -> usize {
        self.keyspace.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key. Every version is bumped so pending WATCHes fail.
    pub fn flush(&self) -> Result<usize, LockError> {
        let mut locked = self.lock(&LockRequest::whole_keyspace(LockMode::Write));
        self.flush_locked(&mut locked)
    }

    pub fn flush_locked(&self, locked: &mut LockedShards<'_, Entity>) -> Result<usize, LockError> {
        let mut keys = Vec::new();
        locked.for_each(|key, _| {
            keys.push(key.clone());
            true
        });
        let removed = locked.clear()?;
        self.keyspace.ttl.clear();
        self.scheduler.clear();
        self.bump_version(&keys);
        debug!(db = self.index, removed, "database flushed");
        Ok(removed)
    }

    // ========================================================================
    // Unlocked convenience
    // ========================================================================

    pub fn get(&self, key: &Bytes) -> Option<Entity> {
        let locked = self.keyspace.data.lock_read(key);
        self.get_entity(&locked, key).ok().flatten().cloned()
    }

    pub fn put(&self, key: Bytes, entity: Entity) {
        let mut locked = self.keyspace.data.lock_write(&key);
        if let Err(err) = self.put_entity(&mut locked, key, entity) {
            warn!(db = self.index, error = %err, "put failed");
        }
    }

    pub fn remove(&self, key: &Bytes) -> Option<Entity> {
        let mut locked = self.keyspace.data.lock_write(key);
        self.remove_entity(&mut locked, key).ok().flatten()
    }
}

/// Milliseconds since the Unix epoch, 0 for earlier times.
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// The inverse of [`unix_millis`]; negative values clamp to the epoch.
pub fn from_unix_millis(ms: i64) -> SystemTime {
    let ms = u64::try_from(ms).unwrap_or(0);
    UNIX_EPOCH
        .checked_add(Duration::from_millis(ms))
        .unwrap_or(UNIX_EPOCH)
}

/// A deadline `ms` milliseconds from now; negative values lie in the past.
pub fn deadline_after(ms: i64) -> SystemTime {
    let now = SystemTime::now();
    let offset = Duration::from_millis(ms.unsigned_abs());
    let deadline = if ms >= 0 {
        now.checked_add(offset)
    } else {
        now.checked_sub(offset)
    };
    deadline.unwrap_or(UNIX_EPOCH)
}
