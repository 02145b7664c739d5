//! Storage Layer
//!
//! The building blocks a database is made of:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  ShardedMap<V>      power-of-two shards, one RwLock each   │
//! │    └─ lock_keys()   sorted multi-shard locking             │
//! │         └─ LockedShards  the only way commands touch data  │
//! ├────────────────────────────────────────────────────────────┤
//! │  SortedSet          HashMap<member, score> + Skiplist      │
//! ├────────────────────────────────────────────────────────────┤
//! │  ExpiryScheduler    timer task owning a deadline heap      │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```
//! use bytes::Bytes;
//! use ravenkv::storage::ShardedMap;
//!
//! let map: ShardedMap<u64> = ShardedMap::new(16);
//! let (a, b) = (Bytes::from("a"), Bytes::from("b"));
//!
//! let mut locked = map.lock_keys(&[a.clone()], &[b.clone()]);
//! locked.put(a.clone(), 1).unwrap();
//! assert_eq!(locked.get(&b).unwrap(), None);
//! drop(locked);
//!
//! assert_eq!(map.get(&a), Some(1));
//! ```

pub mod dict;
pub mod expiry;
pub mod lock;
pub mod pattern;
pub mod skiplist;
pub mod sorted_set;

pub use dict::{fnv32, ShardedMap, DEFAULT_SHARD_COUNT};
pub use expiry::{ExpiryCallback, ExpiryScheduler, TaskId, DEFAULT_TICK_INTERVAL};
pub use lock::{lock_plan, LockMode, LockRequest, LockedShards};
pub use pattern::{GlobPattern, PatternError};
pub use skiplist::{Border, Element, Skiplist};
pub use sorted_set::{NotFound, SortedSet};
