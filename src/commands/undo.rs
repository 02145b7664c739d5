//! Undo logs and snapshot lines.
//!
//! An undo log is a list of ordinary command lines that, replayed in order,
//! put a key back into the state it had when the log was captured:
//!
//! ```text
//!   absent key        →  DEL k
//!   string            →  DEL k, SET k v [, PEXPIREAT k ms]
//!   list              →  DEL k, RPUSH k v1 v2 ... [, PEXPIREAT k ms]
//!   sorted set        →  DEL k, ZADD k s1 m1 s2 m2 ... [, PEXPIREAT k ms]
//! ```
//!
//! Undo logs are captured under the command's locks, right before the
//! command runs.

use crate::commands::{format_f64, CmdLine};
use crate::database::{Database, Entity};
use crate::storage::LockedShards;
use bytes::Bytes;
use tracing::warn;

fn del(key: &Bytes) -> CmdLine {
    vec![Bytes::from_static(b"DEL"), key.clone()]
}

/// Lines that re-create the key as it is now, without deleting it first.
/// An absent key yields a single `DEL`.
pub fn snapshot_key(db: &Database, locked: &LockedShards<'_, Entity>, key: &Bytes) -> Vec<CmdLine> {
    let entity = match db.get_entity(locked, key) {
        Ok(Some(entity)) => entity,
        Ok(None) => return vec![del(key)],
        Err(err) => {
            warn!(key = ?key, error = %err, "cannot snapshot a key outside the lock set");
            return Vec::new();
        }
    };

    let mut lines = Vec::with_capacity(2);
    match entity {
        Entity::String(value) => {
            lines.push(vec![Bytes::from_static(b"SET"), key.clone(), value.clone()]);
        }
        Entity::List(items) => {
            let mut line = Vec::with_capacity(2 + items.len());
            line.push(Bytes::from_static(b"RPUSH"));
            line.push(key.clone());
            line.extend(items.iter().cloned());
            lines.push(line);
        }
        Entity::SortedSet(set) => {
            let mut line = Vec::with_capacity(2 + set.len() * 2);
            line.push(Bytes::from_static(b"ZADD"));
            line.push(key.clone());
            for element in set.iter() {
                line.push(format_f64(element.score));
                line.push(element.member.clone());
            }
            lines.push(line);
        }
    }
    lines.extend(db.ttl_cmd(key));
    lines
}

/// Lines that restore each key, whatever happens to it in between.
pub fn rollback_given_keys(
    db: &Database,
    locked: &LockedShards<'_, Entity>,
    keys: &[Bytes],
) -> Vec<CmdLine> {
    let mut lines = Vec::new();
    for key in keys {
        let snapshot = snapshot_key(db, locked, key);
        let existed = snapshot.first().is_some_and(|line| line[0] != "DEL");
        if existed {
            lines.push(del(key));
        }
        lines.extend(snapshot);
    }
    lines
}

pub fn rollback_first_key(db: &Database, locked: &LockedShards<'_, Entity>, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, locked, &args[..1])
}

pub fn rollback_first_two_keys(
    db: &Database,
    locked: &LockedShards<'_, Entity>,
    args: &[Bytes],
) -> Vec<CmdLine> {
    rollback_given_keys(db, locked, &args[..2])
}

pub fn rollback_all_keys(db: &Database, locked: &LockedShards<'_, Entity>, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, locked, args)
}

/// `key value [key value ...]`
pub fn rollback_even_keys(db: &Database, locked: &LockedShards<'_, Entity>, args: &[Bytes]) -> Vec<CmdLine> {
    let keys: Vec<Bytes> = args.iter().step_by(2).cloned().collect();
    rollback_given_keys(db, locked, &keys)
}

/// Every live key; used by FLUSHDB.
pub fn rollback_keyspace(db: &Database, locked: &LockedShards<'_, Entity>, _args: &[Bytes]) -> Vec<CmdLine> {
    let mut keys = Vec::new();
    db.for_each(locked, |key, _| {
        keys.push(key.clone());
        true
    });
    rollback_given_keys(db, locked, &keys)
}

/// Append-only log form of a write that may carry a relative TTL: the
/// key's resulting state with an absolute deadline.
pub fn log_first_key_snapshot(
    db: &Database,
    locked: &LockedShards<'_, Entity>,
    args: &[Bytes],
) -> Vec<CmdLine> {
    snapshot_key(db, locked, &args[0])
}

/// Append-only log form of EXPIRE and PEXPIRE: the absolute deadline, or a
/// DEL when the key is gone.
pub fn log_absolute_expiry(
    db: &Database,
    locked: &LockedShards<'_, Entity>,
    args: &[Bytes],
) -> Vec<CmdLine> {
    let key = &args[0];
    match db.get_entity(locked, key) {
        Ok(Some(_)) => db.ttl_cmd(key).into_iter().collect(),
        _ => vec![del(key)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{cmdline, CommandRegistry};
    use crate::database::{DatabaseConfig, Entity};
    use crate::storage::SortedSet;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn database() -> Database {
        Database::new(
            0,
            Arc::new(CommandRegistry::standard()),
            DatabaseConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_absent_key_rolls_back_to_del() {
        let db = database();
        let k = Bytes::from("k");
        let locked = db.lock_keys(std::slice::from_ref(&k), &[]);
        assert_eq!(
            rollback_first_key(&db, &locked, std::slice::from_ref(&k)),
            vec![cmdline(&[b"DEL", b"k"])]
        );
    }

    #[tokio::test]
    async fn test_string_with_ttl() {
        let db = database();
        let k = Bytes::from("k");
        db.put(k.clone(), Entity::String(Bytes::from("v")));
        let mut locked = db.lock_keys(std::slice::from_ref(&k), &[]);
        db.expire(&mut locked, &k, SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        let lines = rollback_first_key(&db, &locked, std::slice::from_ref(&k));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], cmdline(&[b"DEL", b"k"]));
        assert_eq!(lines[1], cmdline(&[b"SET", b"k", b"v"]));
        assert_eq!(lines[2][0], Bytes::from("PEXPIREAT"));
    }

    #[tokio::test]
    async fn test_sorted_set_snapshot() {
        let db = database();
        let k = Bytes::from("z");
        let mut set = SortedSet::new();
        set.put(Bytes::from("b"), 2.5);
        set.put(Bytes::from("a"), 1.0);
        db.put(k.clone(), Entity::SortedSet(set));

        let locked = db.lock_keys(&[], std::slice::from_ref(&k));
        assert_eq!(
            snapshot_key(&db, &locked, &k),
            vec![cmdline(&[b"ZADD", b"z", b"1", b"a", b"2.5", b"b"])]
        );
    }

    #[tokio::test]
    async fn test_list_snapshot_keeps_order_and_ttl() {
        let db = database();
        let k = Bytes::from("l");
        let items = ["x", "y", "z"].into_iter().map(Bytes::from).collect();
        db.put(k.clone(), Entity::List(items));
        let mut locked = db.lock_keys(std::slice::from_ref(&k), &[]);
        db.expire(&mut locked, &k, SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        let lines = rollback_first_key(&db, &locked, std::slice::from_ref(&k));
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], cmdline(&[b"DEL", b"l"]));
        assert_eq!(lines[1], cmdline(&[b"RPUSH", b"l", b"x", b"y", b"z"]));
        assert_eq!(lines[2][0], Bytes::from("PEXPIREAT"));
    }

    #[tokio::test]
    async fn test_even_keys_and_keyspace() {
        let db = database();
        db.put(Bytes::from("a"), Entity::String(Bytes::from("1")));
        db.put(Bytes::from("b"), Entity::String(Bytes::from("2")));

        let locked = db.lock(&crate::storage::LockRequest::whole_keyspace(
            crate::storage::LockMode::Read,
        ));
        let lines = rollback_even_keys(&db, &locked, &cmdline(&[b"a", b"x", b"c", b"y"]));
        assert_eq!(
            lines,
            vec![
                cmdline(&[b"DEL", b"a"]),
                cmdline(&[b"SET", b"a", b"1"]),
                cmdline(&[b"DEL", b"c"]),
            ]
        );
        assert_eq!(rollback_keyspace(&db, &locked, &[]).len(), 4);
    }
}
