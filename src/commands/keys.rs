//! Key and keyspace commands.
//!
//! `KEYS`, `SCAN` and `FLUSHDB` walk every shard, so they lock the whole
//! keyspace (read for the first two, write for FLUSHDB) instead of a key
//! set. Everything else locks only the keys it names.

use crate::commands::registry::{CommandRegistry, CommandSpec};
use crate::commands::undo::{
    log_absolute_expiry, rollback_all_keys, rollback_first_key, rollback_first_two_keys,
    rollback_keyspace,
};
use crate::commands::{
    eq_ignore_case, no_keys, parse_i64, read_all_keys, read_first_key, write_all_keys,
    write_first_key, write_first_two_keys,
};
use crate::database::{deadline_after, from_unix_millis, Database, Entity};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Reply;
use crate::storage::{LockMode, LockRequest, LockedShards};
use bytes::Bytes;
use std::time::SystemTime;

/// Default batch size for SCAN.
const DEFAULT_SCAN_COUNT: usize = 10;

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandSpec::write("del", -2, del, write_all_keys, rollback_all_keys));
    registry.register(CommandSpec::read("exists", -2, exists, read_all_keys));
    registry.register(
        CommandSpec::write("expire", 3, expire, write_first_key, rollback_first_key)
            .with_log(log_absolute_expiry),
    );
    registry.register(
        CommandSpec::write("pexpire", 3, pexpire, write_first_key, rollback_first_key)
            .with_log(log_absolute_expiry),
    );
    registry.register(CommandSpec::write("expireat", 3, expireat, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("pexpireat", 3, pexpireat, write_first_key, rollback_first_key));
    registry.register(CommandSpec::read("ttl", 2, ttl, read_first_key));
    registry.register(CommandSpec::read("pttl", 2, pttl, read_first_key));
    registry.register(CommandSpec::write("persist", 2, persist, write_first_key, rollback_first_key));
    registry.register(CommandSpec::read("type", 2, key_type, read_first_key));
    registry.register(CommandSpec::write("rename", 3, rename, write_first_two_keys, rollback_first_two_keys));
    registry.register(CommandSpec::write(
        "renamenx",
        3,
        renamenx,
        write_first_two_keys,
        rollback_first_two_keys,
    ));
    registry.register(CommandSpec::read("keys", 2, keys, read_keyspace));
    registry.register(CommandSpec::read("scan", -2, scan, read_keyspace));
    registry.register(CommandSpec::read("dbsize", 1, dbsize, no_keys));
    registry.register(CommandSpec::write("flushdb", 1, flushdb, write_keyspace, rollback_keyspace));
    registry.register(CommandSpec::read("ping", -1, ping, no_keys));
    registry.register(CommandSpec::read("echo", 2, echo, no_keys));
    registry.register(CommandSpec::read("getversion", 2, getversion, read_first_key));
}

fn read_keyspace(_args: &[Bytes]) -> LockRequest {
    LockRequest::whole_keyspace(LockMode::Read)
}

fn write_keyspace(_args: &[Bytes]) -> LockRequest {
    LockRequest::whole_keyspace(LockMode::Write)
}

// ============================================================================
// Existence
// ============================================================================

/// DEL key [key ...]
fn del(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let mut removed = 0;
    for key in args {
        if db.remove_entity(locked, key)?.is_some() {
            removed += 1;
        }
    }
    Ok(Reply::Integer(removed))
}

/// EXISTS key [key ...]
///
/// A key named twice is counted twice.
fn exists(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let mut count = 0;
    for key in args {
        if db.get_entity(locked, key)?.is_some() {
            count += 1;
        }
    }
    Ok(Reply::Integer(count))
}

/// TYPE key
fn key_type(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let name = db
        .get_entity(locked, &args[0])?
        .map_or("none", Entity::type_name);
    Ok(Reply::Status(name.to_string()))
}

// ============================================================================
// Expiry
// ============================================================================

fn set_deadline(
    db: &Database,
    locked: &mut LockedShards<'_, Entity>,
    key: &Bytes,
    deadline: SystemTime,
) -> CommandResult<Reply> {
    if db.get_entity(locked, key)?.is_none() {
        return Ok(Reply::Integer(0));
    }
    db.expire(locked, key, deadline)?;
    Ok(Reply::Integer(1))
}

fn millis(amount: i64, unit: i64, command: &str) -> CommandResult<i64> {
    amount.checked_mul(unit).ok_or_else(|| {
        CommandError::InvalidArgument(format!("invalid expire time in '{command}' command"))
    })
}

/// EXPIRE key seconds
fn expire(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let ms = millis(parse_i64(&args[1])?, 1000, "expire")?;
    set_deadline(db, locked, &args[0], deadline_after(ms))
}

/// PEXPIRE key milliseconds
fn pexpire(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let ms = parse_i64(&args[1])?;
    set_deadline(db, locked, &args[0], deadline_after(ms))
}

/// EXPIREAT key unix-seconds
fn expireat(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let ms = millis(parse_i64(&args[1])?, 1000, "expireat")?;
    set_deadline(db, locked, &args[0], from_unix_millis(ms))
}

/// PEXPIREAT key unix-milliseconds
fn pexpireat(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let ms = parse_i64(&args[1])?;
    set_deadline(db, locked, &args[0], from_unix_millis(ms))
}

/// Remaining time in milliseconds: -2 for a missing key, -1 for no deadline.
fn remaining_ms(db: &Database, locked: &LockedShards<'_, Entity>, key: &Bytes) -> CommandResult<i64> {
    if db.get_entity(locked, key)?.is_none() {
        return Ok(-2);
    }
    Ok(match db.ttl(key) {
        Some(deadline) => deadline
            .duration_since(SystemTime::now())
            .map(|left| i64::try_from(left.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0),
        None => -1,
    })
}

/// TTL key
fn ttl(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let ms = remaining_ms(db, locked, &args[0])?;
    Ok(Reply::Integer(if ms < 0 { ms } else { (ms + 500) / 1000 }))
}

/// PTTL key
fn pttl(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    Ok(Reply::Integer(remaining_ms(db, locked, &args[0])?))
}

/// PERSIST key
fn persist(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    if db.get_entity(locked, key)?.is_none() {
        return Ok(Reply::Integer(0));
    }
    Ok(Reply::Integer(i64::from(db.persist_key(locked, key)?)))
}

// ============================================================================
// Renaming
// ============================================================================

/// Moves the value and its deadline from `src` to `dst`, replacing `dst`.
fn move_key(
    db: &Database,
    locked: &mut LockedShards<'_, Entity>,
    src: &Bytes,
    dst: &Bytes,
) -> CommandResult<()> {
    let deadline = db.ttl(src);
    let entity = db.remove_entity(locked, src)?.ok_or(CommandError::KeyNotFound)?;
    db.remove_entity(locked, dst)?;
    db.put_entity(locked, dst.clone(), entity)?;
    if let Some(deadline) = deadline {
        db.expire(locked, dst, deadline)?;
    }
    Ok(())
}

/// RENAME key newkey
fn rename(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let (src, dst) = (&args[0], &args[1]);
    if db.get_entity(locked, src)?.is_none() {
        return Err(CommandError::KeyNotFound);
    }
    if src != dst {
        move_key(db, locked, src, dst)?;
    }
    Ok(Reply::ok())
}

/// RENAMENX key newkey
fn renamenx(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let (src, dst) = (&args[0], &args[1]);
    if db.get_entity(locked, src)?.is_none() {
        return Err(CommandError::KeyNotFound);
    }
    if db.get_entity(locked, dst)?.is_some() {
        return Ok(Reply::Integer(0));
    }
    move_key(db, locked, src, dst)?;
    Ok(Reply::Integer(1))
}

// ============================================================================
// Keyspace
// ============================================================================

fn invalid_pattern(err: impl std::fmt::Display) -> CommandError {
    CommandError::InvalidArgument(format!("invalid pattern: {err}"))
}

/// KEYS pattern
fn keys(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let keys = db.keys(locked, &args[0]).map_err(invalid_pattern)?;
    Ok(Reply::MultiBulk(keys))
}

/// SCAN cursor [MATCH pattern] [COUNT count]
///
/// The cursor is a shard index; a returned cursor of 0 means the scan is
/// complete.
fn scan(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let cursor = usize::try_from(parse_i64(&args[0])?)
        .map_err(|_| CommandError::InvalidArgument("invalid cursor".into()))?;
    let mut pattern: &[u8] = b"*";
    let mut count = DEFAULT_SCAN_COUNT;

    for option in args[1..].chunks(2) {
        match option {
            [name, value] if eq_ignore_case(name, "match") => pattern = &value[..],
            [name, value] if eq_ignore_case(name, "count") => {
                count = match parse_i64(value)? {
                    n if n >= 1 => n as usize,
                    _ => return Err(CommandError::Syntax),
                };
            }
            _ => return Err(CommandError::Syntax),
        }
    }

    let (keys, next) = db
        .scan(locked, cursor, count, pattern)
        .map_err(invalid_pattern)?;
    Ok(Reply::MultiRaw(vec![
        Reply::bulk(next.to_string()),
        Reply::MultiBulk(keys),
    ]))
}

/// DBSIZE
fn dbsize(db: &Database, _locked: &mut LockedShards<'_, Entity>, _args: &[Bytes]) -> CommandResult<Reply> {
    Ok(Reply::Integer(db.len() as i64))
}

/// FLUSHDB
fn flushdb(db: &Database, locked: &mut LockedShards<'_, Entity>, _args: &[Bytes]) -> CommandResult<Reply> {
    db.flush_locked(locked)?;
    Ok(Reply::ok())
}

// ============================================================================
// Connection
// ============================================================================

/// PING [message]
fn ping(_db: &Database, _locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    match args {
        [] => Ok(Reply::Status("PONG".to_string())),
        [message] => Ok(Reply::Bulk(message.clone())),
        _ => Err(CommandError::WrongArity("ping".into())),
    }
}

/// ECHO message
fn echo(_db: &Database, _locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    Ok(Reply::Bulk(args[0].clone()))
}

/// GETVERSION key
///
/// The key's write counter, the value WATCH compares against.
fn getversion(db: &Database, _locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let version = db.get_version(&args[0]);
    Ok(Reply::Integer(i64::try_from(version).unwrap_or(i64::MAX)))
}
