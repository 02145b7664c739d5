//! String commands.
//!
//! Values are raw bytes. Counters (`INCR` and friends) parse the stored
//! bytes as a signed 64-bit decimal and write the result back as text.

use crate::commands::registry::{CommandRegistry, CommandSpec};
use crate::commands::undo::{log_first_key_snapshot, rollback_even_keys, rollback_first_key};
use crate::commands::{
    eq_ignore_case, parse_i64, read_all_keys, read_first_key, write_even_keys, write_first_key,
};
use crate::database::{deadline_after, Database, Entity};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Reply;
use crate::storage::LockedShards;
use bytes::{Bytes, BytesMut};

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandSpec::read("get", 2, get, read_first_key));
    registry.register(
        CommandSpec::write("set", -3, set, write_first_key, rollback_first_key)
            .with_log(log_first_key_snapshot),
    );
    registry.register(CommandSpec::write("setnx", 3, setnx, write_first_key, rollback_first_key));
    registry.register(
        CommandSpec::write("setex", 4, setex, write_first_key, rollback_first_key)
            .with_log(log_first_key_snapshot),
    );
    registry.register(
        CommandSpec::write("psetex", 4, psetex, write_first_key, rollback_first_key)
            .with_log(log_first_key_snapshot),
    );
    registry.register(CommandSpec::write("getset", 3, getset, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("getdel", 2, getdel, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("incr", 2, incr, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("incrby", 3, incrby, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("decr", 2, decr, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("decrby", 3, decrby, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("append", 3, append, write_first_key, rollback_first_key));
    registry.register(CommandSpec::read("strlen", 2, strlen, read_first_key));
    registry.register(CommandSpec::read("mget", -2, mget, read_all_keys));
    registry.register(CommandSpec::write("mset", -3, mset, write_even_keys, rollback_even_keys));
    registry.register(CommandSpec::write("msetnx", -3, msetnx, write_even_keys, rollback_even_keys));
}

/// The string at `key`. A key holding another type is a `WrongType` error.
fn get_string<'l>(
    db: &Database,
    locked: &'l LockedShards<'_, Entity>,
    key: &[u8],
) -> CommandResult<Option<&'l Bytes>> {
    match db.get_entity(locked, key)? {
        Some(Entity::String(value)) => Ok(Some(value)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(None),
    }
}

// ============================================================================
// Basic operations
// ============================================================================

/// GET key
fn get(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    Ok(Reply::bulk_or_null(get_string(db, locked, &args[0])?.cloned()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Always,
    IfAbsent,
    IfExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// Drop any deadline the key had.
    Clear,
    Keep,
    /// Relative, in milliseconds.
    After(i64),
}

/// Parses `[EX seconds | PX milliseconds | KEEPTTL] [NX | XX]`.
fn parse_set_options(options: &[Bytes]) -> CommandResult<(Condition, Expiry)> {
    let mut condition = Condition::Always;
    let mut expiry = Expiry::Clear;
    let mut i = 0;

    while i < options.len() {
        let option = &options[i];
        if eq_ignore_case(option, "nx") && condition == Condition::Always {
            condition = Condition::IfAbsent;
        } else if eq_ignore_case(option, "xx") && condition == Condition::Always {
            condition = Condition::IfExists;
        } else if eq_ignore_case(option, "keepttl") && expiry == Expiry::Clear {
            expiry = Expiry::Keep;
        } else if (eq_ignore_case(option, "ex") || eq_ignore_case(option, "px"))
            && expiry == Expiry::Clear
        {
            let amount = parse_i64(options.get(i + 1).ok_or(CommandError::Syntax)?)?;
            if amount <= 0 {
                return Err(CommandError::InvalidArgument(
                    "invalid expire time in 'set' command".into(),
                ));
            }
            let ms = if eq_ignore_case(option, "ex") {
                amount.checked_mul(1000).ok_or_else(|| {
                    CommandError::InvalidArgument("invalid expire time in 'set' command".into())
                })?
            } else {
                amount
            };
            expiry = Expiry::After(ms);
            i += 1;
        } else {
            return Err(CommandError::Syntax);
        }
        i += 1;
    }
    Ok((condition, expiry))
}

/// Stores a string under `key` honoring the condition. Returns whether it
/// was written.
fn store(
    db: &Database,
    locked: &mut LockedShards<'_, Entity>,
    key: &Bytes,
    value: Bytes,
    condition: Condition,
    expiry: Expiry,
) -> CommandResult<bool> {
    let entity = Entity::String(value);
    let written = match condition {
        Condition::Always => db.put_entity(locked, key.clone(), entity)?,
        Condition::IfAbsent => db.put_entity_if_absent(locked, key.clone(), entity)?,
        Condition::IfExists => db.put_entity_if_exists(locked, key.clone(), entity)?,
    };
    if written == 0 {
        return Ok(false);
    }
    match expiry {
        Expiry::Clear => {
            db.persist_key(locked, key)?;
        }
        Expiry::Keep => {}
        Expiry::After(ms) => db.expire(locked, key, deadline_after(ms))?,
    }
    Ok(true)
}

/// SET key value [EX seconds | PX milliseconds | KEEPTTL] [NX | XX]
fn set(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let (condition, expiry) = parse_set_options(&args[2..])?;
    if store(db, locked, &args[0], args[1].clone(), condition, expiry)? {
        Ok(Reply::ok())
    } else {
        Ok(Reply::NullBulk)
    }
}

/// SETNX key value
fn setnx(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let written = store(
        db,
        locked,
        &args[0],
        args[1].clone(),
        Condition::IfAbsent,
        Expiry::Clear,
    )?;
    Ok(Reply::Integer(i64::from(written)))
}

fn set_with_ttl(
    db: &Database,
    locked: &mut LockedShards<'_, Entity>,
    args: &[Bytes],
    unit: i64,
    command: &str,
) -> CommandResult<Reply> {
    let ms = parse_i64(&args[1])?
        .checked_mul(unit)
        .filter(|ms| *ms > 0)
        .ok_or_else(|| {
            CommandError::InvalidArgument(format!("invalid expire time in '{command}' command"))
        })?;
    store(db, locked, &args[0], args[2].clone(), Condition::Always, Expiry::After(ms))?;
    Ok(Reply::ok())
}

/// SETEX key seconds value
fn setex(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    set_with_ttl(db, locked, args, 1000, "setex")
}

/// PSETEX key milliseconds value
fn psetex(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    set_with_ttl(db, locked, args, 1, "psetex")
}

/// GETSET key value
fn getset(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let old = get_string(db, locked, &args[0])?.cloned();
    store(db, locked, &args[0], args[1].clone(), Condition::Always, Expiry::Clear)?;
    Ok(Reply::bulk_or_null(old))
}

/// GETDEL key
fn getdel(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let Some(value) = get_string(db, locked, &args[0])?.cloned() else {
        return Ok(Reply::NullBulk);
    };
    db.remove_entity(locked, &args[0])?;
    Ok(Reply::Bulk(value))
}

// ============================================================================
// Counters
// ============================================================================

/// Adds `delta` to the integer at `key` (0 when absent). The key keeps its
/// deadline.
fn add(db: &Database, locked: &mut LockedShards<'_, Entity>, key: &Bytes, delta: i64) -> CommandResult<Reply> {
    let current = match get_string(db, locked, key)? {
        Some(value) => parse_i64(value)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(CommandError::Overflow)?;
    db.put_entity(
        locked,
        key.clone(),
        Entity::String(Bytes::from(next.to_string())),
    )?;
    Ok(Reply::Integer(next))
}

/// INCR key
fn incr(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    add(db, locked, &args[0], 1)
}

/// INCRBY key increment
fn incrby(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let delta = parse_i64(&args[1])?;
    add(db, locked, &args[0], delta)
}

/// DECR key
fn decr(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    add(db, locked, &args[0], -1)
}

/// DECRBY key decrement
fn decrby(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let delta = parse_i64(&args[1])?
        .checked_neg()
        .ok_or(CommandError::Overflow)?;
    add(db, locked, &args[0], delta)
}

// ============================================================================
// Byte operations
// ============================================================================

/// APPEND key value
fn append(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    let mut joined = BytesMut::new();
    if let Some(current) = get_string(db, locked, key)? {
        joined.extend_from_slice(current);
    }
    joined.extend_from_slice(&args[1]);
    let len = joined.len();
    db.put_entity(locked, key.clone(), Entity::String(joined.freeze()))?;
    Ok(Reply::Integer(len as i64))
}

/// STRLEN key
fn strlen(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let len = get_string(db, locked, &args[0])?.map_or(0, Bytes::len);
    Ok(Reply::Integer(len as i64))
}

// ============================================================================
// Multi-key
// ============================================================================

/// MGET key [key ...]
///
/// Keys holding another type read as null rather than failing the batch.
fn mget(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let mut values = Vec::with_capacity(args.len());
    for key in args {
        let value = match db.get_entity(locked, key)? {
            Some(Entity::String(value)) => Reply::Bulk(value.clone()),
            _ => Reply::NullBulk,
        };
        values.push(value);
    }
    Ok(Reply::MultiRaw(values))
}

fn pairs(args: &[Bytes], command: &str) -> CommandResult<()> {
    if args.len() % 2 != 0 {
        return Err(CommandError::WrongArity(command.into()));
    }
    Ok(())
}

/// MSET key value [key value ...]
fn mset(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    pairs(args, "mset")?;
    for pair in args.chunks(2) {
        store(db, locked, &pair[0], pair[1].clone(), Condition::Always, Expiry::Clear)?;
    }
    Ok(Reply::ok())
}

/// MSETNX key value [key value ...]
///
/// Writes nothing unless every key is absent.
fn msetnx(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    pairs(args, "msetnx")?;
    for pair in args.chunks(2) {
        if db.get_entity(locked, &pair[0])?.is_some() {
            return Ok(Reply::Integer(0));
        }
    }
    for pair in args.chunks(2) {
        store(db, locked, &pair[0], pair[1].clone(), Condition::Always, Expiry::Clear)?;
    }
    Ok(Reply::Integer(1))
}

#[cfg(test)]
mod tests {
    use crate::commands::CommandRegistry;
    use crate::connection::ConnectionState;
    use crate::database::{Database, DatabaseConfig};
    use crate::protocol::Reply;
    use bytes::Bytes;
    use std::sync::Arc;

    fn database() -> Database {
        Database::new(0, Arc::new(CommandRegistry::standard()), DatabaseConfig::default())
    }

    fn run(db: &Database, parts: &[&str]) -> Reply {
        let line: Vec<Bytes> = parts.iter().map(|p| Bytes::from(p.to_string())).collect();
        db.exec(&mut ConnectionState::new(), &line)
    }

    const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

    #[tokio::test]
    async fn test_set_get() {
        let db = database();
        assert_eq!(run(&db, &["GET", "k"]), Reply::NullBulk);
        assert_eq!(run(&db, &["SET", "k", "v"]), Reply::ok());
        assert_eq!(run(&db, &["GET", "k"]), Reply::bulk("v"));
        assert!(run(&db, &["SET", "k"]).is_error());
    }

    #[tokio::test]
    async fn test_set_conditions() {
        let db = database();
        assert_eq!(run(&db, &["SET", "k", "1", "XX"]), Reply::NullBulk);
        assert_eq!(run(&db, &["SET", "k", "1", "NX"]), Reply::ok());
        assert_eq!(run(&db, &["SET", "k", "2", "NX"]), Reply::NullBulk);
        assert_eq!(run(&db, &["SET", "k", "3", "xx"]), Reply::ok());
        assert_eq!(run(&db, &["GET", "k"]), Reply::bulk("3"));
        assert_eq!(
            run(&db, &["SET", "k", "4", "NX", "XX"]),
            Reply::Error("ERR syntax error".into())
        );
    }

    #[tokio::test]
    async fn test_set_expiry_options() {
        let db = database();
        assert_eq!(run(&db, &["SET", "k", "v", "EX", "100"]), Reply::ok());
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(100));

        assert_eq!(run(&db, &["SET", "k", "w", "KEEPTTL"]), Reply::ok());
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(100));

        assert_eq!(run(&db, &["SET", "k", "x"]), Reply::ok());
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(-1));

        run(&db, &["SET", "k", "y", "PX", "5000"]);
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(5));

        assert!(run(&db, &["SET", "k", "v", "EX", "0"]).is_error());
        assert!(run(&db, &["SET", "k", "v", "EX"]).is_error());
        assert!(run(&db, &["SET", "k", "v", "EX", "1", "PX", "1"]).is_error());
        assert_eq!(run(&db, &["GET", "k"]), Reply::bulk("y"), "failed SET changes nothing");
    }

    #[tokio::test]
    async fn test_setnx_setex_psetex() {
        let db = database();
        assert_eq!(run(&db, &["SETNX", "k", "1"]), Reply::Integer(1));
        assert_eq!(run(&db, &["SETNX", "k", "2"]), Reply::Integer(0));
        assert_eq!(run(&db, &["SETEX", "k", "10", "v"]), Reply::ok());
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(10));
        assert_eq!(run(&db, &["PSETEX", "k", "20000", "v"]), Reply::ok());
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(20));
        assert!(run(&db, &["SETEX", "k", "-1", "v"]).is_error());
    }

    #[tokio::test]
    async fn test_getset_getdel() {
        let db = database();
        assert_eq!(run(&db, &["GETSET", "k", "1"]), Reply::NullBulk);
        run(&db, &["EXPIRE", "k", "100"]);
        assert_eq!(run(&db, &["GETSET", "k", "2"]), Reply::bulk("1"));
        assert_eq!(run(&db, &["TTL", "k"]), Reply::Integer(-1));
        assert_eq!(run(&db, &["GETDEL", "k"]), Reply::bulk("2"));
        assert_eq!(run(&db, &["GETDEL", "k"]), Reply::NullBulk);
    }

    #[tokio::test]
    async fn test_counters() {
        let db = database();
        assert_eq!(run(&db, &["INCR", "n"]), Reply::Integer(1));
        assert_eq!(run(&db, &["INCRBY", "n", "10"]), Reply::Integer(11));
        assert_eq!(run(&db, &["DECR", "n"]), Reply::Integer(10));
        assert_eq!(run(&db, &["DECRBY", "n", "15"]), Reply::Integer(-5));

        run(&db, &["SET", "s", "abc"]);
        assert_eq!(
            run(&db, &["INCR", "s"]),
            Reply::Error("ERR value is not an integer or out of range".into())
        );
        run(&db, &["SET", "max", &i64::MAX.to_string()]);
        assert_eq!(
            run(&db, &["INCR", "max"]),
            Reply::Error("ERR increment or decrement would overflow".into())
        );
        assert!(run(&db, &["DECRBY", "n", &i64::MIN.to_string()]).is_error());
    }

    #[tokio::test]
    async fn test_incr_keeps_deadline() {
        let db = database();
        run(&db, &["SET", "n", "1", "EX", "100"]);
        run(&db, &["INCR", "n"]);
        assert_eq!(run(&db, &["TTL", "n"]), Reply::Integer(100));
    }

    #[tokio::test]
    async fn test_append_strlen() {
        let db = database();
        assert_eq!(run(&db, &["APPEND", "k", "Hello"]), Reply::Integer(5));
        assert_eq!(run(&db, &["APPEND", "k", " World"]), Reply::Integer(11));
        assert_eq!(run(&db, &["GET", "k"]), Reply::bulk("Hello World"));
        assert_eq!(run(&db, &["STRLEN", "k"]), Reply::Integer(11));
        assert_eq!(run(&db, &["STRLEN", "none"]), Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_mset_mget_msetnx() {
        let db = database();
        assert_eq!(run(&db, &["MSET", "a", "1", "b", "2"]), Reply::ok());
        run(&db, &["ZADD", "z", "1", "m"]);
        assert_eq!(
            run(&db, &["MGET", "a", "b", "z", "c"]),
            Reply::MultiRaw(vec![
                Reply::bulk("1"),
                Reply::bulk("2"),
                Reply::NullBulk,
                Reply::NullBulk,
            ])
        );
        assert!(run(&db, &["MSET", "a", "1", "b"]).is_error());

        assert_eq!(run(&db, &["MSETNX", "a", "9", "c", "3"]), Reply::Integer(0));
        assert_eq!(run(&db, &["GET", "c"]), Reply::NullBulk);
        assert_eq!(run(&db, &["MSETNX", "c", "3", "d", "4"]), Reply::Integer(1));
        assert_eq!(run(&db, &["GET", "d"]), Reply::bulk("4"));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let db = database();
        run(&db, &["ZADD", "z", "1", "m"]);
        for cmd in [
            &["GET", "z"][..],
            &["INCR", "z"],
            &["APPEND", "z", "x"],
            &["STRLEN", "z"],
            &["GETSET", "z", "x"],
        ] {
            assert_eq!(run(&db, cmd), Reply::Error(WRONGTYPE.into()), "{cmd:?}");
        }
        assert_eq!(run(&db, &["SET", "z", "v"]), Reply::ok(), "SET overwrites any type");
    }
}
