//! List commands.
//!
//! A list is a `VecDeque` of values, so pushes and pops at either end are
//! O(1). Indices are 0-based and negative ones count from the tail. An
//! empty list is never stored: popping or removing the last element deletes
//! the key.

use crate::commands::registry::{CommandRegistry, CommandSpec};
use crate::commands::undo::rollback_first_key;
use crate::commands::{clamp_ranks, parse_i64, read_first_key, write_first_key};
use crate::database::{Database, Entity};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Reply;
use crate::storage::LockedShards;
use bytes::Bytes;
use std::collections::VecDeque;

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandSpec::write("lpush", -3, lpush, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("rpush", -3, rpush, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("lpop", 2, lpop, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("rpop", 2, rpop, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write("lrem", 4, lrem, write_first_key, rollback_first_key));
    registry.register(CommandSpec::read("llen", 2, llen, read_first_key));
    registry.register(CommandSpec::read("lindex", 3, lindex, read_first_key));
    registry.register(CommandSpec::read("lrange", 4, lrange, read_first_key));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Head,
    Tail,
}

// ============================================================================
// Helpers
// ============================================================================

fn get_list<'l>(
    db: &Database,
    locked: &'l LockedShards<'_, Entity>,
    key: &[u8],
) -> CommandResult<Option<&'l VecDeque<Bytes>>> {
    match db.get_entity(locked, key)? {
        Some(Entity::List(items)) => Ok(Some(items)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(None),
    }
}

/// The list at `key` for modification, created empty when `create` is set
/// and the key is absent.
fn list_mut<'l>(
    db: &Database,
    locked: &'l mut LockedShards<'_, Entity>,
    key: &Bytes,
    create: bool,
) -> CommandResult<Option<&'l mut VecDeque<Bytes>>> {
    let exists = match db.get_entity_mut(locked, key)? {
        Some(Entity::List(_)) => true,
        Some(_) => return Err(CommandError::WrongType),
        None => false,
    };
    if !exists {
        if !create {
            return Ok(None);
        }
        db.put_entity(locked, key.clone(), Entity::List(VecDeque::new()))?;
    }
    match db.get_entity_mut(locked, key)? {
        Some(Entity::List(items)) => Ok(Some(items)),
        _ => Ok(None),
    }
}

fn drop_if_empty(db: &Database, locked: &mut LockedShards<'_, Entity>, key: &Bytes) -> CommandResult<()> {
    if get_list(db, locked, key)?.is_some_and(VecDeque::is_empty) {
        db.remove_entity(locked, key)?;
    }
    Ok(())
}

/// Position of `index` in a list of `len`, or `None` when out of range.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { len + index } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

// ============================================================================
// Push and pop
// ============================================================================

fn push(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes], end: End) -> CommandResult<Reply> {
    let Some(items) = list_mut(db, locked, &args[0], true)? else {
        return Ok(Reply::Integer(0));
    };
    for value in &args[1..] {
        match end {
            End::Head => items.push_front(value.clone()),
            End::Tail => items.push_back(value.clone()),
        }
    }
    Ok(Reply::Integer(items.len() as i64))
}

/// LPUSH key value [value ...]
///
/// Values are inserted one after another, so `LPUSH k a b c` leaves
/// `c b a` at the head.
fn lpush(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    push(db, locked, args, End::Head)
}

/// RPUSH key value [value ...]
fn rpush(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    push(db, locked, args, End::Tail)
}

fn pop(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes], end: End) -> CommandResult<Reply> {
    let key = &args[0];
    let Some(items) = list_mut(db, locked, key, false)? else {
        return Ok(Reply::NullBulk);
    };
    let value = match end {
        End::Head => items.pop_front(),
        End::Tail => items.pop_back(),
    };
    drop_if_empty(db, locked, key)?;
    Ok(Reply::bulk_or_null(value))
}

/// LPOP key
fn lpop(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    pop(db, locked, args, End::Head)
}

/// RPOP key
fn rpop(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    pop(db, locked, args, End::Tail)
}

/// LREM key count value
///
/// A positive count removes that many matches scanning from the head, a
/// negative one scans from the tail, and 0 removes every match.
fn lrem(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    let count = parse_i64(&args[1])?;
    let value = &args[2];
    let Some(items) = list_mut(db, locked, key, false)? else {
        return Ok(Reply::Integer(0));
    };

    let limit = match count {
        0 => usize::MAX,
        n => usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX),
    };
    let mut removed = 0;
    if count >= 0 {
        items.retain(|item| {
            let hit = removed < limit && item == value;
            removed += usize::from(hit);
            !hit
        });
    } else {
        let mut index = items.len();
        while index > 0 && removed < limit {
            index -= 1;
            if items[index] == *value {
                items.remove(index);
                removed += 1;
            }
        }
    }

    drop_if_empty(db, locked, key)?;
    Ok(Reply::Integer(removed as i64))
}

// ============================================================================
// Reads
// ============================================================================

/// LLEN key
fn llen(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let len = get_list(db, locked, &args[0])?.map_or(0, VecDeque::len);
    Ok(Reply::Integer(len as i64))
}

/// LINDEX key index
fn lindex(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let index = parse_i64(&args[1])?;
    let value = get_list(db, locked, &args[0])?
        .and_then(|items| resolve_index(index, items.len()).map(|i| items[i].clone()));
    Ok(Reply::bulk_or_null(value))
}

/// LRANGE key start stop
fn lrange(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let Some(items) = get_list(db, locked, &args[0])? else {
        return Ok(Reply::MultiBulk(Vec::new()));
    };
    let values = match clamp_ranks(start, stop, items.len()) {
        Some((start, stop)) => items.range(start..=stop).cloned().collect(),
        None => Vec::new(),
    };
    Ok(Reply::MultiBulk(values))
}
