//! Sorted set commands.
//!
//! Ranks are 0-based and negative indices count from the end, as in Redis.
//! A set whose last member is removed is deleted along with its key.

use crate::commands::registry::{CommandRegistry, CommandSpec};
use crate::commands::undo::rollback_first_key;
use crate::commands::{
    clamp_ranks, eq_ignore_case, format_f64, parse_f64, parse_i64, read_first_key, write_first_key,
};
use crate::database::{Database, Entity};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Reply;
use crate::storage::{Border, Element, LockedShards, SortedSet};
use bytes::Bytes;

pub fn register(registry: &mut CommandRegistry) {
    registry.register(CommandSpec::write("zadd", -4, zadd, write_first_key, rollback_first_key));
    registry.register(CommandSpec::read("zcard", 2, zcard, read_first_key));
    registry.register(CommandSpec::read("zscore", 3, zscore, read_first_key));
    registry.register(CommandSpec::read("zcount", 4, zcount, read_first_key));
    registry.register(CommandSpec::write("zincrby", 4, zincrby, write_first_key, rollback_first_key));
    registry.register(CommandSpec::read("zrank", 3, zrank, read_first_key));
    registry.register(CommandSpec::read("zrevrank", 3, zrevrank, read_first_key));
    registry.register(CommandSpec::read("zrange", -4, zrange, read_first_key));
    registry.register(CommandSpec::read("zrevrange", -4, zrevrange, read_first_key));
    registry.register(CommandSpec::read("zrangebyscore", -4, zrangebyscore, read_first_key));
    registry.register(CommandSpec::read("zrevrangebyscore", -4, zrevrangebyscore, read_first_key));
    registry.register(CommandSpec::write("zrem", -3, zrem, write_first_key, rollback_first_key));
    registry.register(CommandSpec::write(
        "zremrangebyrank",
        4,
        zremrangebyrank,
        write_first_key,
        rollback_first_key,
    ));
    registry.register(CommandSpec::write(
        "zremrangebyscore",
        4,
        zremrangebyscore,
        write_first_key,
        rollback_first_key,
    ));
}

// ============================================================================
// Helpers
// ============================================================================

fn get_set<'l>(
    db: &Database,
    locked: &'l LockedShards<'_, Entity>,
    key: &[u8],
) -> CommandResult<Option<&'l SortedSet>> {
    match db.get_entity(locked, key)? {
        Some(Entity::SortedSet(set)) => Ok(Some(set)),
        Some(_) => Err(CommandError::WrongType),
        None => Ok(None),
    }
}

/// The set at `key` for modification, created empty when `create` is set
/// and the key is absent.
fn sorted_set_mut<'l>(
    db: &Database,
    locked: &'l mut LockedShards<'_, Entity>,
    key: &Bytes,
    create: bool,
) -> CommandResult<Option<&'l mut SortedSet>> {
    let exists = match db.get_entity_mut(locked, key)? {
        Some(Entity::SortedSet(_)) => true,
        Some(_) => return Err(CommandError::WrongType),
        None => false,
    };
    if !exists {
        if !create {
            return Ok(None);
        }
        db.put_entity(locked, key.clone(), Entity::SortedSet(SortedSet::new()))?;
    }
    match db.get_entity_mut(locked, key)? {
        Some(Entity::SortedSet(set)) => Ok(Some(set)),
        _ => Ok(None),
    }
}

/// Deletes the key if its set has become empty.
fn drop_if_empty(db: &Database, locked: &mut LockedShards<'_, Entity>, key: &Bytes) -> CommandResult<()> {
    if get_set(db, locked, key)?.is_some_and(SortedSet::is_empty) {
        db.remove_entity(locked, key)?;
    }
    Ok(())
}

fn parse_border(raw: &[u8]) -> CommandResult<Border> {
    Border::parse(raw).ok_or(CommandError::InvalidRange)
}

fn elements_reply(elements: Vec<Element>, with_scores: bool) -> Reply {
    let mut items = Vec::with_capacity(elements.len() * if with_scores { 2 } else { 1 });
    for el in elements {
        items.push(el.member);
        if with_scores {
            items.push(format_f64(el.score));
        }
    }
    Reply::MultiBulk(items)
}

// ============================================================================
// Membership
// ============================================================================

/// ZADD key [NX | XX] score member [score member ...]
///
/// Replies with the number of members added or whose score changed.
fn zadd(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    let mut nx = false;
    let mut xx = false;
    let mut rest = &args[1..];
    while let Some(flag) = rest.first() {
        if eq_ignore_case(flag, "nx") {
            nx = true;
        } else if eq_ignore_case(flag, "xx") {
            xx = true;
        } else {
            break;
        }
        rest = &rest[1..];
    }
    if nx && xx {
        return Err(CommandError::InvalidArgument(
            "XX and NX options at the same time are not compatible".into(),
        ));
    }
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(CommandError::Syntax);
    }

    let mut pairs = Vec::with_capacity(rest.len() / 2);
    for pair in rest.chunks(2) {
        pairs.push((parse_f64(&pair[0])?, pair[1].clone()));
    }

    let Some(set) = sorted_set_mut(db, locked, key, !xx)? else {
        return Ok(Reply::Integer(0));
    };
    let mut changed = 0;
    for (score, member) in pairs {
        let present = set.contains(&member);
        if (nx && present) || (xx && !present) {
            continue;
        }
        changed += set.put(member, score);
    }
    drop_if_empty(db, locked, key)?;
    Ok(Reply::Integer(changed as i64))
}

/// ZINCRBY key increment member
fn zincrby(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let (key, member) = (&args[0], &args[2]);
    let increment = parse_f64(&args[1])?;
    let current = get_set(db, locked, key)?.and_then(|set| set.score(member));
    let score = current.unwrap_or(0.0) + increment;
    if score.is_nan() {
        return Err(CommandError::InvalidArgument(
            "resulting score is not a number (NaN)".into(),
        ));
    }
    if let Some(set) = sorted_set_mut(db, locked, key, true)? {
        set.put(member.clone(), score);
    }
    Ok(Reply::Bulk(format_f64(score)))
}

/// ZREM key member [member ...]
fn zrem(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    let Some(set) = sorted_set_mut(db, locked, key, false)? else {
        return Ok(Reply::Integer(0));
    };
    let removed: usize = args[1..].iter().map(|member| set.remove(member)).sum();
    drop_if_empty(db, locked, key)?;
    Ok(Reply::Integer(removed as i64))
}

/// ZCARD key
fn zcard(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let len = get_set(db, locked, &args[0])?.map_or(0, SortedSet::len);
    Ok(Reply::Integer(len as i64))
}

/// ZSCORE key member
fn zscore(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let score = get_set(db, locked, &args[0])?.and_then(|set| set.score(&args[1]));
    Ok(Reply::bulk_or_null(score.map(format_f64)))
}

/// ZCOUNT key min max
fn zcount(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let min = parse_border(&args[1])?;
    let max = parse_border(&args[2])?;
    let count = get_set(db, locked, &args[0])?.map_or(0, |set| set.count_in_range(&min, &max));
    Ok(Reply::Integer(count as i64))
}

// ============================================================================
// Ranks
// ============================================================================

fn rank(db: &Database, locked: &LockedShards<'_, Entity>, args: &[Bytes], desc: bool) -> CommandResult<Reply> {
    let rank = get_set(db, locked, &args[0])?.and_then(|set| set.rank(&args[1], desc).ok());
    Ok(rank.map_or(Reply::NullBulk, |r| Reply::Integer(r as i64)))
}

/// ZRANK key member
fn zrank(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    rank(db, locked, args, false)
}

/// ZREVRANK key member
fn zrevrank(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    rank(db, locked, args, true)
}

fn range(db: &Database, locked: &LockedShards<'_, Entity>, args: &[Bytes], desc: bool) -> CommandResult<Reply> {
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let with_scores = match &args[3..] {
        [] => false,
        [flag] if eq_ignore_case(flag, "withscores") => true,
        _ => return Err(CommandError::Syntax),
    };

    let Some(set) = get_set(db, locked, &args[0])? else {
        return Ok(Reply::MultiBulk(Vec::new()));
    };
    let elements = match clamp_ranks(start, stop, set.len()) {
        Some((start, stop)) => set.range_by_rank(start, stop, desc),
        None => Vec::new(),
    };
    Ok(elements_reply(elements, with_scores))
}

/// ZRANGE key start stop [WITHSCORES]
fn zrange(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    range(db, locked, args, false)
}

/// ZREVRANGE key start stop [WITHSCORES]
fn zrevrange(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    range(db, locked, args, true)
}

// ============================================================================
// Score ranges
// ============================================================================

/// `[WITHSCORES] [LIMIT offset count]` in any order.
fn parse_score_options(options: &[Bytes]) -> CommandResult<(bool, Option<(i64, i64)>)> {
    let mut with_scores = false;
    let mut limit = None;
    let mut i = 0;
    while i < options.len() {
        if eq_ignore_case(&options[i], "withscores") {
            with_scores = true;
            i += 1;
        } else if eq_ignore_case(&options[i], "limit") && i + 2 < options.len() {
            let offset = parse_i64(&options[i + 1])?;
            let count = parse_i64(&options[i + 2])?;
            limit = Some((offset, count));
            i += 3;
        } else {
            return Err(CommandError::Syntax);
        }
    }
    Ok((with_scores, limit))
}

fn range_by_score(
    db: &Database,
    locked: &LockedShards<'_, Entity>,
    key: &[u8],
    min: &[u8],
    max: &[u8],
    options: &[Bytes],
    desc: bool,
) -> CommandResult<Reply> {
    let min = parse_border(min)?;
    let max = parse_border(max)?;
    let (with_scores, limit) = parse_score_options(options)?;

    let (offset, count) = match limit {
        Some((offset, _)) if offset < 0 => return Ok(Reply::MultiBulk(Vec::new())),
        Some((offset, count)) => (offset as usize, usize::try_from(count).ok()),
        None => (0, None),
    };
    let Some(set) = get_set(db, locked, key)? else {
        return Ok(Reply::MultiBulk(Vec::new()));
    };
    let elements = set.range_by_score(&min, &max, offset, count, desc);
    Ok(elements_reply(elements, with_scores))
}

/// ZRANGEBYSCORE key min max [WITHSCORES] [LIMIT offset count]
fn zrangebyscore(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    range_by_score(db, locked, &args[0], &args[1], &args[2], &args[3..], false)
}

/// ZREVRANGEBYSCORE key max min [WITHSCORES] [LIMIT offset count]
fn zrevrangebyscore(
    db: &Database,
    locked: &mut LockedShards<'_, Entity>,
    args: &[Bytes],
) -> CommandResult<Reply> {
    range_by_score(db, locked, &args[0], &args[2], &args[1], &args[3..], true)
}

/// ZREMRANGEBYRANK key start stop
fn zremrangebyrank(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    let start = parse_i64(&args[1])?;
    let stop = parse_i64(&args[2])?;
    let Some(set) = sorted_set_mut(db, locked, key, false)? else {
        return Ok(Reply::Integer(0));
    };
    let removed = match clamp_ranks(start, stop, set.len()) {
        Some((start, stop)) => set.remove_range_by_rank(start, stop),
        None => 0,
    };
    drop_if_empty(db, locked, key)?;
    Ok(Reply::Integer(removed as i64))
}

/// ZREMRANGEBYSCORE key min max
fn zremrangebyscore(db: &Database, locked: &mut LockedShards<'_, Entity>, args: &[Bytes]) -> CommandResult<Reply> {
    let key = &args[0];
    let min = parse_border(&args[1])?;
    let max = parse_border(&args[2])?;
    let Some(set) = sorted_set_mut(db, locked, key, false)? else {
        return Ok(Reply::Integer(0));
    };
    let removed = set.remove_range_by_score(&min, &max);
    drop_if_empty(db, locked, key)?;
    Ok(Reply::Integer(removed as i64))
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

    fn bulks(items: &[&str]) -> Reply {
        Reply::MultiBulk(items.iter().map(|s| Bytes::from(s.to_string())).collect())
    }

    fn fruit(db: &Database) {
        run(db, &["ZADD", "z", "1", "apple", "2", "banana", "3", "cherry", "4", "date"]);
    }

    #[tokio::test]
    async fn test_zadd_zrange_zrem_end_to_end() {
        let db = database();
        assert_eq!(
            run(&db, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]),
            Reply::Integer(3)
        );
        assert_eq!(run(&db, &["ZRANGE", "z", "0", "-1"]), bulks(&["a", "b", "c"]));
        assert_eq!(run(&db, &["ZREM", "z", "b", "nope"]), Reply::Integer(1));
        assert_eq!(
            run(&db, &["ZRANGE", "z", "0", "-1", "WITHSCORES"]),
            bulks(&["a", "1", "c", "3"])
        );
        assert_eq!(run(&db, &["ZREM", "z", "a", "c"]), Reply::Integer(2));
        assert_eq!(run(&db, &["EXISTS", "z"]), Reply::Integer(0), "empty set is deleted");
    }

    #[tokio::test]
    async fn test_zadd_counts_changes_and_flags() {
        let db = database();
        run(&db, &["ZADD", "z", "1", "a"]);
        assert_eq!(run(&db, &["ZADD", "z", "1", "a"]), Reply::Integer(0));
        assert_eq!(run(&db, &["ZADD", "z", "5", "a", "2", "b"]), Reply::Integer(2));
        assert_eq!(run(&db, &["ZADD", "z", "NX", "9", "a", "3", "c"]), Reply::Integer(1));
        assert_eq!(run(&db, &["ZSCORE", "z", "a"]), Reply::bulk("5"));
        assert_eq!(run(&db, &["ZADD", "z", "XX", "7", "a", "4", "d"]), Reply::Integer(1));
        assert_eq!(run(&db, &["ZSCORE", "z", "a"]), Reply::bulk("7"));
        assert_eq!(run(&db, &["ZSCORE", "z", "d"]), Reply::NullBulk);

        assert_eq!(run(&db, &["ZADD", "new", "XX", "1", "a"]), Reply::Integer(0));
        assert_eq!(run(&db, &["EXISTS", "new"]), Reply::Integer(0));

        assert!(run(&db, &["ZADD", "z", "NX", "XX", "1", "a"]).is_error());
        assert!(run(&db, &["ZADD", "z", "1", "a", "2"]).is_error());
        assert!(run(&db, &["ZADD", "z", "1", "a", "x", "b"]).is_error());
        assert_eq!(run(&db, &["ZCARD", "z"]), Reply::Integer(3), "bad ZADD changes nothing");
    }

    #[tokio::test]
    async fn test_zcard_zscore_zcount() {
        let db = database();
        fruit(&db);
        assert_eq!(run(&db, &["ZCARD", "z"]), Reply::Integer(4));
        assert_eq!(run(&db, &["ZCARD", "none"]), Reply::Integer(0));
        assert_eq!(run(&db, &["ZSCORE", "z", "banana"]), Reply::bulk("2"));
        assert_eq!(run(&db, &["ZCOUNT", "z", "2", "3"]), Reply::Integer(2));
        assert_eq!(run(&db, &["ZCOUNT", "z", "(2", "+inf"]), Reply::Integer(2));
        assert_eq!(run(&db, &["ZCOUNT", "z", "-inf", "(1"]), Reply::Integer(0));
        assert_eq!(
            run(&db, &["ZCOUNT", "z", "x", "3"]),
            Reply::Error("ERR min or max is not a float".into())
        );
    }

    #[tokio::test]
    async fn test_zincrby() {
        let db = database();
        assert_eq!(run(&db, &["ZINCRBY", "z", "2.5", "m"]), Reply::bulk("2.5"));
        assert_eq!(run(&db, &["ZINCRBY", "z", "-1", "m"]), Reply::bulk("1.5"));
        run(&db, &["ZINCRBY", "z", "inf", "m"]);
        assert!(run(&db, &["ZINCRBY", "z", "-inf", "m"]).is_error());
        assert_eq!(run(&db, &["ZSCORE", "z", "m"]), Reply::bulk("inf"));
    }

    #[tokio::test]
    async fn test_ranks() {
        let db = database();
        fruit(&db);
        assert_eq!(run(&db, &["ZRANK", "z", "apple"]), Reply::Integer(0));
        assert_eq!(run(&db, &["ZRANK", "z", "date"]), Reply::Integer(3));
        assert_eq!(run(&db, &["ZREVRANK", "z", "date"]), Reply::Integer(0));
        assert_eq!(run(&db, &["ZRANK", "z", "fig"]), Reply::NullBulk);
        assert_eq!(run(&db, &["ZRANK", "none", "fig"]), Reply::NullBulk);
    }

    #[tokio::test]
    async fn test_rank_ranges() {
        let db = database();
        fruit(&db);
        assert_eq!(run(&db, &["ZRANGE", "z", "1", "2"]), bulks(&["banana", "cherry"]));
        assert_eq!(run(&db, &["ZRANGE", "z", "-2", "-1"]), bulks(&["cherry", "date"]));
        assert_eq!(run(&db, &["ZRANGE", "z", "5", "9"]), bulks(&[]));
        assert_eq!(
            run(&db, &["ZREVRANGE", "z", "0", "1", "WITHSCORES"]),
            bulks(&["date", "4", "cherry", "3"])
        );
        assert!(run(&db, &["ZRANGE", "z", "0", "1", "BOGUS"]).is_error());
    }

    #[tokio::test]
    async fn test_score_ranges() {
        let db = database();
        fruit(&db);
        assert_eq!(
            run(&db, &["ZRANGEBYSCORE", "z", "2", "(4"]),
            bulks(&["banana", "cherry"])
        );
        assert_eq!(
            run(&db, &["ZRANGEBYSCORE", "z", "-inf", "+inf", "LIMIT", "1", "2"]),
            bulks(&["banana", "cherry"])
        );
        assert_eq!(
            run(&db, &["ZRANGEBYSCORE", "z", "-inf", "+inf", "WITHSCORES", "LIMIT", "3", "-1"]),
            bulks(&["date", "4"])
        );
        assert_eq!(
            run(&db, &["ZREVRANGEBYSCORE", "z", "3", "1"]),
            bulks(&["cherry", "banana", "apple"])
        );
        assert_eq!(run(&db, &["ZRANGEBYSCORE", "z", "5", "1"]), bulks(&[]));
        assert!(run(&db, &["ZRANGEBYSCORE", "z", "0", "1", "LIMIT", "1"]).is_error());
    }

    #[tokio::test]
    async fn test_remove_ranges() {
        let db = database();
        fruit(&db);
        assert_eq!(run(&db, &["ZREMRANGEBYRANK", "z", "0", "1"]), Reply::Integer(2));
        assert_eq!(run(&db, &["ZRANGE", "z", "0", "-1"]), bulks(&["cherry", "date"]));
        assert_eq!(run(&db, &["ZREMRANGEBYSCORE", "z", "-inf", "3"]), Reply::Integer(1));
        assert_eq!(run(&db, &["ZREMRANGEBYSCORE", "z", "4", "4"]), Reply::Integer(1));
        assert_eq!(run(&db, &["TYPE", "z"]), Reply::Status("none".into()));
        assert_eq!(run(&db, &["ZREMRANGEBYRANK", "z", "0", "-1"]), Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let db = database();
        run(&db, &["SET", "s", "v"]);
        assert!(run(&db, &["ZADD", "s", "1", "m"]).is_error());
        assert!(run(&db, &["ZRANGE", "s", "0", "-1"]).is_error());
        assert!(run(&db, &["ZSCORE", "s", "m"]).is_error());
        assert_eq!(run(&db, &["GET", "s"]), Reply::bulk("v"));
    }
}
