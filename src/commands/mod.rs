//! Command Layer
//!
//! Every command is a [`CommandSpec`] in a [`CommandRegistry`]: a name, an
//! arity, a key-extraction function, the handler itself and, for write
//! commands, an undo generator.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  RESP array → command line, per-connection state
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Server      │  SELECT / FLUSHALL, picks the database
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    Database     │  MULTI / EXEC / WATCH, lookup, locking
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  CommandSpec    │  keys.rs / string.rs / list.rs / zset.rs
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### Key Commands
//! - `DEL`, `EXISTS`, `TYPE`, `RENAME`, `RENAMENX`
//! - `EXPIRE`, `PEXPIRE`, `EXPIREAT`, `PEXPIREAT`, `TTL`, `PTTL`, `PERSIST`
//! - `KEYS`, `SCAN`, `DBSIZE`, `FLUSHDB`, `GETVERSION`
//! - `PING`, `ECHO`
//!
//! ### String Commands
//! - `GET`, `SET`, `SETNX`, `SETEX`, `PSETEX`, `GETSET`, `GETDEL`
//! - `INCR`, `INCRBY`, `DECR`, `DECRBY`, `APPEND`, `STRLEN`
//! - `MGET`, `MSET`, `MSETNX`
//!
//! ### List Commands
//! - `LPUSH`, `RPUSH`, `LPOP`, `RPOP`, `LREM`
//! - `LLEN`, `LINDEX`, `LRANGE`
//!
//! ### Sorted Set Commands
//! - `ZADD`, `ZCARD`, `ZSCORE`, `ZCOUNT`, `ZINCRBY`, `ZRANK`, `ZREVRANK`
//! - `ZRANGE`, `ZREVRANGE`, `ZRANGEBYSCORE`, `ZREVRANGEBYSCORE`
//! - `ZREM`, `ZREMRANGEBYRANK`, `ZREMRANGEBYSCORE`

pub mod handler;
pub mod keys;
pub mod list;
pub mod registry;
pub mod string;
pub mod undo;
pub mod zset;

pub use handler::CommandHandler;
pub use registry::{CommandRegistry, CommandSpec, ExecFn, KeysFn, LogFn, UndoFn};

use crate::error::{CommandError, CommandResult};
use crate::storage::LockRequest;
use bytes::Bytes;

/// A command and its arguments, name first.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from byte-string parts.
pub fn cmdline(parts: &[&[u8]]) -> CmdLine {
    parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
}

// ============================================================================
// Argument parsing
// ============================================================================

pub(crate) fn parse_i64(arg: &[u8]) -> CommandResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

/// Parses a score or increment. `inf`, `+inf` and `-inf` are accepted, NaN
/// is not.
pub(crate) fn parse_f64(arg: &[u8]) -> CommandResult<f64> {
    let text = std::str::from_utf8(arg).map_err(|_| CommandError::NotFloat)?;
    let value = match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse().map_err(|_| CommandError::NotFloat)?,
    };
    if value.is_nan() {
        return Err(CommandError::NotFloat);
    }
    Ok(value)
}

/// Formats a float the way replies carry scores.
pub(crate) fn format_f64(value: f64) -> Bytes {
    if value == f64::INFINITY {
        Bytes::from_static(b"inf")
    } else if value == f64::NEG_INFINITY {
        Bytes::from_static(b"-inf")
    } else {
        Bytes::from(value.to_string())
    }
}

pub(crate) fn eq_ignore_case(arg: &[u8], word: &str) -> bool {
    arg.eq_ignore_ascii_case(word.as_bytes())
}

/// Resolves `start..=stop` (negative counts from the end) against a
/// collection of `len` elements. `None` when the range selects nothing.
pub(crate) fn clamp_ranks(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

// ============================================================================
// Key extraction
// ============================================================================

pub(crate) fn no_keys(_args: &[Bytes]) -> LockRequest {
    LockRequest::default()
}

pub(crate) fn write_first_key(args: &[Bytes]) -> LockRequest {
    LockRequest::new(args[..1].to_vec(), Vec::new())
}

pub(crate) fn read_first_key(args: &[Bytes]) -> LockRequest {
    LockRequest::new(Vec::new(), args[..1].to_vec())
}

pub(crate) fn write_all_keys(args: &[Bytes]) -> LockRequest {
    LockRequest::new(args.to_vec(), Vec::new())
}

pub(crate) fn read_all_keys(args: &[Bytes]) -> LockRequest {
    LockRequest::new(Vec::new(), args.to_vec())
}

pub(crate) fn write_first_two_keys(args: &[Bytes]) -> LockRequest {
    LockRequest::new(args[..2].to_vec(), Vec::new())
}

/// `key value [key value ...]`
pub(crate) fn write_even_keys(args: &[Bytes]) -> LockRequest {
    LockRequest::new(args.iter().step_by(2).cloned().collect(), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_i64(b"-42"), Ok(-42));
        assert_eq!(parse_i64(b"4x"), Err(CommandError::NotInteger));
        assert_eq!(parse_f64(b"1.5"), Ok(1.5));
        assert_eq!(parse_f64(b"-INF"), Ok(f64::NEG_INFINITY));
        assert_eq!(parse_f64(b"nan"), Err(CommandError::NotFloat));
        assert_eq!(parse_f64(b"abc"), Err(CommandError::NotFloat));
        assert_eq!(format_f64(2.0), Bytes::from("2"));
        assert_eq!(format_f64(f64::INFINITY), Bytes::from("inf"));
    }

    #[test]
    fn test_clamp_ranks() {
        assert_eq!(clamp_ranks(0, -1, 4), Some((0, 3)));
        assert_eq!(clamp_ranks(-2, -1, 4), Some((2, 3)));
        assert_eq!(clamp_ranks(-100, 100, 4), Some((0, 3)));
        assert_eq!(clamp_ranks(3, 1, 4), None);
        assert_eq!(clamp_ranks(5, 10, 4), None);
        assert_eq!(clamp_ranks(0, -1, 0), None);
    }

    #[test]
    fn test_key_extraction() {
        let args = cmdline(&[b"k1", b"v1", b"k2", b"v2"]);
        assert_eq!(write_even_keys(&args).write, cmdline(&[b"k1", b"k2"]));
        assert_eq!(read_first_key(&args).read, cmdline(&[b"k1"]));
        assert!(no_keys(&args).write.is_empty());
    }
}
