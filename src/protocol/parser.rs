//! Incremental RESP parser.
//!
//! The parser works on whatever bytes have arrived so far and reports one of:
//!
//! - `Ok(Some((value, consumed)))`: a full value was decoded from the first
//!   `consumed` bytes
//! - `Ok(None)`: the value is incomplete, read more from the socket
//! - `Err(ParseError)`: the peer violated the protocol
//!
//! The same parser is used for network input and for replaying the
//! append-only file, which stores commands in multi-bulk form.
//! Lines that do not start with a RESP prefix are treated as inline commands
//! (`PING\r\n`, `SET k v\r\n`) the way `redis-cli` and telnet users send them.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// A resumable RESP parser.
///
/// ```
/// use ravenkv::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser
///     .parse(b"*1\r\n$4\r\nPING\r\n")
///     .unwrap()
///     .unwrap();
/// assert_eq!(consumed, 14);
/// assert!(matches!(value, RespValue::Array(_)));
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to decode one value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match first {
            prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER => parse_line_value(buf),
            prefix::BULK_STRING => parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            _ => parse_inline(buf),
        }
    }

    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((count, mut consumed)) = read_length(buf)? else {
            return Ok(None);
        };
        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        // Cap the preallocation; a hostile count must not reserve gigabytes.
        let mut elements = Vec::with_capacity((count as usize).min(1024));
        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => {
                    self.depth -= 1;
                    return Ok(None);
                }
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Parses `+text`, `-text` and `:n` lines.
fn parse_line_value(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some(end) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[1..1 + end])
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    let consumed = 1 + end + CRLF.len();

    let value = match buf[0] {
        prefix::SIMPLE_STRING => RespValue::SimpleString(text.to_string()),
        prefix::ERROR => RespValue::Error(text.to_string()),
        prefix::INTEGER => RespValue::Integer(
            text.parse()
                .map_err(|_| ParseError::InvalidInteger(text.to_string()))?,
        ),
        other => return Err(ParseError::UnknownPrefix(other)),
    };
    Ok(Some((value, consumed)))
}

fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((length, header)) = read_length(buf)? else {
        return Ok(None);
    };
    if length == -1 {
        return Ok(Some((RespValue::Null, header)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }
    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total = header + length + CRLF.len();
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header + length..total] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header..header + length]);
    Ok(Some((RespValue::BulkString(data), total)))
}

/// Reads the `<n>\r\n` header shared by bulk strings and arrays.
/// Returns the length and the number of header bytes including the prefix.
fn read_length(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let Some(end) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[1..1 + end])
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    let n = text
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidInteger(text.to_string()))?;
    Ok(Some((n, 1 + end + CRLF.len())))
}

fn parse_inline(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some(end) = find_crlf(buf) else {
        return Ok(None);
    };
    let words: Vec<RespValue> = buf[..end]
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| RespValue::BulkString(Bytes::copy_from_slice(word)))
        .collect();
    if words.is_empty() {
        return Err(ParseError::ProtocolError("empty inline command".to_string()));
    }
    Ok(Some((RespValue::Array(words), end + CRLF.len())))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single message with a throwaway parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &[u8]) -> (RespValue, usize) {
        parse_message(input).unwrap().unwrap()
    }

    #[test]
    fn test_line_values() {
        assert_eq!(
            parse_ok(b"+OK\r\n"),
            (RespValue::SimpleString("OK".into()), 5)
        );
        assert_eq!(
            parse_ok(b"-ERR bad\r\n"),
            (RespValue::Error("ERR bad".into()), 10)
        );
        assert_eq!(parse_ok(b":-17\r\n"), (RespValue::Integer(-17), 6));
    }

    #[test]
    fn test_bulk_and_null() {
        assert_eq!(
            parse_ok(b"$5\r\nhello\r\n"),
            (RespValue::BulkString(Bytes::from("hello")), 11)
        );
        assert_eq!(
            parse_ok(b"$0\r\n\r\n"),
            (RespValue::BulkString(Bytes::new()), 6)
        );
        assert_eq!(parse_ok(b"$-1\r\n"), (RespValue::Null, 5));
        assert_eq!(parse_ok(b"*-1\r\n"), (RespValue::Null, 5));
    }

    #[test]
    fn test_binary_safe_bulk() {
        let (value, _) = parse_ok(b"$4\r\na\r\nb\r\n");
        assert_eq!(value, RespValue::BulkString(Bytes::from_static(b"a\r\nb")));
    }

    #[test]
    fn test_command_array() {
        let (value, consumed) = parse_ok(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
        assert_eq!(consumed, 27);
        assert_eq!(
            value.into_command_line().unwrap(),
            vec![Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")]
        );
    }

    #[test]
    fn test_incomplete_input() {
        for partial in [
            &b""[..],
            b"+OK",
            b"$5\r\nhel",
            b"*2\r\n$3\r\nGET\r\n",
            b"*2\r\n$3\r\nGET\r\n$4\r\nna",
            b"PING",
        ] {
            assert_eq!(parse_message(partial).unwrap(), None, "{:?}", partial);
        }
    }

    #[test]
    fn test_pipelined_values_parse_one_at_a_time() {
        let input = b"+A\r\n+B\r\n";
        let (first, used) = parse_ok(input);
        assert_eq!(first, RespValue::SimpleString("A".into()));
        let (second, _) = parse_ok(&input[used..]);
        assert_eq!(second, RespValue::SimpleString("B".into()));
    }

    #[test]
    fn test_inline_command() {
        let (value, consumed) = parse_ok(b"SET  key value\r\n");
        assert_eq!(consumed, 16);
        assert_eq!(
            value.into_command_line().unwrap(),
            vec![Bytes::from("SET"), Bytes::from("key"), Bytes::from("value")]
        );
        assert!(parse_message(b"   \r\n").is_err());
    }

    #[test]
    fn test_protocol_errors() {
        assert!(matches!(
            parse_message(b":abc\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b"$-5\r\n"),
            Err(ParseError::InvalidBulkLength(-5))
        ));
        assert!(matches!(
            parse_message(b"*-2\r\n"),
            Err(ParseError::InvalidArrayLength(-2))
        ));
        assert!(matches!(
            parse_message(b"$3\r\nabcXY"),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(
            parse_message(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }
}
