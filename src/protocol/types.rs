//! RESP (Redis Serialization Protocol) wire values.
//!
//! Each RESP type starts with a prefix byte and ends with CRLF:
//!
//! - `+` Simple String, `-` Error, `:` Integer
//! - `$` Bulk String (`$-1` is the null bulk string)
//! - `*` Array (`*-1` is the null array)
//!
//! The engine never builds these directly; it produces a
//! [`Reply`](crate::protocol::Reply) which is converted here at the edge.

use bytes::Bytes;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A value on the wire, used both for parsed requests and encoded responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`
    SimpleString(String),

    /// `-<message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string or null array
    Null,

    /// `*<count>\r\n<element>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Encodes a command line as a multi-bulk array, the format used both by
    /// clients and by the append-only file.
    pub fn command_line(args: &[Bytes]) -> Self {
        RespValue::Array(args.iter().cloned().map(RespValue::BulkString).collect())
    }

    /// Serializes the value to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes into an existing buffer so callers can reuse allocations.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Extracts the raw bytes of a simple or bulk string.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(b) => Some(b.clone()),
            RespValue::SimpleString(s) => Some(Bytes::from(s.clone())),
            RespValue::Integer(n) => Some(Bytes::from(n.to_string())),
            _ => None,
        }
    }

    /// Converts a request array into a command line.
    ///
    /// Returns `None` for anything that is not a non-empty array of
    /// string-like elements.
    pub fn into_command_line(self) -> Option<Vec<Bytes>> {
        match self {
            RespValue::Array(items) if !items.is_empty() => {
                items.iter().map(RespValue::to_bytes).collect()
            }
            _ => None,
        }
    }
}
