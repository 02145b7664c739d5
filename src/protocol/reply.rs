//! Reply values produced by the command engine.
//!
//! The engine speaks in terms of [`Reply`]; the connection layer converts a
//! reply into a [`RespValue`] only when it writes to the socket. Keeping the
//! two apart lets the transaction manager inspect results (is this an error?)
//! and nest them inside an EXEC reply without re-parsing wire bytes.

use crate::error::CommandError;
use crate::protocol::types::RespValue;
use bytes::Bytes;

/// Text used when a command produced something the wire layer cannot map.
pub const UNKNOWN_REPLY: &str = "ERR unknown reply";

/// The closed set of reply kinds a command can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`, `+PONG`, `+string`
    Status(String),
    /// `-ERR ...`
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// An array of bulk strings.
    MultiBulk(Vec<Bytes>),
    /// `$-1`
    NullBulk,
    /// An array of arbitrary replies (EXEC results).
    MultiRaw(Vec<Reply>),
    /// `*0`, also the optimistic-lock failure of EXEC.
    Empty,
    /// Nothing is written back.
    NoReply,
    /// `+QUEUED`
    Queued,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Bulk reply for `Some`, null bulk for `None`.
    pub fn bulk_or_null(data: Option<Bytes>) -> Self {
        data.map_or(Reply::NullBulk, Reply::Bulk)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Converts the reply into its wire value. `NoReply` has none.
    pub fn into_resp(self) -> Option<RespValue> {
        let value = match self {
            Reply::Status(s) => RespValue::SimpleString(s),
            Reply::Error(e) => RespValue::Error(e),
            Reply::Integer(n) => RespValue::Integer(n),
            Reply::Bulk(b) => RespValue::BulkString(b),
            Reply::MultiBulk(items) => {
                RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
            }
            Reply::NullBulk => RespValue::Null,
            Reply::MultiRaw(replies) => RespValue::Array(
                replies
                    .into_iter()
                    .map(|r| r.into_resp().unwrap_or_else(|| RespValue::error(UNKNOWN_REPLY)))
                    .collect(),
            ),
            Reply::Empty => RespValue::Array(Vec::new()),
            Reply::NoReply => return None,
            Reply::Queued => RespValue::SimpleString("QUEUED".to_string()),
        };
        Some(value)
    }
}

impl From<CommandError> for Reply {
    fn from(err: CommandError) -> Self {
        Reply::Error(err.to_string())
    }
}

impl From<Result<Reply, CommandError>> for Reply {
    fn from(result: Result<Reply, CommandError>) -> Self {
        result.unwrap_or_else(Reply::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(reply: Reply) -> Vec<u8> {
        reply.into_resp().map(|v| v.serialize()).unwrap_or_default()
    }

    #[test]
    fn test_wire_forms() {
        assert_eq!(wire(Reply::ok()), b"+OK\r\n");
        assert_eq!(wire(Reply::Queued), b"+QUEUED\r\n");
        assert_eq!(wire(Reply::Empty), b"*0\r\n");
        assert_eq!(wire(Reply::NullBulk), b"$-1\r\n");
        assert_eq!(wire(Reply::NoReply), b"");
        assert_eq!(
            wire(Reply::MultiBulk(vec![Bytes::from("a"), Bytes::from("bc")])),
            b"*2\r\n$1\r\na\r\n$2\r\nbc\r\n"
        );
    }

    #[test]
    fn test_nested_multi_raw() {
        let reply = Reply::MultiRaw(vec![Reply::ok(), Reply::Integer(3), Reply::NoReply]);
        assert_eq!(
            wire(reply),
            b"*3\r\n+OK\r\n:3\r\n-ERR unknown reply\r\n".to_vec()
        );
    }

    #[test]
    fn test_error_conversion() {
        let reply: Reply = Err::<Reply, _>(CommandError::WrongType).into();
        assert!(reply.is_error());
        assert_eq!(
            reply,
            Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
        );
    }
}
