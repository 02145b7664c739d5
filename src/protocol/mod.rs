//! RESP protocol layer.
//!
//! - `types`: the wire value [`RespValue`] and its serializer
//! - `parser`: incremental parser for requests and AOF records
//! - `reply`: the engine-side [`Reply`] model and its conversion to the wire
//!
//! ```
//! use ravenkv::protocol::{parse_message, Reply};
//!
//! let (request, _) = parse_message(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(request.into_command_line().unwrap().len(), 2);
//!
//! let wire = Reply::NullBulk.into_resp().unwrap().serialize();
//! assert_eq!(wire, b"$-1\r\n");
//! ```

pub mod parser;
pub mod reply;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use reply::{Reply, UNKNOWN_REPLY};
pub use types::RespValue;
