//! Error types shared by the storage engine and the command layer.
//!
//! Every command handler returns `Result<Reply, CommandError>`. The registry
//! turns the error into an error reply at the command boundary, so the
//! `Display` text of each variant is exactly what the client sees.

use thiserror::Error;

/// Misuse of a [`LockedShards`](crate::storage::LockedShards) view.
///
/// These can only happen when a command touches a key it did not declare in
/// its key-extraction function. They indicate a bug in the command table,
/// never a client mistake.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The key's shard is not part of the locked set.
    #[error("shard {shard} is not held by the current lock set")]
    NotHeld { shard: usize },

    /// The key's shard is held for reading but the caller tried to write.
    #[error("shard {shard} is held for reading only")]
    ReadOnly { shard: usize },
}

/// Errors produced by MULTI / EXEC / WATCH / DISCARD.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("ERR WATCH inside MULTI is not allowed")]
    WatchInsideMulti,

    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    #[error("ERR {0} is not allowed inside MULTI")]
    NotAllowedInMulti(String),

    /// A queued command failed during EXEC; everything before it was undone.
    #[error("EXECABORT Transaction rolled back: {0}")]
    RolledBack(String),
}

/// Errors a command can return to the client.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR value is not a valid float")]
    NotFloat,

    #[error("ERR min or max is not a float")]
    InvalidRange,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR {0}")]
    InvalidArgument(String),

    #[error("ERR no such key")]
    KeyNotFound,

    #[error("ERR DB index is out of range")]
    InvalidDbIndex,

    #[error(transparent)]
    Transaction(#[from] TxError),

    #[error("ERR internal lock violation: {0}")]
    LockOrdering(#[from] LockError),
}

/// Convenience alias used throughout the command layer.
pub type CommandResult<T> = Result<T, CommandError>;
