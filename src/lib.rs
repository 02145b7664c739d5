//! # RavenKV - An In-Memory Key-Value Server
//!
//! RavenKV speaks RESP, keeps strings, lists and sorted sets in sharded
//! maps, expires keys with a timer task, and runs `MULTI`/`EXEC`
//! transactions that roll back when a queued command fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              RavenKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │ ConnectionState         │
//! │                                               ▼                         │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │ Server: SELECT, FLUSHALL, db 0 .. db N-1     │    │
//! │                     └──────────────────────┬───────────────────────┘    │
//! │                                            ▼                            │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │  Command    │───>│ Database                                     │    │
//! │  │  Registry   │    │  data: ShardedMap<Entity>                    │    │
//! │  └─────────────┘    │  ttl:  ShardedMap<SystemTime>                │    │
//! │                     │  versions: ShardedMap<u64>  (WATCH)          │    │
//! │                     └───────┬───────────────────────────┬──────────┘    │
//! │                             │                           │               │
//! │                     ┌───────┴─────────┐        ┌────────┴────────┐      │
//! │                     │ ExpiryScheduler │        │  Append-only    │      │
//! │                     │  (timer task)   │        │  file writer    │      │
//! │                     └─────────────────┘        └─────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use ravenkv::commands::CommandRegistry;
//! use ravenkv::connection::{handle_connection, ConnectionStats, DEFAULT_MAX_REQUEST_SIZE};
//! use ravenkv::database::{DatabaseConfig, Server};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(CommandRegistry::standard());
//!     let server = Arc::new(Server::new(16, registry, DatabaseConfig::default()));
//!     let stats = Arc::new(ConnectionStats::new());
//!
//!     let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let (server, stats) = (Arc::clone(&server), Arc::clone(&stats));
//!         tokio::spawn(handle_connection(stream, addr, server, stats, DEFAULT_MAX_REQUEST_SIZE));
//!     }
//! }
//! ```
//!
//! ## Supported Commands
//!
//! ### Keys
//! `DEL`, `EXISTS`, `EXPIRE`, `PEXPIRE`, `EXPIREAT`, `PEXPIREAT`, `TTL`,
//! `PTTL`, `PERSIST`, `TYPE`, `RENAME`, `RENAMENX`, `KEYS`, `SCAN`,
//! `DBSIZE`, `FLUSHDB`, `PING`, `ECHO`
//!
//! ### Strings
//! `GET`, `SET [EX|PX|KEEPTTL] [NX|XX]`, `SETNX`, `SETEX`, `PSETEX`,
//! `GETSET`, `GETDEL`, `INCR`, `INCRBY`, `DECR`, `DECRBY`, `APPEND`,
//! `STRLEN`, `MGET`, `MSET`, `MSETNX`
//!
//! ### Lists
//! `LPUSH`, `RPUSH`, `LPOP`, `RPOP`, `LREM`, `LLEN`, `LINDEX`, `LRANGE`
//!
//! ### Sorted sets
//! `ZADD [NX|XX]`, `ZCARD`, `ZSCORE`, `ZCOUNT`, `ZINCRBY`, `ZRANK`,
//! `ZREVRANK`, `ZRANGE`, `ZREVRANGE`, `ZRANGEBYSCORE`, `ZREVRANGEBYSCORE`,
//! `ZREM`, `ZREMRANGEBYRANK`, `ZREMRANGEBYSCORE`
//!
//! ### Server and transactions
//! `SELECT`, `FLUSHALL`, `MULTI`, `EXEC`, `DISCARD`, `WATCH`, `UNWATCH`, `QUIT`
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP parser, values and engine replies
//! - [`storage`]: sharded map, key locking, skiplist, sorted set, expiry timer
//! - [`database`]: one keyspace, the transaction manager, the multi-db server
//! - [`commands`]: the command table and every command implementation
//! - [`connection`]: socket handling and per-client state
//! - [`aof`]: the append-only file
//! - [`config`]: defaults, environment and command-line flags
//!
//! ## Locking
//!
//! Commands never touch the maps directly. Before a command runs, every shard
//! its keys hash to is locked in ascending index order (a shard wanted for
//! both reading and writing is write-locked once), so two commands can never
//! wait on each other in a cycle. The locked view is the only handle a
//! command gets.

pub mod aof;
pub mod commands;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod protocol;
pub mod storage;

pub use commands::{CommandHandler, CommandRegistry};
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use database::{Database, DatabaseConfig, Server};
pub use error::{CommandError, CommandResult};
pub use protocol::{ParseError, Reply, RespParser, RespValue};

/// The default port RavenKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host RavenKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
