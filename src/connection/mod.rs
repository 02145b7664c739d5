//! Connection Module
//!
//! Client connections: the socket task that reads requests and writes
//! replies, and the per-client state the engine reads and updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener (main.rs)                  │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept(), spawn one task per client
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  BytesMut ──> RespParser ──> CommandHandler ──> BufWriter   │
//! │                                   │                         │
//! │                          ConnectionState                    │
//! │                   (db index, MULTI queue, WATCH)            │
//! └───────────────────────────────────┬─────────────────────────┘
//!                                     ▼
//!                               Arc<Server>
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use ravenkv::commands::CommandRegistry;
//! use ravenkv::connection::{handle_connection, ConnectionStats, DEFAULT_MAX_REQUEST_SIZE};
//! use ravenkv::database::{DatabaseConfig, Server};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(CommandRegistry::standard());
//! let server = Arc::new(Server::new(16, registry, DatabaseConfig::default()));
//! let stats = Arc::new(ConnectionStats::new());
//!
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(
//!     stream,
//!     addr,
//!     Arc::clone(&server),
//!     stats,
//!     DEFAULT_MAX_REQUEST_SIZE,
//! ));
//! ```

pub mod handler;
pub mod state;

pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionStats,
    DEFAULT_MAX_REQUEST_SIZE,
};
pub use state::{Connection, ConnectionState};
