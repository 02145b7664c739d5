//! Client connections
//!
//! One task per client. The task owns the socket, a read buffer and the
//! client's [`CommandHandler`] (and with it the selected database and any
//! open transaction).
//!
//! ## Lifecycle
//!
//! ```text
//! accept ──> ConnectionHandler::run
//!               │
//!               ▼
//!    ┌──────────────────────────────────┐
//!    │ parse every complete request     │◄──────┐
//!    │ in the buffer, execute, queue    │       │
//!    │ the replies                      │       │
//!    └───────────────┬──────────────────┘       │
//!                    ▼                          │
//!    ┌──────────────────────────────────┐       │
//!    │ flush queued replies (one write  │       │
//!    │ for a whole pipeline)            │       │
//!    └───────────────┬──────────────────┘       │
//!                    ▼                          │
//!    ┌──────────────────────────────────┐       │
//!    │ read more bytes                  │───────┘
//!    └──────────────────────────────────┘
//!               │ EOF, QUIT, protocol error
//!               ▼
//!            task ends
//! ```
//!
//! TCP is a stream: a read may carry half a request or several of them, so
//! bytes accumulate in a `BytesMut` until the parser finds a full frame.

use crate::commands::CommandHandler;
use crate::database::Server;
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Largest unparsed request a client may send before it is dropped.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Server-wide connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
    pub commands_processed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Why a connection ended.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Protocol(#[from] ParseError),

    /// Clean close between requests.
    #[error("peer closed the connection")]
    Closed,

    /// The peer closed the socket in the middle of a request.
    #[error("peer closed the connection mid-request")]
    Truncated,

    #[error("request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },
}

/// Drives one client socket.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    parser: RespParser,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
    /// Serialized replies not yet written.
    pending: Vec<u8>,
    max_request_size: usize,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        server: Arc<Server>,
        stats: Arc<ConnectionStats>,
        max_request_size: usize,
    ) -> Self {
        stats.connection_opened();
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            commands: CommandHandler::new(server),
            stats,
            pending: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            max_request_size,
        }
    }

    /// Serves the client until it disconnects, sends QUIT, or breaks the
    /// protocol.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");

        let result = self.main_loop().await;
        match &result {
            Ok(()) => info!(client = %self.addr, "client disconnected"),
            Err(ConnectionError::Closed) => {
                debug!(client = %self.addr, "client closed the connection")
            }
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let parsed = self.process_buffer();
            self.flush_pending().await?;

            match parsed {
                Ok(()) if self.commands.wants_close() => return Ok(()),
                Ok(()) => {}
                Err(e) => return self.reject(e).await,
            }

            match self.read_more_data().await {
                Ok(()) => {}
                Err(e @ ConnectionError::RequestTooLarge { .. }) => return self.reject(e).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Tells the client why before hanging up.
    async fn reject(&mut self, e: ConnectionError) -> Result<(), ConnectionError> {
        let reply = RespValue::error(format!("ERR Protocol error: {e}"));
        reply.serialize_into(&mut self.pending);
        self.flush_pending().await?;
        Err(e)
    }

    /// Executes every complete request in the buffer and queues the replies.
    /// Stops early after QUIT.
    fn process_buffer(&mut self) -> Result<(), ConnectionError> {
        while let Some(command) = self.try_parse_command()? {
            if let Some(reply) = self.commands.execute(command) {
                reply.serialize_into(&mut self.pending);
            }
            self.stats.command_processed();
            if self.commands.wants_close() {
                break;
            }
        }
        Ok(())
    }

    fn try_parse_command(&mut self) -> Result<Option<RespValue>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer)? {
            Some((value, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    consumed,
                    remaining = self.buffer.len(),
                    "parsed request"
                );
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= self.max_request_size {
            error!(client = %self.addr, size = self.buffer.len(), "request too large");
            return Err(ConnectionError::RequestTooLarge {
                limit: self.max_request_size,
            });
        }
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(if self.buffer.is_empty() {
                ConnectionError::Closed
            } else {
                ConnectionError::Truncated
            });
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "read");
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), ConnectionError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.pending).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(self.pending.len());
        trace!(client = %self.addr, bytes = self.pending.len(), "sent");
        self.pending.clear();
        Ok(())
    }
}

/// Runs a [`ConnectionHandler`] to completion. Ordinary disconnects are not
/// reported.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server: Arc<Server>,
    stats: Arc<ConnectionStats>,
    max_request_size: usize,
) {
    let handler = ConnectionHandler::new(stream, addr, server, stats, max_request_size);
    match handler.run().await {
        Ok(()) | Err(ConnectionError::Closed) => {}
        Err(ConnectionError::Io(ref e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => debug!(client = %addr, error = %e, "connection ended with error"),
    }
}
