//! Command Handler Module
//!
//! The per-client front of the command engine. It turns a parsed RESP
//! request into a command line, hands it to the [`Server`] together with the
//! client's [`ConnectionState`], and turns the [`Reply`] back into a RESP
//! value for the socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  RespValue  │───>│   CmdLine   │───>│ Server::exec│      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │  ┌─────────────┐    ┌─────────────┐           │             │
//! │  │  RespValue  │<───│    Reply    │<──────────┘             │
//! │  └─────────────┘    └─────────────┘                         │
//! │                                                             │
//! │  ConnectionState: selected db, MULTI queue, watched keys    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `QUIT` never reaches the server: the handler answers `+OK` and marks
//! itself closing so the connection loop can hang up after the reply.

use crate::commands::registry::command_name;
use crate::connection::ConnectionState;
use crate::database::Server;
use crate::protocol::{Reply, RespValue};
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Executes commands for one client.
#[derive(Debug)]
pub struct CommandHandler {
    server: Arc<Server>,
    state: ConnectionState,
    closing: bool,
}

impl CommandHandler {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            state: ConnectionState::new(),
            closing: false,
        }
    }

    /// Executes a request and returns the value to send back, if any.
    pub fn execute(&mut self, command: RespValue) -> Option<RespValue> {
        let Some(cmdline) = command.into_command_line() else {
            return Some(RespValue::error("ERR invalid command format"));
        };

        if command_name(&cmdline) == "quit" {
            self.closing = true;
            return Some(RespValue::ok());
        }

        let reply = self.server.exec(&mut self.state, &cmdline);
        trace!(
            command = %command_name(&cmdline),
            error = reply.is_error(),
            "command executed"
        );
        reply.into_resp()
    }

    /// Executes a request and returns the engine reply without converting
    /// it to a wire value.
    pub fn execute_reply(&mut self, cmdline: &[Bytes]) -> Reply {
        self.server.exec(&mut self.state, cmdline)
    }

    /// True once the client sent QUIT.
    pub fn wants_close(&self) -> bool {
        self.closing
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }
}
