//! Multi-database server
//!
//! Owns the numbered databases and the two commands that span them:
//! `SELECT` changes the client's database, `FLUSHALL` empties every one.
//! Everything else is routed to the client's current database.
//!
//! A command that panics is answered with an error instead of taking the
//! process down. Shard locks recover from poisoning, so the keyspace stays
//! usable afterwards.

use crate::aof::AppendLog;
use crate::commands::registry::command_name;
use crate::commands::{parse_i64, CommandRegistry};
use crate::connection::Connection;
use crate::database::{Database, DatabaseConfig};
use crate::error::{CommandError, TxError};
use crate::protocol::{Reply, UNKNOWN_REPLY};
use bytes::Bytes;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info};

/// Redis' default number of databases.
pub const DEFAULT_DATABASES: usize = 16;

#[derive(Debug)]
pub struct Server {
    databases: Vec<Database>,
    append_log: OnceLock<Arc<dyn AppendLog>>,
}

impl Server {
    /// Creates `count` empty databases (at least one). Must be called
    /// inside a Tokio runtime.
    pub fn new(count: usize, registry: Arc<CommandRegistry>, config: DatabaseConfig) -> Self {
        let databases = (0..count.max(1))
            .map(|index| Database::new(index, Arc::clone(&registry), config))
            .collect::<Vec<_>>();
        info!(
            databases = databases.len(),
            shards = config.shard_count,
            commands = registry.len(),
            "server initialized"
        );
        Self {
            databases,
            append_log: OnceLock::new(),
        }
    }

    pub fn database(&self, index: usize) -> Option<&Database> {
        self.databases.get(index)
    }

    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    /// Starts forwarding every database's writes to `log`.
    pub fn attach_append_log(&self, log: Arc<dyn AppendLog>) {
        for db in &self.databases {
            db.attach_append_log(Arc::clone(&log));
        }
        let _ = self.append_log.set(log);
    }

    pub fn exec(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(conn, cmdline))) {
            Ok(reply) => reply,
            Err(cause) => {
                error!(
                    command = %command_name(cmdline),
                    cause = panic_message(cause.as_ref()),
                    "command panicked"
                );
                Reply::Error(UNKNOWN_REPLY.to_string())
            }
        }
    }

    fn dispatch(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        match command_name(cmdline).as_str() {
            "select" => self.select(conn, cmdline),
            "flushall" => self.flush_all(conn, cmdline),
            _ => match self.databases.get(conn.db_index()) {
                Some(db) => db.exec(conn, cmdline),
                None => CommandError::InvalidDbIndex.into(),
            },
        }
    }

    fn reject_in_multi(conn: &mut dyn Connection, name: &str) -> Reply {
        let err = CommandError::from(TxError::NotAllowedInMulti(name.to_uppercase()));
        conn.add_tx_error(err.to_string());
        err.into()
    }

    /// SELECT index
    fn select(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() != 2 {
            return CommandError::WrongArity("select".into()).into();
        }
        if conn.in_multi() {
            return Self::reject_in_multi(conn, "select");
        }
        let index = match parse_i64(&cmdline[1]) {
            Ok(index) => index,
            Err(err) => return err.into(),
        };
        match usize::try_from(index) {
            Ok(index) if index < self.databases.len() => {
                conn.select_db(index);
                debug!(db = index, "database selected");
                Reply::ok()
            }
            _ => CommandError::InvalidDbIndex.into(),
        }
    }

    /// FLUSHALL
    fn flush_all(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() != 1 {
            return CommandError::WrongArity("flushall".into()).into();
        }
        if conn.in_multi() {
            return Self::reject_in_multi(conn, "flushall");
        }
        for db in &self.databases {
            if let Err(err) = db.flush() {
                return CommandError::from(err).into();
            }
        }
        if let Some(log) = self.append_log.get() {
            log.append_command(conn.db_index(), cmdline.to_vec());
        }
        info!("all databases flushed");
        Reply::ok()
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
