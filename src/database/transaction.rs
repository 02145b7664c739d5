//! Transactions: MULTI / EXEC / DISCARD / WATCH / UNWATCH
//!
//! ```text
//!  MULTI ──> queue commands (+QUEUED, or record an error)
//!              │
//!            EXEC
//!              │
//!              ▼
//!   lock every key the queue writes or reads, plus watched keys
//!              │
//!   any watched version changed? ──yes──> *0 (nothing runs)
//!              │ no
//!              ▼
//!   for each command: capture undo log, run it
//!              │
//!   a command failed? ──yes──> replay undo logs newest first,
//!              │               still under the same locks, reply error
//!              │ no
//!              ▼
//!   bump write-key versions, log to AOF, reply with every result
//! ```
//!
//! Locks are held from before the watch check until the last undo command
//! ran, so no other client ever observes a half-applied or half-rolled-back
//! transaction.

use crate::commands::{CmdLine, CommandSpec};
use crate::connection::Connection;
use crate::database::{Database, Entity};
use crate::error::{CommandError, TxError};
use crate::protocol::Reply;
use crate::storage::{LockRequest, LockedShards};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};

fn wrong_arity(name: &str) -> Reply {
    CommandError::WrongArity(name.to_string()).into()
}

fn tx_error(err: TxError) -> Reply {
    CommandError::from(err).into()
}

impl Database {
    pub(crate) fn start_multi(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() != 1 {
            return wrong_arity("multi");
        }
        if conn.in_multi() {
            return tx_error(TxError::NestedMulti);
        }
        conn.set_multi(true);
        Reply::ok()
    }

    pub(crate) fn discard(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() != 1 {
            return wrong_arity("discard");
        }
        if !conn.in_multi() {
            return tx_error(TxError::DiscardWithoutMulti);
        }
        conn.set_multi(false);
        Reply::ok()
    }

    /// Records the current version of each key. Re-watching a key keeps the
    /// version seen first.
    pub(crate) fn watch(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() < 2 {
            return wrong_arity("watch");
        }
        if conn.in_multi() {
            return tx_error(TxError::WatchInsideMulti);
        }
        let keys = &cmdline[1..];
        let _locked = self.lock_keys(&[], keys);
        for key in keys {
            let version = self.get_version(key);
            conn.watching_mut().entry(key.clone()).or_insert(version);
        }
        Reply::ok()
    }

    pub(crate) fn unwatch(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() != 1 {
            return wrong_arity("unwatch");
        }
        conn.watching_mut().clear();
        Reply::ok()
    }

    /// Queues a command inside MULTI. Unknown commands and bad arity are
    /// reported now and make the later EXEC abort.
    pub(crate) fn enqueue(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        match self.registry.resolve(cmdline) {
            Ok(_) => {
                conn.enqueue(cmdline.to_vec());
                Reply::Queued
            }
            Err(err) => {
                let message = err.to_string();
                conn.add_tx_error(message.clone());
                Reply::Error(message)
            }
        }
    }

    pub(crate) fn exec_multi(&self, conn: &mut dyn Connection, cmdline: &[Bytes]) -> Reply {
        if cmdline.len() != 1 {
            return wrong_arity("exec");
        }
        if !conn.in_multi() {
            return tx_error(TxError::ExecWithoutMulti);
        }
        if !conn.tx_errors().is_empty() {
            conn.set_multi(false);
            return tx_error(TxError::ExecAbort);
        }

        let queue = conn.take_queue();
        let watching = std::mem::take(conn.watching_mut());
        conn.set_multi(false);
        self.exec_queued(&queue, &watching)
    }

    /// Runs a queued batch atomically.
    ///
    /// Returns `Reply::Empty` when a watched key changed since it was
    /// watched, an `EXECABORT` error when a command failed (after undoing
    /// the commands before it), or every command's reply.
    pub fn exec_queued(&self, queue: &[CmdLine], watching: &HashMap<Bytes, u64>) -> Reply {
        let mut request = LockRequest::default();
        let mut specs: Vec<&CommandSpec> = Vec::with_capacity(queue.len());
        for cmdline in queue {
            match self.registry.resolve(cmdline) {
                Ok(spec) => {
                    request.merge((spec.keys)(&cmdline[1..]));
                    specs.push(spec);
                }
                Err(err) => return err.into(),
            }
        }
        request.read.extend(watching.keys().cloned());
        let mut locked = self.lock(&request);

        let changed = watching
            .iter()
            .find(|(key, version)| self.get_version(key) != **version);
        if let Some((key, _)) = changed {
            debug!(db = self.index, key = ?key, "watched key changed, transaction aborted");
            return Reply::Empty;
        }

        let mut results = Vec::with_capacity(queue.len());
        let mut undo_logs: Vec<Vec<CmdLine>> = Vec::with_capacity(queue.len());
        let mut log_lines = Vec::new();
        for (cmdline, spec) in queue.iter().zip(specs) {
            let args = &cmdline[1..];
            let undo = spec
                .undo
                .map(|undo| undo(self, &locked, args))
                .unwrap_or_default();

            let reply = Reply::from((spec.exec)(self, &mut locked, args));
            if let Reply::Error(message) = reply {
                debug!(
                    db = self.index,
                    command = spec.name,
                    error = %message,
                    executed = undo_logs.len(),
                    "queued command failed, rolling back"
                );
                self.rollback(&mut locked, undo_logs);
                return tx_error(TxError::RolledBack(message));
            }

            if spec.is_write() {
                log_lines.extend(spec.log_lines(self, &locked, cmdline));
            }
            undo_logs.push(undo);
            results.push(reply);
        }

        request.write.sort();
        request.write.dedup();
        self.bump_version(&request.write);
        self.append(log_lines);
        Reply::MultiRaw(results)
    }

    /// Replays undo logs, newest command first, under the batch's locks.
    fn rollback(&self, locked: &mut LockedShards<'_, Entity>, undo_logs: Vec<Vec<CmdLine>>) {
        for cmdline in undo_logs.into_iter().rev().flatten() {
            if let Reply::Error(message) = self.exec_with_lock(locked, &cmdline) {
                warn!(
                    db = self.index,
                    command = ?cmdline.first(),
                    error = %message,
                    "undo command failed"
                );
            }
        }
    }
}
