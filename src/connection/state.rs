//! Per-connection state the engine needs: the selected database and the
//! transaction context.
//!
//! The engine only sees the [`Connection`] trait, so AOF replay and tests
//! can drive it with a bare [`ConnectionState`] and no socket at all.

use crate::commands::CmdLine;
use bytes::Bytes;
use std::collections::HashMap;

/// What the database layer may read and change about a client.
pub trait Connection: Send {
    fn db_index(&self) -> usize;
    fn select_db(&mut self, index: usize);

    fn in_multi(&self) -> bool;
    /// Entering MULTI starts an empty queue. Leaving it drops the queue,
    /// the recorded enqueue errors and every watched key.
    fn set_multi(&mut self, multi: bool);

    fn enqueue(&mut self, cmdline: CmdLine);
    fn queued(&self) -> &[CmdLine];
    fn take_queue(&mut self) -> Vec<CmdLine>;
    fn clear_queue(&mut self);

    /// Watched keys and the version each had when WATCH ran.
    fn watching(&self) -> &HashMap<Bytes, u64>;
    fn watching_mut(&mut self) -> &mut HashMap<Bytes, u64>;

    fn add_tx_error(&mut self, err: String);
    fn tx_errors(&self) -> &[String];
}

#[derive(Debug, Default)]
pub struct ConnectionState {
    db_index: usize,
    multi: bool,
    queue: Vec<CmdLine>,
    watching: HashMap<Bytes, u64>,
    tx_errors: Vec<String>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for ConnectionState {
    fn db_index(&self) -> usize {
        self.db_index
    }

    fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }

    fn in_multi(&self) -> bool {
        self.multi
    }

    fn set_multi(&mut self, multi: bool) {
        if !multi {
            self.watching.clear();
        }
        self.queue.clear();
        self.tx_errors.clear();
        self.multi = multi;
    }

    fn enqueue(&mut self, cmdline: CmdLine) {
        self.queue.push(cmdline);
    }

    fn queued(&self) -> &[CmdLine] {
        &self.queue
    }

    fn take_queue(&mut self) -> Vec<CmdLine> {
        std::mem::take(&mut self.queue)
    }

    fn clear_queue(&mut self) {
        self.queue.clear();
    }

    fn watching(&self) -> &HashMap<Bytes, u64> {
        &self.watching
    }

    fn watching_mut(&mut self) -> &mut HashMap<Bytes, u64> {
        &mut self.watching
    }

    fn add_tx_error(&mut self, err: String) {
        self.tx_errors.push(err);
    }

    fn tx_errors(&self) -> &[String] {
        &self.tx_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::cmdline;

    #[test]
    fn test_leaving_multi_resets_transaction_context() {
        let mut conn = ConnectionState::new();
        conn.watching_mut().insert(Bytes::from("w"), 3);
        conn.set_multi(true);
        assert!(conn.in_multi());
        assert_eq!(conn.watching().len(), 1);

        conn.enqueue(cmdline(&[b"set", b"k", b"v"]));
        conn.add_tx_error("ERR unknown command 'x'".into());
        assert_eq!(conn.queued().len(), 1);

        conn.set_multi(false);
        assert!(!conn.in_multi());
        assert!(conn.queued().is_empty());
        assert!(conn.tx_errors().is_empty());
        assert!(conn.watching().is_empty());
    }

    #[test]
    fn test_select_db() {
        let mut conn = ConnectionState::new();
        assert_eq!(conn.db_index(), 0);
        conn.select_db(5);
        assert_eq!(conn.db_index(), 5);
    }
}
