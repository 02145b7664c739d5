//! Command Registry
//!
//! A table from lowercase command name to [`CommandSpec`]. The registry is
//! built once at startup and handed to every database as an
//! `Arc<CommandRegistry>`; tests build partial registries with only the
//! commands they exercise.

use crate::commands::{keys, list, string, zset, CmdLine};
use crate::database::{Database, Entity};
use crate::error::{CommandError, CommandResult};
use crate::protocol::Reply;
use crate::storage::{LockRequest, LockedShards};
use bytes::Bytes;
use std::collections::HashMap;

/// Runs a command against the keys its [`KeysFn`] locked. `args` excludes
/// the command name.
pub type ExecFn = fn(&Database, &mut LockedShards<'_, Entity>, &[Bytes]) -> CommandResult<Reply>;

/// Declares the keys a command writes and reads.
pub type KeysFn = fn(&[Bytes]) -> LockRequest;

/// Captures, before the command runs, the command lines that would restore
/// every key the command is about to write.
pub type UndoFn = fn(&Database, &LockedShards<'_, Entity>, &[Bytes]) -> Vec<CmdLine>;

/// Produces, after the command ran, what goes into the append-only file in
/// its place. Commands with relative times use it to log absolute deadlines.
pub type LogFn = fn(&Database, &LockedShards<'_, Entity>, &[Bytes]) -> Vec<CmdLine>;

/// Everything the engine needs to know about one command.
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Argument count including the name; negative means "at least".
    pub arity: i32,
    pub exec: ExecFn,
    pub keys: KeysFn,
    /// Present exactly for write commands.
    pub undo: Option<UndoFn>,
    pub log: Option<LogFn>,
}

impl CommandSpec {
    pub const fn read(name: &'static str, arity: i32, exec: ExecFn, keys: KeysFn) -> Self {
        Self {
            name,
            arity,
            exec,
            keys,
            undo: None,
            log: None,
        }
    }

    pub const fn write(
        name: &'static str,
        arity: i32,
        exec: ExecFn,
        keys: KeysFn,
        undo: UndoFn,
    ) -> Self {
        Self {
            name,
            arity,
            exec,
            keys,
            undo: Some(undo),
            log: None,
        }
    }

    pub const fn with_log(self, log: LogFn) -> Self {
        Self {
            log: Some(log),
            ..self
        }
    }

    pub fn is_write(&self) -> bool {
        self.undo.is_some()
    }

    /// Checks a full command line length (name included).
    pub fn accepts(&self, argc: usize) -> bool {
        let arity = self.arity.unsigned_abs() as usize;
        if self.arity >= 0 {
            argc == arity
        } else {
            argc >= arity
        }
    }

    /// What the append-only file records for a successful run.
    pub fn log_lines(
        &self,
        db: &Database,
        locked: &LockedShards<'_, Entity>,
        cmdline: &[Bytes],
    ) -> Vec<CmdLine> {
        match self.log {
            Some(log) => log(db, locked, &cmdline[1..]),
            None => vec![cmdline.to_vec()],
        }
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("write", &self.is_write())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command this server supports.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        keys::register(&mut registry);
        string::register(&mut registry);
        list::register(&mut registry);
        zset::register(&mut registry);
        registry
    }

    /// Adds a command, replacing any previous one with the same name.
    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Looks up the command named by `cmdline[0]` (case-insensitively) and
    /// validates the argument count.
    pub fn resolve(&self, cmdline: &[Bytes]) -> CommandResult<&CommandSpec> {
        let name = command_name(cmdline);
        let spec = self
            .commands
            .get(name.as_str())
            .ok_or_else(|| CommandError::UnknownCommand(name.clone()))?;
        if !spec.accepts(cmdline.len()) {
            return Err(CommandError::WrongArity(name));
        }
        Ok(spec)
    }
}

/// Lowercase name of a command line, empty for an empty line.
pub fn command_name(cmdline: &[Bytes]) -> String {
    cmdline
        .first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
        .unwrap_or_default()
}
