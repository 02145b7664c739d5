//! Append-only file
//!
//! Every successful write is appended to the file as a RESP multi-bulk
//! record, the same bytes a client would send. On startup the file is
//! replayed through the normal command path, so recovery needs no format of
//! its own.
//!
//! ```text
//!   Database ──append_command(db, line)──> channel ──> writer task
//!                                                        │
//!                                     SELECT when db changes, record,
//!                                     flush/fsync per FsyncPolicy
//!                                                        ▼
//!                                                  appendonly.aof
//! ```
//!
//! Appending never blocks a command: lines go through an unbounded channel
//! and a single Tokio task owns the file.

use crate::commands::{cmdline, CmdLine};
use crate::connection::ConnectionState;
use crate::database::Server;
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Interval of the background flush, and of the fsync under `everysec`.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Receiver of successful write commands.
pub trait AppendLog: Send + Sync + fmt::Debug {
    fn append_command(&self, db_index: usize, cmdline: CmdLine);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl AppendLog for NoopLog {
    fn append_command(&self, _db_index: usize, _cmdline: CmdLine) {}
}

/// When appended records are forced to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// After every record.
    Always,
    /// Once per second.
    #[default]
    EverySec,
    /// Left to the operating system.
    No,
}

impl FromStr for FsyncPolicy {
    type Err = AofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(AofError::InvalidFsyncPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::EverySec => "everysec",
            FsyncPolicy::No => "no",
        })
    }
}

#[derive(Debug, Error)]
pub enum AofError {
    #[error("append-only file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("append-only file is corrupt at byte {offset}: {source}")]
    Corrupt {
        offset: usize,
        #[source]
        source: ParseError,
    },

    #[error("append-only file holds a non-command record at byte {offset}")]
    InvalidRecord { offset: usize },

    #[error("invalid appendfsync policy '{0}' (expected always, everysec or no)")]
    InvalidFsyncPolicy(String),

    #[error("append-only writer has stopped")]
    Closed,
}

enum Message {
    Record { db_index: usize, cmdline: CmdLine },
    Close(oneshot::Sender<()>),
}

/// Handle to the append-only file and its writer task.
#[derive(Debug)]
pub struct Aof {
    tx: mpsc::UnboundedSender<Message>,
    path: PathBuf,
    policy: FsyncPolicy,
}

impl Aof {
    /// Opens (creating if needed) the file for appending and starts the
    /// writer task.
    pub async fn open(path: impl Into<PathBuf>, policy: FsyncPolicy) -> Result<Self, AofError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(file, policy, rx));
        info!(path = %path.display(), fsync = %policy, "append-only file opened");
        Ok(Self { tx, path, policy })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Writes out everything appended so far, syncs, and stops the writer.
    pub async fn close(&self) -> Result<(), AofError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Message::Close(done_tx))
            .map_err(|_| AofError::Closed)?;
        done_rx.await.map_err(|_| AofError::Closed)
    }
}

impl AppendLog for Aof {
    fn append_command(&self, db_index: usize, cmdline: CmdLine) {
        if self.tx.send(Message::Record { db_index, cmdline }).is_err() {
            warn!(db = db_index, "append-only writer has stopped, record dropped");
        }
    }
}

async fn writer_loop(
    file: File,
    policy: FsyncPolicy,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut writer = RecordWriter::new(file);
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(Message::Record { db_index, cmdline }) => {
                    if let Err(e) = writer.write(db_index, &cmdline).await {
                        error!(error = %e, "append-only write failed");
                        continue;
                    }
                    if policy == FsyncPolicy::Always {
                        if let Err(e) = writer.sync().await {
                            error!(error = %e, "append-only fsync failed");
                        }
                    }
                }
                Some(Message::Close(done)) => {
                    if let Err(e) = writer.sync().await {
                        error!(error = %e, "append-only fsync on close failed");
                    }
                    debug!("append-only writer closed");
                    let _ = done.send(());
                    return;
                }
                None => {
                    if let Err(e) = writer.sync().await {
                        error!(error = %e, "append-only fsync on shutdown failed");
                    }
                    return;
                }
            },
            _ = tick.tick() => {
                let result = match policy {
                    FsyncPolicy::EverySec => writer.sync().await,
                    FsyncPolicy::Always | FsyncPolicy::No => writer.flush().await,
                };
                if let Err(e) = result {
                    error!(error = %e, "append-only periodic flush failed");
                }
            }
        }
    }
}

/// Buffered record writer that tracks the database the file is "in".
struct RecordWriter {
    out: BufWriter<File>,
    current_db: Option<usize>,
    scratch: Vec<u8>,
}

impl RecordWriter {
    fn new(file: File) -> Self {
        Self {
            out: BufWriter::new(file),
            current_db: None,
            scratch: Vec::with_capacity(256),
        }
    }

    async fn write(&mut self, db_index: usize, line: &[Bytes]) -> std::io::Result<()> {
        self.scratch.clear();
        if self.current_db != Some(db_index) {
            let select = cmdline(&[b"SELECT", db_index.to_string().as_bytes()]);
            RespValue::command_line(&select).serialize_into(&mut self.scratch);
        }
        RespValue::command_line(line).serialize_into(&mut self.scratch);
        self.out.write_all(&self.scratch).await?;
        self.current_db = Some(db_index);
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush().await
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        self.out.flush().await?;
        self.out.get_ref().sync_data().await
    }
}

/// Replays the file at `path` into `server`. A missing file is an empty
/// log. Returns the number of records applied.
pub async fn load(server: &Server, path: impl AsRef<Path>) -> Result<usize, AofError> {
    let path = path.as_ref();
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no append-only file, starting empty");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };
    let records = replay(server, &data)?;
    info!(path = %path.display(), records, "append-only file loaded");
    Ok(records)
}

/// Executes every record in `data` against `server` as one client would.
///
/// A record cut off at the end of the data (a crash mid-append) is ignored;
/// garbage anywhere is an error. Records the server rejects are logged and
/// skipped.
pub fn replay(server: &Server, data: &[u8]) -> Result<usize, AofError> {
    let mut conn = ConnectionState::new();
    let mut parser = RespParser::new();
    let mut offset = 0;
    let mut records = 0;

    while offset < data.len() {
        let (value, consumed) = match parser.parse(&data[offset..]) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                warn!(
                    offset,
                    dropped = data.len() - offset,
                    "append-only file ends with a partial record, ignoring it"
                );
                break;
            }
            Err(source) => return Err(AofError::Corrupt { offset, source }),
        };
        let cmdline = value
            .into_command_line()
            .ok_or(AofError::InvalidRecord { offset })?;

        let reply = server.exec(&mut conn, &cmdline);
        if reply.is_error() {
            warn!(offset, reply = ?reply, "append-only record failed on replay");
        }
        offset += consumed;
        records += 1;
    }
    Ok(records)
}
