use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use orrery_common::error::StorageError;
use orrery_common::types::{Invid, TxnNumber};
use parking_lot::Mutex;

use crate::event::{
    LogEvent, CLASS_COMMENT, CLASS_FINISH_TRANSACTION, CLASS_START_TRANSACTION,
};

/// A destination for audit events that can also answer history queries.
pub trait EventLog: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> String;

    fn write(&self, event: &LogEvent) -> Result<(), StorageError>;

    fn retrieve_history(&self, query: &HistoryQuery) -> Result<String, StorageError>;

    /// Push buffered data to durable storage. Safe to call repeatedly.
    fn flush_and_sync(&self) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

/// Filter for `EventLog::retrieve_history`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Object (or admin, with `key_on_admin`) the history is about.
    /// `None` matches every event.
    pub subject: Option<Invid>,
    /// Inclusive lower time bound, ms since epoch.
    pub since: Option<i64>,
    /// Inclusive upper time bound, ms since epoch.
    pub before: Option<i64>,
    /// Match the event's admin instead of its affected objects.
    pub key_on_admin: bool,
    /// Include every event of a matching transaction, not just the ones
    /// that touch the subject.
    pub full_transactions: bool,
    /// Return only login/logout events; otherwise they are excluded.
    pub login_events_only: bool,
}

impl HistoryQuery {
    pub fn for_object(invid: Invid) -> Self {
        Self {
            subject: Some(invid),
            ..Default::default()
        }
    }

    pub fn for_admin(invid: Invid) -> Self {
        Self {
            subject: Some(invid),
            key_on_admin: true,
            ..Default::default()
        }
    }

    pub fn between(mut self, since: Option<i64>, before: Option<i64>) -> Self {
        self.since = since;
        self.before = before;
        self
    }

    pub fn full_transactions(mut self, full: bool) -> Self {
        self.full_transactions = full;
        self
    }

    pub fn login_events_only(mut self, only: bool) -> Self {
        self.login_events_only = only;
        self
    }
}

/// Render the events matching `query` as history text. Events must be in
/// time order.
pub fn render_history<I>(events: I, query: &HistoryQuery) -> String
where
    I: IntoIterator<Item = LogEvent>,
{
    let mut out = String::new();
    let mut open_txn: Option<TxnNumber> = None;

    for event in events {
        if let Some(since) = query.since {
            if event.time_ms < since {
                continue;
            }
        }
        if let Some(before) = query.before {
            if event.time_ms > before {
                break;
            }
        }
        if event.is_login_event() != query.login_events_only {
            continue;
        }

        let found = match query.subject {
            None => true,
            Some(subject) if query.key_on_admin => event.admin == Some(subject),
            Some(subject) => {
                let in_open_txn = open_txn.is_some() && event.transaction_id == open_txn;
                event.concerns(subject)
                    || (in_open_txn
                        && (query.full_transactions
                            || event.class_token == CLASS_FINISH_TRANSACTION))
            }
        };
        if !found {
            continue;
        }

        let when = event.time().format("%Y-%m-%d %H:%M:%S");
        match event.class_token.as_str() {
            CLASS_START_TRANSACTION => {
                open_txn = event.transaction_id;
                let _ = write!(
                    out,
                    "---------- Transaction {}: {} ----------\n\n",
                    when, event.admin_name
                );
            }
            CLASS_FINISH_TRANSACTION => {
                open_txn = None;
                let _ = write!(
                    out,
                    "---------- End Transaction {}: {} ----------\n\n",
                    when, event.admin_name
                );
            }
            CLASS_COMMENT => {
                let _ = write!(out, "\n\n{}\n", event.description);
            }
            class if open_txn.is_some() => {
                let _ = writeln!(out, "{}\n\t{}", class, event.description);
            }
            class => {
                let _ = writeln!(
                    out,
                    "{}: {} {}\n\t{}",
                    when, event.admin_name, class, event.description
                );
            }
        }
    }
    out
}

/// Event log backed by a single line-per-event text file.
pub struct FileEventLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileEventLog {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_events(&self) -> Result<Vec<LogEvent>, StorageError> {
        let file = File::open(&self.path)?;
        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match LogEvent::parse(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(
                    "{}:{}: skipping unreadable event: {}",
                    self.path.display(),
                    lineno + 1,
                    e
                ),
            }
        }
        Ok(events)
    }
}

impl EventLog for FileEventLog {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn write(&self, event: &LogEvent) -> Result<(), StorageError> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| StorageError::SinkClosed(self.name()))?;
        writer.write_all(event.to_line().as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn retrieve_history(&self, query: &HistoryQuery) -> Result<String, StorageError> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
        }
        Ok(render_history(self.read_events()?, query))
    }

    fn flush_and_sync(&self) -> Result<(), StorageError> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Fan-out log: writes go to every member, history comes from the first.
///
/// The member list lock is held across each operation, so membership
/// changes never interleave with a write in progress.
pub struct TeeEventLog {
    members: Mutex<Vec<Arc<dyn EventLog>>>,
}

impl TeeEventLog {
    pub fn new(members: Vec<Arc<dyn EventLog>>) -> Self {
        Self {
            members: Mutex::new(members),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn EventLog>) {
        self.members.lock().push(sink);
    }

    /// Remove a member by identity. Returns false if it was not attached.
    pub fn remove_sink(&self, sink: &Arc<dyn EventLog>) -> bool {
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|m| !Arc::ptr_eq(m, sink));
        members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl EventLog for TeeEventLog {
    fn name(&self) -> String {
        let names: Vec<String> = self.members.lock().iter().map(|m| m.name()).collect();
        format!("tee[{}]", names.join(", "))
    }

    /// A failing member is logged and skipped; the rest still get the event.
    /// Fails only when no member took the event.
    fn write(&self, event: &LogEvent) -> Result<(), StorageError> {
        let members = self.members.lock();
        let mut last_err = None;
        let mut accepted = 0usize;
        for member in members.iter() {
            match member.write(event) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!("event log {} failed to write event: {}", member.name(), e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if accepted == 0 => Err(e),
            _ if members.is_empty() => Err(StorageError::SinkClosed("tee has no members".into())),
            _ => Ok(()),
        }
    }

    fn retrieve_history(&self, query: &HistoryQuery) -> Result<String, StorageError> {
        let members = self.members.lock();
        match members.first() {
            Some(primary) => primary.retrieve_history(query),
            None => Ok(String::new()),
        }
    }

    fn flush_and_sync(&self) -> Result<(), StorageError> {
        let members = self.members.lock();
        for member in members.iter() {
            if let Err(e) = member.flush_and_sync() {
                tracing::warn!("event log {} failed to sync: {}", member.name(), e);
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut members = self.members.lock();
        for member in members.drain(..) {
            if let Err(e) = member.flush_and_sync().and_then(|_| member.close()) {
                tracing::warn!("event log {} failed to close: {}", member.name(), e);
            }
        }
        Ok(())
    }
}
