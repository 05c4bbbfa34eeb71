use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use orrery_common::config::JournalSyncMode;
use orrery_common::error::StorageError;
use orrery_common::types::{now_millis, TxnNumber};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Journal format version. Bump when `JournalRecord` changes incompatibly.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// Magic bytes at the start of every journal file.
pub const JOURNAL_MAGIC: &[u8; 4] = b"OJNL";

/// Header: magic (4) + format version (4) + base transaction number (8).
/// The base number lets numbering continue across a reset.
pub const JOURNAL_HEADER_SIZE: usize = 16;

/// Frame header: payload length (4) + crc32 (4).
const FRAME_HEADER_SIZE: u64 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalRecord {
    /// Transaction contents, written before sync channels are fed.
    Open {
        number: u64,
        timestamp_ms: i64,
        username: String,
        payload: Vec<u8>,
    },
    /// Written and synced once the transaction is durable.
    Finalize { number: u64, timestamp_ms: i64 },
}

/// One committed transaction, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub transaction_number: TxnNumber,
    pub timestamp_ms: i64,
    /// File offset of the entry's open record; `undo` truncates back to it.
    offset: u64,
}

impl JournalEntry {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Append-only record of committed transactions since the last full dump.
///
/// A commit writes an open record (`write_transaction`), feeds the sync
/// channels, then makes it durable (`finalize`). If anything in between
/// fails the open record is cut off again (`undo`). Only one transaction
/// may be open at a time; callers serialize commits.
pub struct Journal {
    inner: Mutex<JournalInner>,
    path: PathBuf,
    sync_mode: JournalSyncMode,
}

struct JournalInner {
    writer: BufWriter<File>,
    len: u64,
    last_number: TxnNumber,
    transactions_in_journal: u64,
    pending: Option<JournalEntry>,
    /// Open record found on load with no finalize behind it.
    incomplete: Option<JournalEntry>,
}

impl Journal {
    /// Open the journal at `path`, creating it if missing.
    pub fn open(path: &Path, sync_mode: JournalSyncMode) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let existing = match fs::read(path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let scan = match existing {
            Some(data) if !data.is_empty() => scan_journal(&data)?,
            _ => {
                write_fresh(path, TxnNumber(0))?;
                JournalScan::empty(TxnNumber(0))
            }
        };

        let file = OpenOptions::new().append(true).open(path)?;
        if file.metadata()?.len() > scan.valid_len {
            tracing::warn!(
                "journal {} has a damaged tail, truncating to {} bytes",
                path.display(),
                scan.valid_len
            );
            file.set_len(scan.valid_len)?;
        }

        if let Some(entry) = &scan.incomplete {
            tracing::warn!(
                "journal {} ends with unfinished transaction {}",
                path.display(),
                entry.transaction_number
            );
        }
        tracing::info!(
            "journal {} opened: {} transaction(s), last number {}",
            path.display(),
            scan.transactions,
            scan.last_number
        );

        Ok(Self {
            inner: Mutex::new(JournalInner {
                writer: BufWriter::new(file),
                len: scan.valid_len,
                last_number: scan.last_number,
                transactions_in_journal: scan.transactions,
                pending: None,
                incomplete: scan.incomplete,
            }),
            path: path.to_path_buf(),
            sync_mode,
        })
    }

    /// Write the open record for the next transaction and return its entry.
    /// Nothing is durable until `finalize`.
    pub fn write_transaction<T: Serialize>(
        &self,
        username: &str,
        payload: &T,
    ) -> Result<JournalEntry, StorageError> {
        let payload =
            bincode::serialize(payload).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut inner = self.inner.lock();
        let number = inner.last_number.next();
        self.open_inner(&mut inner, number, now_millis(), username, payload)
    }

    /// Make the open transaction durable.
    pub fn finalize(&self, entry: &JournalEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::check_pending(&inner, entry)?;
        let record = JournalRecord::Finalize {
            number: entry.transaction_number.0,
            timestamp_ms: entry.timestamp_ms,
        };
        Self::write_record(&mut inner, &record)?;
        self.sync_inner(&mut inner)?;

        inner.pending = None;
        inner.last_number = entry.transaction_number;
        inner.transactions_in_journal += 1;
        tracing::debug!("journal finalized transaction {}", entry.transaction_number);
        Ok(())
    }

    /// Discard the open transaction, cutting the file back to its offset.
    /// The number becomes available again.
    pub fn undo(&self, entry: &JournalEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::check_pending(&inner, entry)?;
        self.truncate_inner(&mut inner, entry.offset)?;
        inner.pending = None;
        tracing::warn!("journal undid transaction {}", entry.transaction_number);
        Ok(())
    }

    /// Record a committed transaction in one step. Numbers must be
    /// strictly increasing.
    pub fn append(
        &self,
        transaction_number: TxnNumber,
        timestamp_ms: i64,
    ) -> Result<JournalEntry, StorageError> {
        let mut inner = self.inner.lock();
        if transaction_number <= inner.last_number {
            return Err(StorageError::JournalOutOfOrder {
                last: inner.last_number,
                attempted: transaction_number,
            });
        }
        let entry =
            self.open_inner(&mut inner, transaction_number, timestamp_ms, "", Vec::new())?;
        let record = JournalRecord::Finalize {
            number: transaction_number.0,
            timestamp_ms,
        };
        if let Err(e) = Self::write_record(&mut inner, &record)
            .and_then(|_| self.sync_inner(&mut inner))
        {
            let e = self.back_out(&mut inner, entry.offset, e);
            inner.pending = None;
            return Err(e);
        }
        inner.pending = None;
        inner.last_number = transaction_number;
        inner.transactions_in_journal += 1;
        Ok(entry)
    }

    /// True when no transaction has been committed since the last reset.
    pub fn is_clean(&self) -> bool {
        self.inner.lock().transactions_in_journal == 0
    }

    pub fn transactions_in_journal(&self) -> u64 {
        self.inner.lock().transactions_in_journal
    }

    pub fn last_transaction_number(&self) -> TxnNumber {
        self.inner.lock().last_number
    }

    /// The unfinished transaction found at load time, if any. Its sync
    /// channel queue files may need removing before new commits.
    pub fn incomplete_transaction(&self) -> Option<JournalEntry> {
        self.inner.lock().incomplete
    }

    /// Cut the unfinished transaction found at load time off the journal.
    pub fn clear_incomplete_transaction(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.incomplete.take() {
            self.truncate_inner(&mut inner, entry.offset)?;
            tracing::info!(
                "journal cleared incomplete transaction {}",
                entry.transaction_number
            );
        }
        Ok(())
    }

    /// Start a fresh journal after a full dump. The old file is kept as
    /// `<name>.old`; numbering continues from the last committed number.
    pub fn reset(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pending.or(inner.incomplete) {
            return Err(StorageError::JournalTransactionPending(entry.transaction_number));
        }
        inner.writer.flush()?;

        let old_path = old_journal_path(&self.path);
        fs::rename(&self.path, &old_path)?;
        write_fresh(&self.path, inner.last_number)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        inner.writer = BufWriter::new(file);
        inner.len = JOURNAL_HEADER_SIZE as u64;
        inner.transactions_in_journal = 0;
        tracing::info!(
            "journal reset, previous journal kept at {}",
            old_path.display()
        );
        Ok(())
    }

    /// Finalized transactions currently in the journal, oldest first.
    pub fn entries(&self) -> Result<Vec<JournalEntry>, StorageError> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let data = fs::read(&self.path)?;
        Ok(scan_journal(&data)?.entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_inner(
        &self,
        inner: &mut JournalInner,
        number: TxnNumber,
        timestamp_ms: i64,
        username: &str,
        payload: Vec<u8>,
    ) -> Result<JournalEntry, StorageError> {
        if let Some(entry) = inner.pending.or(inner.incomplete) {
            return Err(StorageError::JournalTransactionPending(entry.transaction_number));
        }
        let entry = JournalEntry {
            transaction_number: number,
            timestamp_ms,
            offset: inner.len,
        };
        let record = JournalRecord::Open {
            number: number.0,
            timestamp_ms,
            username: username.to_string(),
            payload,
        };
        if let Err(e) = Self::write_record(inner, &record) {
            return Err(self.back_out(inner, entry.offset, e));
        }
        inner.pending = Some(entry);
        Ok(entry)
    }

    fn check_pending(inner: &JournalInner, entry: &JournalEntry) -> Result<(), StorageError> {
        match inner.pending {
            Some(p) if p == *entry => Ok(()),
            _ => Err(StorageError::UnknownJournalEntry(entry.transaction_number)),
        }
    }

    // Frame format: [len:4][crc32:4][bincode record]
    fn write_record(inner: &mut JournalInner, record: &JournalRecord) -> Result<(), StorageError> {
        let data =
            bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        inner.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.len += FRAME_HEADER_SIZE + data.len() as u64;
        Ok(())
    }

    fn sync_inner(&self, inner: &mut JournalInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        match self.sync_mode {
            JournalSyncMode::None => {}
            JournalSyncMode::FSync => inner.writer.get_ref().sync_all()?,
            JournalSyncMode::FDataSync => inner.writer.get_ref().sync_data()?,
        }
        Ok(())
    }

    /// Cut the journal back to `offset`. Buffered bytes past `offset` are
    /// discarded, never written; bytes before it reach the file first.
    fn truncate_inner(&self, inner: &mut JournalInner, offset: u64) -> Result<(), StorageError> {
        let on_disk = inner.writer.get_ref().metadata()?.len();
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut inner.writer, BufWriter::new(file));
        let (mut old_file, buffered) = old.into_parts();
        if offset > on_disk {
            let keep = (offset - on_disk) as usize;
            match buffered {
                Ok(buf) if buf.len() >= keep => old_file.write_all(&buf[..keep])?,
                _ => {
                    return Err(StorageError::JournalCorrupt(format!(
                        "cannot truncate to {}: only {} bytes recoverable",
                        offset, on_disk
                    )))
                }
            }
        }
        // append mode: later writes land at the new end
        inner.writer.get_ref().set_len(offset)?;
        inner.len = offset;
        Ok(())
    }

    /// Back out a partly written record, keeping the original error.
    fn back_out(&self, inner: &mut JournalInner, offset: u64, cause: StorageError) -> StorageError {
        if let Err(e) = self.truncate_inner(inner, offset) {
            tracing::error!(
                "journal {} could not be cut back to {} after write failure: {}",
                self.path.display(),
                offset,
                e
            );
        }
        cause
    }
}

fn old_journal_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    path.with_file_name(name)
}

fn write_fresh(path: &Path, base: TxnNumber) -> Result<(), StorageError> {
    let mut file = File::create(path)?;
    file.write_all(JOURNAL_MAGIC)?;
    file.write_all(&JOURNAL_FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&base.0.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

struct JournalScan {
    entries: Vec<JournalEntry>,
    transactions: u64,
    last_number: TxnNumber,
    incomplete: Option<JournalEntry>,
    valid_len: u64,
}

impl JournalScan {
    fn empty(base: TxnNumber) -> Self {
        Self {
            entries: Vec::new(),
            transactions: 0,
            last_number: base,
            incomplete: None,
            valid_len: JOURNAL_HEADER_SIZE as u64,
        }
    }
}

/// Parse a journal image. A torn or corrupt tail ends the scan with a
/// warning; a bad header is an error.
fn scan_journal(data: &[u8]) -> Result<JournalScan, StorageError> {
    if data.len() < JOURNAL_HEADER_SIZE || &data[0..4] != JOURNAL_MAGIC.as_slice() {
        return Err(StorageError::JournalCorrupt("missing journal header".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != JOURNAL_FORMAT_VERSION {
        return Err(StorageError::JournalVersion {
            found: version,
            expected: JOURNAL_FORMAT_VERSION,
        });
    }
    let mut base = [0u8; 8];
    base.copy_from_slice(&data[8..16]);
    let mut scan = JournalScan::empty(TxnNumber(u64::from_le_bytes(base)));

    let mut pos = JOURNAL_HEADER_SIZE;
    while pos + FRAME_HEADER_SIZE as usize <= data.len() {
        let frame_start = pos;
        let len =
            u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        pos += FRAME_HEADER_SIZE as usize;

        if pos + len > data.len() {
            tracing::warn!("journal truncated at position {}, stopping scan", frame_start);
            break;
        }
        let record_data = &data[pos..pos + len];
        if crc32fast::hash(record_data) != checksum {
            tracing::warn!("journal checksum mismatch at position {}, stopping scan", frame_start);
            break;
        }
        let record = match bincode::deserialize::<JournalRecord>(record_data) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("journal decode error at position {}: {}", frame_start, e);
                break;
            }
        };
        pos += len;

        match record {
            JournalRecord::Open {
                number,
                timestamp_ms,
                ..
            } => {
                if let Some(stale) = scan.incomplete {
                    tracing::warn!(
                        "journal transaction {} was never finalized, ignoring",
                        stale.transaction_number
                    );
                }
                scan.incomplete = Some(JournalEntry {
                    transaction_number: TxnNumber(number),
                    timestamp_ms,
                    offset: frame_start as u64,
                });
            }
            JournalRecord::Finalize { number, .. } => match scan.incomplete.take() {
                Some(open) if open.transaction_number.0 == number => {
                    scan.entries.push(open);
                    scan.transactions += 1;
                    scan.last_number = open.transaction_number;
                }
                other => {
                    tracing::warn!(
                        "journal finalize for {} without matching open record",
                        number
                    );
                    scan.incomplete = other;
                }
            },
        }
        scan.valid_len = pos as u64;
    }
    Ok(scan)
}
