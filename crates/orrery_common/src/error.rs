use thiserror::Error;

use crate::types::{FieldId, Invid, TxnId, TxnNumber};

/// Convenience alias for `Result<T, OrreryError>`.
pub type OrreryResult<T> = Result<T, OrreryError>;

/// Error classification for escalation decisions.
///
/// - `ContractViolation`: caller bug (cursor regression, checkpoint from another txn); fail loudly
/// - `ExternalResource`: missing program, broken sink, subprocess I/O; logged and recovered locally
/// - `Durability`: journal write failed; the commit must not be acknowledged
/// - `DataIntegrity`: unreadable or corrupt persisted data
/// - `Internal`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ContractViolation,
    ExternalResource,
    Durability,
    DataIntegrity,
    Internal,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum OrreryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Journal, event log and dump errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Journal out of order: transaction {attempted} is not after {last}")]
    JournalOutOfOrder { last: TxnNumber, attempted: TxnNumber },

    #[error("Journal has an unfinished transaction {0}")]
    JournalTransactionPending(TxnNumber),

    #[error("Journal entry {0} is not the pending transaction")]
    UnknownJournalEntry(TxnNumber),

    #[error("Journal corrupt: {0}")]
    JournalCorrupt(String),

    #[error("Journal format version {found} not supported (expected {expected})")]
    JournalVersion { found: u32, expected: u32 },

    #[error("Malformed log line: {0}")]
    MalformedEvent(String),

    #[error("Log sink {0} is closed")]
    SinkClosed(String),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Checkpoint belongs to {checkpoint}, not {txn}")]
    CheckpointMismatch { checkpoint: TxnId, txn: TxnId },

    #[error("Transaction {txn} lost control of object {invid}; transaction must abort")]
    ExternalModification { txn: TxnId, invid: Invid },

    #[error("Transaction {0} is marked must-abort")]
    MustAbort(TxnId),

    #[error("Object {invid} is checked out by {holder}")]
    ObjectBusy { invid: Invid, holder: TxnId },

    #[error("Object {0} not found")]
    ObjectNotFound(Invid),

    #[error("Object {0} is already deleted in this transaction")]
    ObjectDeleted(Invid),

    #[error("Field {field} delta is {actual}-mode; cannot record a {attempted} change")]
    DeltaModeMismatch {
        field: FieldId,
        actual: &'static str,
        attempted: &'static str,
    },

    #[error("Delta for {expected} applied to {actual}")]
    DeltaIdentityMismatch { expected: Invid, actual: Invid },
}

/// Sync channel errors.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Channel {channel}: cursor cannot move back from {current} to {attempted}")]
    CursorRegression {
        channel: String,
        current: TxnNumber,
        attempted: TxnNumber,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown sync channel: {0}")]
    UnknownChannel(String),

    #[error("Task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },
}

impl OrreryError {
    /// Classify this error for escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrreryError::Txn(TxnError::CheckpointMismatch { .. }) => ErrorKind::ContractViolation,
            OrreryError::Txn(TxnError::DeltaModeMismatch { .. }) => ErrorKind::ContractViolation,
            OrreryError::Txn(TxnError::DeltaIdentityMismatch { .. }) => {
                ErrorKind::ContractViolation
            }
            OrreryError::Txn(TxnError::MustAbort(_)) => ErrorKind::ContractViolation,
            OrreryError::Txn(TxnError::ObjectDeleted(_)) => ErrorKind::ContractViolation,
            OrreryError::Sync(SyncError::CursorRegression { .. }) => ErrorKind::ContractViolation,
            OrreryError::Storage(StorageError::JournalOutOfOrder { .. }) => {
                ErrorKind::ContractViolation
            }
            OrreryError::Storage(StorageError::JournalTransactionPending(_)) => {
                ErrorKind::ContractViolation
            }
            OrreryError::Storage(StorageError::UnknownJournalEntry(_)) => {
                ErrorKind::ContractViolation
            }
            OrreryError::Config(_) => ErrorKind::ContractViolation,

            OrreryError::Txn(TxnError::ExternalModification { .. }) => ErrorKind::Internal,
            OrreryError::Txn(TxnError::ObjectBusy { .. }) => ErrorKind::ExternalResource,
            OrreryError::Txn(TxnError::ObjectNotFound(_)) => ErrorKind::ExternalResource,
            OrreryError::Sync(SyncError::Io(_)) => ErrorKind::ExternalResource,
            OrreryError::Sync(SyncError::TaskFailed { .. }) => ErrorKind::ExternalResource,
            OrreryError::Sync(SyncError::UnknownChannel(_)) => ErrorKind::ExternalResource,
            OrreryError::Storage(StorageError::SinkClosed(_)) => ErrorKind::ExternalResource,

            OrreryError::Storage(StorageError::Io(_)) => ErrorKind::Durability,
            OrreryError::Storage(StorageError::Serialization(_)) => ErrorKind::Durability,
            OrreryError::Sync(SyncError::Serialization(_)) => ErrorKind::Durability,

            OrreryError::Storage(StorageError::JournalCorrupt(_)) => ErrorKind::DataIntegrity,
            OrreryError::Storage(StorageError::JournalVersion { .. }) => ErrorKind::DataIntegrity,
            OrreryError::Storage(StorageError::MalformedEvent(_)) => ErrorKind::DataIntegrity,

            OrreryError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the caller broke an API contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self.kind(), ErrorKind::ContractViolation)
    }

    /// Returns true if a commit failed to become durable.
    pub fn is_durability_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::Durability)
    }
}
