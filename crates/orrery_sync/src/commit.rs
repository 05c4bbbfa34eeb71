//! Commit pipeline: journal, sync channel queues, object store, audit log
//! and dispatch scheduling, in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use orrery_common::config::SyncChannelMode;
use orrery_common::error::{OrreryError, OrreryResult, SyncError, TxnError};
use orrery_common::types::{Invid, SessionId, TxnId, TxnNumber};
use orrery_storage::event::{LogEvent, CLASS_JOURNAL_RESET};
use orrery_storage::journal::JournalEntry;
use orrery_storage::{AuditLog, Journal};
use orrery_txn::delta::ObjectDelta;
use orrery_txn::edit_set::EditSet;
use orrery_txn::store::{DeleteLockManager, ObjectStore};
use parking_lot::{Mutex, RwLock};

use crate::master::CommittedObject;
use crate::runner::SyncRunner;
use crate::scheduler::{DispatchTask, Scheduler, TaskHandle};

/// What a successful commit produced.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub transaction_number: TxnNumber,
    pub deltas: Vec<ObjectDelta>,
    /// Channels that queued a file for this transaction.
    pub channels_written: Vec<String>,
}

pub struct CommitPipeline {
    journal: Arc<Journal>,
    audit: Arc<AuditLog>,
    store: Arc<dyn ObjectStore>,
    locks: Arc<dyn DeleteLockManager>,
    runners: RwLock<Vec<Arc<SyncRunner>>>,
    scheduler: Arc<Scheduler>,
    /// Serializes commits so journal numbers and queue files stay in order.
    commit_lock: Mutex<()>,
    next_txn: AtomicU64,
}

impl CommitPipeline {
    pub fn new(
        journal: Arc<Journal>,
        audit: Arc<AuditLog>,
        store: Arc<dyn ObjectStore>,
        locks: Arc<dyn DeleteLockManager>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            journal,
            audit,
            store,
            locks,
            runners: RwLock::new(Vec::new()),
            scheduler,
            commit_lock: Mutex::new(()),
            next_txn: AtomicU64::new(1),
        }
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn add_runner(&self, runner: Arc<SyncRunner>) {
        tracing::info!("registered sync channel {}", runner.name());
        self.runners.write().push(runner);
    }

    pub fn remove_runner(&self, name: &str) -> Option<Arc<SyncRunner>> {
        let mut runners = self.runners.write();
        let idx = runners.iter().position(|r| r.name() == name)?;
        Some(runners.remove(idx))
    }

    pub fn runner(&self, name: &str) -> Result<Arc<SyncRunner>, SyncError> {
        self.runners
            .read()
            .iter()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownChannel(name.to_string()))
    }

    pub fn runners(&self) -> Vec<Arc<SyncRunner>> {
        self.runners.read().clone()
    }

    /// Open a new transaction for `session`.
    pub fn begin(
        &self,
        session: SessionId,
        admin: Option<Invid>,
        admin_name: impl Into<String>,
    ) -> EditSet {
        let txn = TxnId(self.next_txn.fetch_add(1, Ordering::SeqCst));
        EditSet::new(
            txn,
            session,
            admin,
            admin_name,
            self.store.clone(),
            self.locks.clone(),
        )
    }

    /// Commit `edit_set`. On error the edit set has been aborted and no
    /// trace of the transaction is left in the journal or channel queues.
    pub fn commit(&self, edit_set: EditSet) -> OrreryResult<CommitReceipt> {
        let started = Instant::now();
        if edit_set.must_abort() {
            let txn = edit_set.txn();
            edit_set.abort();
            orrery_observability::record_commit_failure("must_abort");
            return Err(TxnError::MustAbort(txn).into());
        }

        let deltas = match edit_set.deltas() {
            Ok(deltas) => deltas,
            Err(e) => {
                edit_set.abort();
                return Err(e.into());
            }
        };

        let (receipt, runners) = {
            let _commit = self.commit_lock.lock();

            let entry = match self.journal.write_transaction(edit_set.admin_name(), &deltas) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("{}: journal write failed: {}", edit_set.txn(), e);
                    edit_set.abort();
                    orrery_observability::record_commit_failure("journal");
                    return Err(e.into());
                }
            };
            let number = entry.transaction_number;
            let runners = self.runners();
            let objects = CommittedObject::collect(edit_set.objects(), &deltas);

            let mut written: Vec<&Arc<SyncRunner>> = Vec::new();
            for runner in &runners {
                let result = match runner.mode() {
                    SyncChannelMode::FullState => {
                        runner.check_build_needed(&objects);
                        Ok(false)
                    }
                    SyncChannelMode::Incremental | SyncChannelMode::Manual => runner
                        .write_incremental_sync(
                            number,
                            edit_set.admin_name(),
                            entry.timestamp_ms,
                            &objects,
                        ),
                };
                match result {
                    Ok(true) => written.push(runner),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            "transaction {}: sync channel {} failed to queue: {}",
                            number,
                            runner.name(),
                            e
                        );
                        self.back_out(&entry, &written);
                        drop(objects);
                        edit_set.abort();
                        orrery_observability::record_commit_failure("sync");
                        return Err(e.into());
                    }
                }
            }

            if let Err(e) = self.journal.finalize(&entry) {
                tracing::error!("transaction {}: journal finalize failed: {}", number, e);
                self.back_out(&entry, &written);
                drop(objects);
                edit_set.abort();
                orrery_observability::record_commit_failure("journal");
                return Err(e.into());
            }

            let channels_written: Vec<String> = written.iter().map(|r| r.name()).collect();
            drop(objects);

            let txn = edit_set.txn();
            let admin = edit_set.admin();
            let admin_name = edit_set.admin_name().to_string();
            let events = edit_set.events().to_vec();
            let object_count = edit_set.objects().len();
            edit_set.install();

            for runner in &runners {
                if let Err(e) = runner.confirm(number) {
                    tracing::error!("transaction {}: {}", number, e);
                }
            }

            self.audit.log_transaction(number, admin, &admin_name, &events);
            tracing::info!(
                "{} committed as transaction {} ({} object(s), {} delta(s))",
                txn,
                number,
                object_count,
                deltas.len()
            );
            orrery_observability::record_commit(object_count, started.elapsed().as_micros() as u64);
            orrery_observability::record_journal_transactions(self.journal.transactions_in_journal());

            (
                CommitReceipt {
                    transaction_number: number,
                    deltas,
                    channels_written,
                },
                runners,
            )
        };

        for runner in runners {
            if runner.is_active() && runner.mode() != SyncChannelMode::Manual {
                self.schedule_dispatch(runner);
            }
        }
        Ok(receipt)
    }

    fn back_out(&self, entry: &JournalEntry, written: &[&Arc<SyncRunner>]) {
        for runner in written {
            if let Err(e) = runner.unsync(entry.transaction_number) {
                tracing::error!(
                    "sync channel {} couldn't remove queue file for transaction {}: {}",
                    runner.name(),
                    entry.transaction_number,
                    e
                );
            }
        }
        if let Err(e) = self.journal.undo(entry) {
            tracing::error!(
                "couldn't undo journal entry for transaction {}: {}",
                entry.transaction_number,
                e
            );
        }
    }

    pub fn schedule_dispatch(&self, runner: Arc<SyncRunner>) -> TaskHandle {
        self.scheduler.run_now(Arc::new(DispatchTask::new(runner)))
    }

    /// Dispatch a channel by name, manual channels included.
    pub fn dispatch_now(&self, name: &str) -> Result<TaskHandle, SyncError> {
        let runner = self.runner(name)?;
        Ok(self.schedule_dispatch(runner))
    }

    /// Clean up after an unfinished transaction left in the journal by a
    /// crash: remove its queue files and cut it off the journal. Returns the
    /// number that was discarded.
    pub fn recover(&self) -> OrreryResult<Option<TxnNumber>> {
        let _commit = self.commit_lock.lock();
        let Some(entry) = self.journal.incomplete_transaction() else {
            return Ok(None);
        };
        tracing::warn!(
            "journal holds unfinished transaction {}, discarding it",
            entry.transaction_number
        );
        for runner in self.runners.read().iter() {
            runner.unsync(entry.transaction_number)?;
        }
        self.journal.clear_incomplete_transaction()?;
        Ok(Some(entry.transaction_number))
    }

    /// Start a fresh journal after the store has been dumped in full.
    pub fn reset_journal(&self) -> Result<(), OrreryError> {
        let _commit = self.commit_lock.lock();
        self.journal.reset()?;
        self.audit.log_event(LogEvent::new(
            CLASS_JOURNAL_RESET,
            format!(
                "Journal reset at transaction {}",
                self.journal.last_transaction_number()
            ),
        ));
        orrery_observability::record_journal_transactions(0);
        Ok(())
    }
}
