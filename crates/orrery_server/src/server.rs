//! Wiring of the transaction core: journal, audit log, object store, sync
//! channels, scheduler and commit pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use orrery_common::config::{OrreryConfig, SyncChannelMode};
use orrery_storage::{AuditLog, EventLog, FileEventLog, Journal, TeeEventLog};
use orrery_sync::{CommitPipeline, Scheduler, SyncRunner};
use orrery_txn::{MemoryObjectStore, SessionDeleteLocks};

pub struct Server {
    journal: Arc<Journal>,
    audit: Arc<AuditLog>,
    store: Arc<MemoryObjectStore>,
    scheduler: Arc<Scheduler>,
    pipeline: Arc<CommitPipeline>,
}

/// Paths in the config are relative to the data directory unless absolute.
fn resolve(data_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

impl Server {
    pub fn open(config: &OrreryConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.server.data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let journal_path = resolve(&data_dir, &config.journal.file);
        let journal = Arc::new(
            Journal::open(&journal_path, config.journal.sync_mode)
                .with_context(|| format!("opening journal {}", journal_path.display()))?,
        );
        tracing::info!(
            "journal {} at transaction {} ({} since last dump)",
            journal_path.display(),
            journal.last_transaction_number(),
            journal.transactions_in_journal()
        );

        let mut sinks: Vec<Arc<dyn EventLog>> = Vec::new();
        for sink in &config.log.sinks {
            let path = resolve(&data_dir, &sink.path);
            let log = FileEventLog::open(&path)
                .with_context(|| format!("opening event log {}", path.display()))?;
            sinks.push(Arc::new(log));
        }
        let audit = Arc::new(AuditLog::new(Arc::new(TeeEventLog::new(sinks))));

        let store = Arc::new(MemoryObjectStore::new());
        let scheduler = Arc::new(Scheduler::new());
        let pipeline = Arc::new(CommitPipeline::new(
            journal.clone(),
            audit.clone(),
            store.clone(),
            Arc::new(SessionDeleteLocks::new()),
            scheduler.clone(),
        ));

        let poll = Duration::from_millis(config.scheduler.dispatch_poll_interval_ms);
        let cursor = journal.last_transaction_number();
        for (idx, channel) in config.sync.iter().enumerate() {
            let mut channel = channel.clone();
            channel.directory = resolve(&data_dir, &channel.directory).display().to_string();
            if !channel.full_state_file.is_empty() {
                channel.full_state_file =
                    resolve(&data_dir, &channel.full_state_file).display().to_string();
            }
            let runner = SyncRunner::new(idx as u32 + 1, &channel, cursor, store.clone())
                .with_audit(audit.clone())
                .with_poll_interval(poll);
            pipeline.add_runner(Arc::new(runner));
        }

        if let Some(number) = pipeline.recover()? {
            tracing::warn!("discarded unfinished transaction {} left by a crash", number);
        }
        orrery_observability::record_journal_transactions(journal.transactions_in_journal());

        Ok(Self {
            journal,
            audit,
            store,
            scheduler,
            pipeline,
        })
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn store(&self) -> &Arc<MemoryObjectStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<CommitPipeline> {
        &self.pipeline
    }

    /// Kick every automatic channel once so work queued before a restart
    /// gets processed.
    pub fn start_dispatch(&self) {
        for runner in self.pipeline.runners() {
            if runner.is_active() && runner.mode() != SyncChannelMode::Manual {
                self.pipeline.schedule_dispatch(runner);
            }
        }
    }

    /// Stop running sync programs and close the event logs.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        for task in self.scheduler.snapshot() {
            tracing::debug!("task {}: {} after {} run(s)", task.name, task.state, task.runs);
        }
        orrery_observability::record_audit_counters(
            self.audit.total_events(),
            self.audit.failed_writes(),
            self.audit.mails_sent(),
        );
        self.audit.close();
        tracing::info!(
            "shut down at transaction {}",
            self.journal.last_transaction_number()
        );
    }
}
