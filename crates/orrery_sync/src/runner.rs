//! `SyncRunner`: one sync channel. Writes per-transaction queue files (or
//! marks a full-state rebuild as needed) on commit, and runs the channel's
//! external program when dispatched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use orrery_common::cancel::CancelSignal;
use orrery_common::config::{FieldOption, SyncChannelConfig, SyncChannelMode};
use orrery_common::error::{StorageError, SyncError};
use orrery_common::types::{FieldId, FieldImage, Invid, TxnNumber};
use orrery_storage::event::{LogEvent, CLASS_EXTERNAL_ERROR};
use orrery_storage::{AuditLog, DumpWriter};
use orrery_txn::delta::FieldDelta;
use orrery_txn::store::{ObjectStatus, ObjectStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::channel::{SyncChannelState, SyncFilter};
use crate::master::{CommittedObject, FieldBook, FieldSet, NoopSyncMaster, SyncMaster};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of one `dispatch`. Skips and failures are values; nothing a
/// dispatch does is propagated as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ran { exit_code: i32 },
    SkippedInactive,
    SkippedNoProgram,
    SkippedMissingProgram,
    SkippedNothingToDo,
    Failed(String),
    Interrupted,
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Ran { exit_code: 0 } => "ran",
            DispatchOutcome::Ran { .. } => "ran_nonzero",
            DispatchOutcome::SkippedInactive => "skipped_inactive",
            DispatchOutcome::SkippedNoProgram => "skipped_no_program",
            DispatchOutcome::SkippedMissingProgram => "skipped_missing_program",
            DispatchOutcome::SkippedNothingToDo => "skipped_nothing_to_do",
            DispatchOutcome::Failed(_) => "failed",
            DispatchOutcome::Interrupted => "interrupted",
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::SkippedInactive
                | DispatchOutcome::SkippedNoProgram
                | DispatchOutcome::SkippedMissingProgram
                | DispatchOutcome::SkippedNothingToDo
        )
    }
}

/// Queue health as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Empty,
    NonEmpty(usize),
    /// The program ran but left more files behind than arrived meanwhile.
    Stuck(usize),
}

/// Contents of one incremental queue file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub transaction_number: TxnNumber,
    pub channel: String,
    pub user: String,
    pub time_ms: i64,
    pub objects: Vec<SyncedObject>,
    /// Unchanged objects pulled in by augmentation.
    pub context_objects: Vec<ContextObject>,
}

impl SyncRecord {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.context_objects.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedObject {
    pub invid: Invid,
    pub change: SyncedChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncedChange {
    Created {
        after: FieldImage,
    },
    Deleted {
        before: FieldImage,
    },
    Edited {
        changes: Vec<FieldDelta>,
        /// Current values of unchanged fields the channel asked for.
        context: FieldImage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextObject {
    pub invid: Invid,
    pub fields: FieldImage,
}

struct RunnerSettings {
    mode: SyncChannelMode,
    full_state_file: PathBuf,
    filter: SyncFilter,
}

impl RunnerSettings {
    fn from_config(config: &SyncChannelConfig) -> Self {
        Self {
            mode: config.mode,
            full_state_file: PathBuf::from(&config.full_state_file),
            filter: SyncFilter::from_config(config),
        }
    }
}

pub struct SyncRunner {
    state: Mutex<SyncChannelState>,
    settings: RwLock<RunnerSettings>,
    master: RwLock<Arc<dyn SyncMaster>>,
    store: Arc<dyn ObjectStore>,
    audit: Option<Arc<AuditLog>>,
    active: AtomicBool,
    need_build: AtomicBool,
    /// Queue files written since the last dispatch started.
    queue_growth: AtomicUsize,
    queue_status: Mutex<QueueStatus>,
    poll_interval: Duration,
}

impl SyncRunner {
    pub fn new(
        channel_id: u32,
        config: &SyncChannelConfig,
        last_processed: TxnNumber,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            state: Mutex::new(SyncChannelState::new(channel_id, config, last_processed)),
            settings: RwLock::new(RunnerSettings::from_config(config)),
            master: RwLock::new(Arc::new(NoopSyncMaster)),
            store,
            audit: None,
            active: AtomicBool::new(config.active),
            need_build: AtomicBool::new(false),
            queue_growth: AtomicUsize::new(0),
            queue_status: Mutex::new(QueueStatus::Empty),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_master(self, master: Arc<dyn SyncMaster>) -> Self {
        *self.master.write() = master;
        self
    }

    /// Nonzero exits of the external program are recorded here.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// How often a running program is checked for exit and cancellation.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn set_master(&self, master: Arc<dyn SyncMaster>) {
        *self.master.write() = master;
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn channel_id(&self) -> u32 {
        self.state.lock().channel_id
    }

    pub fn mode(&self) -> SyncChannelMode {
        self.settings.read().mode
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// An inactive channel neither queues nor dispatches.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        tracing::info!(
            "sync channel {} {}",
            self.name(),
            if active { "activated" } else { "deactivated" }
        );
    }

    pub fn needs_build(&self) -> bool {
        self.need_build.load(Ordering::SeqCst)
    }

    pub fn queue_status(&self) -> QueueStatus {
        *self.queue_status.lock()
    }

    /// Refresh settings from a changed channel definition. The cursor
    /// stays where it is.
    pub fn update_config(&self, config: &SyncChannelConfig) {
        self.state.lock().update_config(config);
        *self.settings.write() = RunnerSettings::from_config(config);
        self.active.store(config.active, Ordering::SeqCst);
        tracing::debug!("sync channel {} reconfigured", config.name);
    }

    // ── cursor ──

    pub fn last_processed(&self) -> TxnNumber {
        self.state.lock().last_processed()
    }

    pub fn set_last_processed(&self, number: TxnNumber) -> Result<(), SyncError> {
        self.state.lock().set_last_processed(number)
    }

    /// Advance the cursor once `number` is durable in the journal.
    pub fn confirm(&self, number: TxnNumber) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        state.set_last_processed(number)?;
        tracing::debug!("sync channel {} confirmed transaction {}", state.name, number);
        Ok(())
    }

    // ── commit side ──

    /// Fields each committed object contributes, after filtering and
    /// augmentation.
    pub fn build_field_book(&self, objects: &[CommittedObject<'_>]) -> FieldBook {
        let settings = self.settings.read();
        let master = self.master.read().clone();
        let mut book = FieldBook::new();

        for object in objects {
            let type_id = object.invid.type_id;
            if settings.filter.includes_type(type_id) {
                let wanted = |f: FieldId| settings.filter.field_option(type_id, f) != FieldOption::Never;
                match object.status {
                    ObjectStatus::Creating => {
                        for field in object.image.field_ids().filter(|f| wanted(*f)) {
                            book.add(object.invid, field);
                        }
                    }
                    ObjectStatus::Deleting => {
                        book.touch(object.invid);
                        if let Some(original) = object.original {
                            for field in original.field_ids().filter(|f| wanted(*f)) {
                                book.add(object.invid, field);
                            }
                        }
                    }
                    ObjectStatus::Editing => {
                        if let Some(delta) = object.delta {
                            for field in delta.changed_fields().filter(|f| wanted(*f)) {
                                book.add(object.invid, field);
                            }
                        }
                    }
                    ObjectStatus::Dropping => {}
                }
            }
            book.merge(master.augment(object));
        }
        book
    }

    /// Assemble the queue record of one transaction.
    pub fn build_record(
        &self,
        number: TxnNumber,
        user: &str,
        time_ms: i64,
        objects: &[CommittedObject<'_>],
    ) -> SyncRecord {
        let book = self.build_field_book(objects);
        let settings = self.settings.read();
        let filter = &settings.filter;

        let mut synced = Vec::new();
        for object in objects {
            let Some(fields) = book.get(object.invid) else {
                continue;
            };
            let type_id = object.invid.type_id;
            let keep = |f: FieldId| {
                fields.contains(f) || filter.field_option(type_id, f) == FieldOption::Always
            };
            let change = match object.status {
                ObjectStatus::Creating => SyncedChange::Created {
                    after: restrict(object.image, keep),
                },
                ObjectStatus::Deleting => SyncedChange::Deleted {
                    before: object.original.map(|img| restrict(img, keep)).unwrap_or_default(),
                },
                ObjectStatus::Editing => {
                    let changes: Vec<FieldDelta> = object
                        .delta
                        .map(|d| d.fields().filter(|r| fields.contains(r.field_id())).cloned().collect())
                        .unwrap_or_default();
                    let context = restrict(object.image, |f| {
                        keep(f) && !changes.iter().any(|r| r.field_id() == f)
                    });
                    if changes.is_empty() && context.is_empty() {
                        continue;
                    }
                    SyncedChange::Edited { changes, context }
                }
                ObjectStatus::Dropping => continue,
            };
            synced.push(SyncedObject {
                invid: object.invid,
                change,
            });
        }

        let mut context_objects = Vec::new();
        for (invid, fields) in book.iter() {
            if objects.iter().any(|o| o.invid == *invid) {
                continue;
            }
            match self.store.get(*invid) {
                Some(image) => context_objects.push(ContextObject {
                    invid: *invid,
                    fields: restrict(&image, |f| fields.contains(f)),
                }),
                None => tracing::debug!("augmented object {} no longer exists, skipping", invid),
            }
        }

        SyncRecord {
            transaction_number: number,
            channel: self.name(),
            user: user.to_string(),
            time_ms,
            objects: synced,
            context_objects,
        }
    }

    /// Write the queue file `<dir>/<number>` for a committed transaction.
    /// Returns false if the channel is inactive or nothing in the
    /// transaction concerns it.
    pub fn write_incremental_sync(
        &self,
        number: TxnNumber,
        user: &str,
        time_ms: i64,
        objects: &[CommittedObject<'_>],
    ) -> Result<bool, SyncError> {
        if !self.is_active() {
            return Ok(false);
        }
        let record = self.build_record(number, user, time_ms, objects);
        if record.is_empty() {
            return Ok(false);
        }

        let dir = self.state.lock().output_directory.clone();
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(&record)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        let tmp = dir.join(format!(".{}.tmp", number));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, queue_file(&dir, number))?;

        self.need_build.store(true, Ordering::SeqCst);
        self.queue_growth.fetch_add(1, Ordering::SeqCst);
        self.refresh_queue_status(false);
        tracing::debug!(
            "sync channel {} queued transaction {} ({} object(s), {} context)",
            record.channel,
            number,
            record.objects.len(),
            record.context_objects.len()
        );
        Ok(true)
    }

    /// Full-state channels: flag a rebuild if the transaction touched
    /// anything the channel replicates.
    pub fn check_build_needed(&self, objects: &[CommittedObject<'_>]) -> bool {
        if !self.is_active() {
            return false;
        }
        let settings = self.settings.read();
        let relevant = objects.iter().any(|o| match o.delta {
            Some(delta) => settings.filter.object_relevant(delta),
            None => o.is_deleted() && settings.filter.includes_type(o.invid.type_id),
        });
        if relevant {
            self.need_build.store(true, Ordering::SeqCst);
        }
        relevant
    }

    /// Remove the queue file of a transaction that failed to commit.
    pub fn unsync(&self, number: TxnNumber) -> Result<(), SyncError> {
        let (name, dir) = {
            let state = self.state.lock();
            (state.name.clone(), state.output_directory.clone())
        };
        let path = queue_file(&dir, number);
        if path.exists() {
            tracing::info!(
                "sync channel {} deleting left over transaction fragment {}",
                name,
                path.display()
            );
            fs::remove_file(&path)?;
            let _ = self
                .queue_growth
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        Ok(())
    }

    /// Transactions waiting in the queue directory.
    pub fn queue_size(&self) -> usize {
        if self.mode() == SyncChannelMode::FullState {
            return 0;
        }
        let dir = self.state.lock().output_directory.clone();
        match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.parse::<u64>().is_ok())
                })
                .count(),
            Err(_) => 0,
        }
    }

    fn refresh_queue_status(&self, just_ran: bool) {
        let size = self.queue_size();
        let growth = self.queue_growth.load(Ordering::SeqCst);
        let mut status = self.queue_status.lock();
        *status = if size == 0 {
            QueueStatus::Empty
        } else if just_ran {
            if size <= growth {
                QueueStatus::NonEmpty(size)
            } else {
                self.need_build.store(true, Ordering::SeqCst);
                QueueStatus::Stuck(size)
            }
        } else if matches!(*status, QueueStatus::Stuck(_)) {
            QueueStatus::Stuck(size)
        } else {
            QueueStatus::NonEmpty(size)
        };
        drop(status);
        orrery_observability::record_sync_queue(&self.name(), size);
    }

    // ── dispatch ──

    /// Run the external program once if there is anything to process.
    ///
    /// Blocks for as long as the program runs; no journal or log lock is
    /// held meanwhile. Cancelling `cancel` kills the program. The cursor is
    /// never moved here.
    pub fn dispatch(&self, cancel: &CancelSignal) -> DispatchOutcome {
        let started = Instant::now();
        let name = self.name();
        let outcome = self.dispatch_inner(&name, cancel);
        orrery_observability::record_dispatch(
            &name,
            outcome.label(),
            started.elapsed().as_micros() as u64,
        );
        outcome
    }

    fn dispatch_inner(&self, name: &str, cancel: &CancelSignal) -> DispatchOutcome {
        if !self.is_active() {
            return DispatchOutcome::SkippedInactive;
        }
        let (program, cursor) = {
            let state = self.state.lock();
            (state.service_program.clone(), state.last_processed())
        };
        let (mode, full_state_file, filter) = {
            let settings = self.settings.read();
            (
                settings.mode,
                settings.full_state_file.clone(),
                settings.filter.clone(),
            )
        };

        let pending = match mode {
            SyncChannelMode::FullState => self.needs_build(),
            SyncChannelMode::Incremental | SyncChannelMode::Manual => {
                self.needs_build() || self.queue_size() > 0
            }
        };
        if !pending {
            tracing::debug!("sync channel {} has nothing to process", name);
            return DispatchOutcome::SkippedNothingToDo;
        }
        if program.as_os_str().is_empty() {
            tracing::warn!("no external service program defined for sync channel {}", name);
            return DispatchOutcome::SkippedNoProgram;
        }
        if !program.exists() {
            tracing::warn!(
                "\"{}\" doesn't exist, not running external service program for sync channel {}",
                program.display(),
                name
            );
            self.report_external_error(name, &program, None);
            return DispatchOutcome::SkippedMissingProgram;
        }

        self.need_build.store(false, Ordering::SeqCst);
        self.queue_growth.store(0, Ordering::SeqCst);

        let arg = match mode {
            SyncChannelMode::FullState => match self.write_full_state(&full_state_file, &filter) {
                Ok(rows) => {
                    tracing::debug!(
                        "sync channel {} wrote {} row(s) to {}",
                        name,
                        rows,
                        full_state_file.display()
                    );
                    full_state_file.display().to_string()
                }
                Err(e) => {
                    tracing::warn!("sync channel {} couldn't write full state: {}", name, e);
                    self.need_build.store(true, Ordering::SeqCst);
                    return DispatchOutcome::Failed(e.to_string());
                }
            },
            SyncChannelMode::Incremental | SyncChannelMode::Manual => cursor.to_string(),
        };

        tracing::info!("sync channel {} running {} {}", name, program.display(), arg);
        let outcome = run_program(&program, &arg, cancel, self.poll_interval);
        match &outcome {
            DispatchOutcome::Ran { exit_code: 0 } => {
                tracing::info!("sync channel {} finished", name);
            }
            DispatchOutcome::Ran { exit_code } => {
                self.report_external_error(name, &program, Some(*exit_code));
            }
            DispatchOutcome::Failed(reason) => {
                tracing::warn!("sync channel {}: {}", name, reason);
                self.need_build.store(true, Ordering::SeqCst);
            }
            DispatchOutcome::Interrupted => {
                tracing::warn!(
                    "sync channel {}: {} interrupted, will retry on next trigger",
                    name,
                    program.display()
                );
                self.need_build.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        if mode != SyncChannelMode::FullState {
            self.refresh_queue_status(true);
        }
        outcome
    }

    fn write_full_state(&self, path: &Path, filter: &SyncFilter) -> Result<usize, StorageError> {
        let mut dump = DumpWriter::with_header(&["invid", "field", "value"]);
        for (invid, image) in self.store.snapshot() {
            if !filter.includes_type(invid.type_id) {
                continue;
            }
            let key = invid.to_string();
            for (field, value) in image.iter() {
                if filter.field_option(invid.type_id, *field) == FieldOption::Never {
                    continue;
                }
                dump.write_row(&key, &[field.to_string(), value.to_string()]);
            }
        }
        dump.write_to(path)?;
        Ok(dump.rows_written())
    }

    fn report_external_error(&self, name: &str, program: &Path, exit_code: Option<i32>) {
        let message = match exit_code {
            Some(code) => format!(
                "Error encountered running sync script \"{}\" for the \"{}\" sync channel. \
                 It exited with result code {}.",
                program.display(),
                name,
                code
            ),
            None => format!(
                "Sync script \"{}\" for the \"{}\" sync channel does not exist.",
                program.display(),
                name
            ),
        };
        tracing::warn!("{}", message);
        if let Some(audit) = &self.audit {
            audit.log_event(LogEvent::new(CLASS_EXTERNAL_ERROR, message));
        }
    }
}

impl std::fmt::Debug for SyncRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRunner")
            .field("state", &*self.state.lock())
            .field("mode", &self.mode())
            .field("active", &self.is_active())
            .field("need_build", &self.needs_build())
            .finish()
    }
}

fn queue_file(dir: &Path, number: TxnNumber) -> PathBuf {
    dir.join(number.to_string())
}

fn restrict(image: &FieldImage, keep: impl Fn(FieldId) -> bool) -> FieldImage {
    image
        .iter()
        .filter(|(f, _)| keep(**f))
        .map(|(f, v)| (*f, v.clone()))
        .collect()
}

/// Run `program arg` with null stdin until it exits or `cancel` fires.
fn run_program(
    program: &Path,
    arg: &str,
    cancel: &CancelSignal,
    poll: Duration,
) -> DispatchOutcome {
    let mut child = match Command::new(program).arg(arg).stdin(Stdio::null()).spawn() {
        Ok(child) => child,
        Err(e) => {
            return DispatchOutcome::Failed(format!("couldn't exec {}: {}", program.display(), e))
        }
    };
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return DispatchOutcome::Ran {
                    exit_code: status.code().unwrap_or(-1),
                }
            }
            Ok(None) => {
                if cancel.wait_timeout(poll) {
                    let _ = child.kill();
                    let _ = child.wait();
                    return DispatchOutcome::Interrupted;
                }
            }
            Err(e) => {
                let _ = child.kill();
                return DispatchOutcome::Failed(format!(
                    "failure waiting on {}: {}",
                    program.display(),
                    e
                ));
            }
        }
    }
}
