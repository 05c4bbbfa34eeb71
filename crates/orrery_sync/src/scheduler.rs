//! Background task runner. Each `run_now` either starts the task on its own
//! worker thread or, if it is already running, queues exactly one rerun.
//! Completion is reported on a per-run channel.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use orrery_common::cancel::CancelSignal;
use orrery_common::error::{OrreryError, SyncError};
use parking_lot::Mutex;

use crate::runner::{DispatchOutcome, SyncRunner};

pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, cancel: &CancelSignal) -> Result<(), OrreryError>;

    /// Silent tasks log routine start/finish at debug level only.
    fn is_silent(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => write!(f, "IDLE"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletion {
    Completed,
    Failed(String),
    Panicked(String),
    Cancelled,
}

/// Receives the completion of the run a `run_now` call was attached to.
#[derive(Debug)]
pub struct TaskHandle {
    rx: mpsc::Receiver<TaskCompletion>,
}

impl TaskHandle {
    fn ready(completion: TaskCompletion) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(completion);
        Self { rx }
    }

    pub fn wait(self) -> TaskCompletion {
        self.rx.recv().unwrap_or(TaskCompletion::Cancelled)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskCompletion> {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(TaskCompletion::Cancelled),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub name: String,
    pub state: TaskState,
    pub runs: u64,
    pub last_error: Option<String>,
}

struct TaskSlot {
    state: TaskState,
    running: bool,
    rerun: bool,
    cancel: CancelSignal,
    current_waiters: Vec<mpsc::Sender<TaskCompletion>>,
    next_waiters: Vec<mpsc::Sender<TaskCompletion>>,
    runs: u64,
    last_error: Option<String>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            state: TaskState::Idle,
            running: false,
            rerun: false,
            cancel: CancelSignal::new(),
            current_waiters: Vec::new(),
            next_waiters: Vec::new(),
            runs: 0,
            last_error: None,
        }
    }
}

#[derive(Default)]
struct SchedulerInner {
    slots: HashMap<String, TaskSlot>,
    shutting_down: bool,
}

pub struct Scheduler {
    inner: Arc<Mutex<SchedulerInner>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner::default())),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` now, or once more after its current run.
    pub fn run_now(&self, task: Arc<dyn Task>) -> TaskHandle {
        let (tx, rx) = mpsc::channel();
        let name = task.name().to_string();
        let cancel = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return TaskHandle::ready(TaskCompletion::Cancelled);
            }
            let slot = inner.slots.entry(name.clone()).or_insert_with(TaskSlot::new);
            if slot.running {
                slot.rerun = true;
                slot.next_waiters.push(tx);
                tracing::debug!("task {} already running, rerun queued", name);
                return TaskHandle { rx };
            }
            slot.running = true;
            slot.state = TaskState::Running;
            slot.cancel = CancelSignal::new();
            slot.current_waiters.push(tx);
            slot.cancel.clone()
        };

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("orrery-task-{}", name))
            .spawn(move || worker_loop(inner, task, cancel));

        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock();
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
            }
            Err(e) => {
                tracing::error!("couldn't spawn worker for task {}: {}", name, e);
                let mut inner = self.inner.lock();
                if let Some(slot) = inner.slots.get_mut(&name) {
                    let completion = TaskCompletion::Failed(e.to_string());
                    slot.running = false;
                    slot.rerun = false;
                    slot.state = TaskState::Failed;
                    slot.last_error = Some(e.to_string());
                    for waiter in slot.current_waiters.drain(..).chain(slot.next_waiters.drain(..)) {
                        let _ = waiter.send(completion.clone());
                    }
                }
            }
        }
        TaskHandle { rx }
    }

    /// Interrupt the current run of `name` and drop any queued rerun.
    pub fn cancel(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(name) {
            Some(slot) if slot.running => {
                slot.rerun = false;
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let inner = self.inner.lock();
        let mut out: Vec<TaskStatus> = inner
            .slots
            .iter()
            .map(|(name, slot)| TaskStatus {
                name: name.clone(),
                state: slot.state,
                runs: slot.runs,
                last_error: slot.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Cancel every running task, refuse new ones and wait for the
    /// workers to exit.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            for slot in inner.slots.values_mut() {
                slot.rerun = false;
                slot.cancel.cancel();
            }
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        tracing::info!("scheduler shut down");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(inner: Arc<Mutex<SchedulerInner>>, task: Arc<dyn Task>, mut cancel: CancelSignal) {
    let name = task.name().to_string();
    loop {
        if task.is_silent() {
            tracing::debug!("task {} started", name);
        } else {
            tracing::info!("task {} started", name);
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(&cancel)));
        let completion = match result {
            Ok(Ok(())) if cancel.is_cancelled() => TaskCompletion::Cancelled,
            Ok(Ok(())) => TaskCompletion::Completed,
            Ok(Err(e)) => TaskCompletion::Failed(e.to_string()),
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "<non-string panic payload>".to_string()
                };
                TaskCompletion::Panicked(message)
            }
        };

        match &completion {
            TaskCompletion::Completed if task.is_silent() => {
                tracing::debug!("task {} completed", name)
            }
            TaskCompletion::Completed => tracing::info!("task {} completed", name),
            TaskCompletion::Cancelled => tracing::info!("task {} cancelled", name),
            TaskCompletion::Failed(reason) => tracing::warn!("task {} failed: {}", name, reason),
            TaskCompletion::Panicked(message) => {
                tracing::error!("task {} panicked: {}", name, message)
            }
        }

        let mut guard = inner.lock();
        let shutting_down = guard.shutting_down;
        let Some(slot) = guard.slots.get_mut(&name) else {
            return;
        };
        slot.runs += 1;
        match &completion {
            TaskCompletion::Completed | TaskCompletion::Cancelled => {
                slot.state = TaskState::Idle;
            }
            TaskCompletion::Failed(reason) | TaskCompletion::Panicked(reason) => {
                slot.state = TaskState::Failed;
                slot.last_error = Some(reason.clone());
            }
        }
        for waiter in slot.current_waiters.drain(..) {
            let _ = waiter.send(completion.clone());
        }

        if slot.rerun && !shutting_down {
            slot.rerun = false;
            slot.current_waiters = std::mem::take(&mut slot.next_waiters);
            slot.state = TaskState::Running;
            slot.cancel = CancelSignal::new();
            cancel = slot.cancel.clone();
            continue;
        }

        for waiter in slot.next_waiters.drain(..) {
            let _ = waiter.send(TaskCompletion::Cancelled);
        }
        slot.rerun = false;
        slot.running = false;
        return;
    }
}

/// Scheduled dispatch of one sync channel.
pub struct DispatchTask {
    name: String,
    runner: Arc<SyncRunner>,
}

impl DispatchTask {
    pub fn new(runner: Arc<SyncRunner>) -> Self {
        Self {
            name: format!("sync:{}", runner.name()),
            runner,
        }
    }
}

impl Task for DispatchTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, cancel: &CancelSignal) -> Result<(), OrreryError> {
        match self.runner.dispatch(cancel) {
            DispatchOutcome::Failed(reason) => Err(SyncError::TaskFailed {
                task: self.name.clone(),
                reason,
            }
            .into()),
            _ => Ok(()),
        }
    }

    fn is_silent(&self) -> bool {
        true
    }
}
