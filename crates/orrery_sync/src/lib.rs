pub mod channel;
pub mod commit;
pub mod master;
pub mod runner;
pub mod scheduler;


pub use channel::{SyncChannelState, SyncFilter};
pub use commit::{CommitPipeline, CommitReceipt};
pub use master::{CommittedObject, FieldBook, FieldSet, NoopSyncMaster, SyncMaster};
pub use runner::{DispatchOutcome, QueueStatus, SyncRecord, SyncRunner, SyncedChange};
pub use scheduler::{DispatchTask, Scheduler, Task, TaskCompletion, TaskHandle, TaskState};
