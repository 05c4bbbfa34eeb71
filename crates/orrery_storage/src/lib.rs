pub mod audit;
pub mod dump;
pub mod event;
pub mod event_log;
pub mod journal;

#[cfg(test)]
mod tests;

pub use audit::{AuditLog, Mailer};
pub use dump::DumpWriter;
pub use event::{LogEvent, RecipientExpander};
pub use event_log::{EventLog, FileEventLog, HistoryQuery, TeeEventLog};
pub use journal::{Journal, JournalEntry};
