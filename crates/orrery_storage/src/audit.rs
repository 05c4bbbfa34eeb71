//! Audit front-end: writes events to the configured event log, mails the
//! ones that carry recipients, and brackets committed transactions with
//! start/finish markers so history queries can group them.
//!
//! Nothing here fails the caller. A broken sink or mailer is logged and
//! counted; the commit that produced the events has already happened.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use orrery_common::error::StorageError;
use orrery_common::types::{now_millis, Invid, TxnNumber};

use crate::event::{
    LogEvent, RecipientExpander, CLASS_FINISH_TRANSACTION, CLASS_START_TRANSACTION,
};
use crate::event_log::{EventLog, HistoryQuery};

/// Outbound mail transport.
pub trait Mailer: Send + Sync {
    fn send(&self, recipients: &str, subject: &str, body: &str) -> Result<(), String>;
}

pub struct AuditLog {
    sink: Arc<dyn EventLog>,
    mailer: Option<Arc<dyn Mailer>>,
    expander: Option<Arc<dyn RecipientExpander>>,
    total_events: AtomicU64,
    failed_writes: AtomicU64,
    mails_sent: AtomicU64,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn EventLog>) -> Self {
        Self {
            sink,
            mailer: None,
            expander: None,
            total_events: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            mails_sent: AtomicU64::new(0),
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_expander(mut self, expander: Arc<dyn RecipientExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn sink(&self) -> &Arc<dyn EventLog> {
        &self.sink
    }

    /// Record a standalone event.
    pub fn log_event(&self, mut event: LogEvent) {
        if let Some(expander) = &self.expander {
            event.augment(expander.as_ref());
        }
        self.write(&event);
        self.mail(&event);
    }

    /// Record the events of a committed transaction between start and
    /// finish markers. Every event is stamped with the transaction number
    /// and the commit time, so the log stays in time order.
    pub fn log_transaction(
        &self,
        txn: TxnNumber,
        admin: Option<Invid>,
        admin_name: &str,
        events: &[Arc<LogEvent>],
    ) {
        let stamp = now_millis();
        let touched: BTreeSet<Invid> = events.iter().flat_map(|e| e.objects.iter().copied()).collect();

        let start = LogEvent::new(
            CLASS_START_TRANSACTION,
            format!("Start of transaction {}", txn),
        )
        .by(admin, admin_name)
        .with_objects(touched.iter().copied().collect())
        .in_transaction(txn)
        .at(stamp);
        self.write(&start);

        for shared in events {
            let mut event = LogEvent::clone(shared);
            event.transaction_id = Some(txn);
            event.time_ms = stamp;
            if let Some(expander) = &self.expander {
                event.augment(expander.as_ref());
            }
            self.write(&event);
            self.mail(&event);
        }

        let finish = LogEvent::new(
            CLASS_FINISH_TRANSACTION,
            format!("End of transaction {}", txn),
        )
        .by(admin, admin_name)
        .with_objects(touched.into_iter().collect())
        .in_transaction(txn)
        .at(stamp);
        self.write(&finish);

        if let Err(e) = self.sink.flush_and_sync() {
            tracing::warn!("audit log sync failed after transaction {}: {}", txn, e);
        }
    }

    /// Convenience: session login.
    pub fn record_login(&self, admin: Invid, admin_name: &str) {
        self.log_event(
            LogEvent::new("normallogin", format!("{} logged in", admin_name))
                .by(Some(admin), admin_name)
                .with_objects(vec![admin]),
        );
    }

    /// Convenience: session logout. `clean` distinguishes a normal logout
    /// from a dropped session.
    pub fn record_logout(&self, admin: Invid, admin_name: &str, clean: bool) {
        let class = if clean { "normallogout" } else { "abnormallogout" };
        self.log_event(
            LogEvent::new(class, format!("{} logged out", admin_name))
                .by(Some(admin), admin_name)
                .with_objects(vec![admin]),
        );
    }

    pub fn retrieve_history(&self, query: &HistoryQuery) -> Result<String, StorageError> {
        self.sink.retrieve_history(query)
    }

    pub fn close(&self) {
        if let Err(e) = self.sink.close() {
            tracing::warn!("audit log close failed: {}", e);
        }
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    pub fn mails_sent(&self) -> u64 {
        self.mails_sent.load(Ordering::Relaxed)
    }

    fn write(&self, event: &LogEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.sink.write(event) {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "audit log {} failed to record {} event: {}",
                self.sink.name(),
                event.class_token,
                e
            );
        }
    }

    fn mail(&self, event: &LogEvent) {
        let Some(mailer) = &self.mailer else {
            return;
        };
        if event.notify_targets.is_empty() {
            return;
        }
        let subject = event.subject.as_deref().unwrap_or(&event.class_token);
        match mailer.send(&event.recipients(), subject, &event.description) {
            Ok(()) => {
                self.mails_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(
                "failed to mail {} event to {}: {}",
                event.class_token,
                event.recipients(),
                e
            ),
        }
    }
}
