use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use orrery_common::error::TxnError;
use orrery_common::types::{FieldImage, Invid, SessionId, TxnId};
use orrery_storage::event::LogEvent;

use crate::edit_set::{EditSet, EditedObject};
use crate::store::{DeleteLockManager, ObjectStatus};

/// State of one edited object at checkpoint time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSnapshot {
    pub invid: Invid,
    pub status: ObjectStatus,
    pub fields: FieldImage,
}

/// A savepoint inside a transaction. Immutable once captured; restoring
/// it does not consume or change it.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    name: String,
    txn: TxnId,
    objects: Vec<ObjectSnapshot>,
    delete_locks: BTreeSet<Invid>,
    log_events: Vec<Arc<LogEvent>>,
}

impl Checkpoint {
    /// Snapshot the pending events, every edited object and the session's
    /// deletion locks. Pure in-memory copy; never fails.
    pub fn capture(
        name: impl Into<String>,
        txn: TxnId,
        pending_events: &[Arc<LogEvent>],
        edited_objects: &[EditedObject],
        session: SessionId,
        locks: &dyn DeleteLockManager,
    ) -> Self {
        Self {
            name: name.into(),
            txn,
            objects: edited_objects
                .iter()
                .map(|o| ObjectSnapshot {
                    invid: o.invid,
                    status: o.status,
                    fields: o.fields.clone(),
                })
                .collect(),
            delete_locks: locks.session_locks(session),
            log_events: pending_events.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn objects(&self) -> &[ObjectSnapshot] {
        &self.objects
    }

    pub fn delete_locks(&self) -> &BTreeSet<Invid> {
        &self.delete_locks
    }

    pub fn log_events(&self) -> &[Arc<LogEvent>] {
        &self.log_events
    }

    /// Put `set` back into the captured state.
    ///
    /// Objects checked out after the checkpoint are released (new ones are
    /// discarded); captured objects get their fields and status back, which
    /// also un-deletes them. If a captured object is no longer held by the
    /// transaction the set is marked must-abort.
    pub(crate) fn restore(&self, set: &mut EditSet) -> Result<(), TxnError> {
        if self.txn != set.txn {
            return Err(TxnError::CheckpointMismatch {
                checkpoint: self.txn,
                txn: set.txn,
            });
        }

        for snapshot in &self.objects {
            let present = set.objects.iter().any(|o| o.invid == snapshot.invid);
            if !present || set.store.holder(snapshot.invid) != Some(set.txn) {
                tracing::error!(
                    "{}: object {} left transaction control before rollback to '{}'",
                    set.txn,
                    snapshot.invid,
                    self.name
                );
                set.must_abort = true;
                return Err(TxnError::ExternalModification {
                    txn: set.txn,
                    invid: snapshot.invid,
                });
            }
        }

        let captured: HashSet<Invid> = self.objects.iter().map(|s| s.invid).collect();
        let store = set.store.clone();
        let txn = set.txn;
        set.objects.retain(|o| {
            if captured.contains(&o.invid) {
                return true;
            }
            store.release(o.invid, txn);
            false
        });

        for snapshot in &self.objects {
            if let Some(object) = set.objects.iter_mut().find(|o| o.invid == snapshot.invid) {
                object.fields = snapshot.fields.clone();
                object.status = snapshot.status;
            }
        }

        set.locks.revert_session(set.session, &self.delete_locks);
        set.events = self.log_events.clone();

        tracing::debug!(
            "{}: rolled back to checkpoint '{}' ({} object(s), {} event(s))",
            set.txn,
            self.name,
            self.objects.len(),
            self.log_events.len()
        );
        Ok(())
    }
}
