//! Working state of one transaction: the objects it has checked out, the
//! log events it will emit on commit and its stack of checkpoints.

use std::collections::BTreeSet;
use std::sync::Arc;

use orrery_common::error::TxnError;
use orrery_common::types::{FieldId, FieldImage, FieldValue, Invid, SessionId, TxnId, VectorValue};
use orrery_storage::event::LogEvent;

use crate::checkpoint::Checkpoint;
use crate::delta::{DeltaBook, ObjectDelta};
use crate::store::{DeleteLockManager, ObjectStatus, ObjectStore};

/// One object checked out by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedObject {
    pub invid: Invid,
    pub status: ObjectStatus,
    /// Committed image at check-out time; `None` for new objects.
    pub original: Option<FieldImage>,
    pub fields: FieldImage,
}

pub struct EditSet {
    pub(crate) txn: TxnId,
    pub(crate) session: SessionId,
    admin: Option<Invid>,
    admin_name: String,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) locks: Arc<dyn DeleteLockManager>,
    pub(crate) objects: Vec<EditedObject>,
    pub(crate) events: Vec<Arc<LogEvent>>,
    checkpoints: Vec<Checkpoint>,
    base_locks: BTreeSet<Invid>,
    pub(crate) must_abort: bool,
    finished: bool,
}

impl EditSet {
    pub fn new(
        txn: TxnId,
        session: SessionId,
        admin: Option<Invid>,
        admin_name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        locks: Arc<dyn DeleteLockManager>,
    ) -> Self {
        let base_locks = locks.session_locks(session);
        Self {
            txn,
            session,
            admin,
            admin_name: admin_name.into(),
            store,
            locks,
            objects: Vec::new(),
            events: Vec::new(),
            checkpoints: Vec::new(),
            base_locks,
            must_abort: false,
            finished: false,
        }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn admin(&self) -> Option<Invid> {
        self.admin
    }

    pub fn admin_name(&self) -> &str {
        &self.admin_name
    }

    pub fn objects(&self) -> &[EditedObject] {
        &self.objects
    }

    pub fn events(&self) -> &[Arc<LogEvent>] {
        &self.events
    }

    /// Set once a rollback found the transaction's objects tampered with.
    /// Such a transaction can only be aborted.
    pub fn must_abort(&self) -> bool {
        self.must_abort
    }

    fn position(&self, invid: Invid) -> Option<usize> {
        self.objects.iter().position(|o| o.invid == invid)
    }

    pub fn status(&self, invid: Invid) -> Option<ObjectStatus> {
        self.position(invid).map(|idx| self.objects[idx].status)
    }

    // ── objects ──

    pub fn create_object(&mut self, type_id: u16) -> Invid {
        let invid = self.store.allocate(type_id, self.txn);
        self.objects.push(EditedObject {
            invid,
            status: ObjectStatus::Creating,
            original: None,
            fields: FieldImage::new(),
        });
        invid
    }

    /// Check `invid` out (if not already) and return its working image.
    pub fn edit_object(&mut self, invid: Invid) -> Result<&mut FieldImage, TxnError> {
        let idx = match self.position(invid) {
            Some(idx) => idx,
            None => {
                self.store.check_out(invid, self.txn)?;
                let original = match self.store.get(invid) {
                    Some(image) => image,
                    None => {
                        self.store.release(invid, self.txn);
                        return Err(TxnError::ObjectNotFound(invid));
                    }
                };
                self.objects.push(EditedObject {
                    invid,
                    status: ObjectStatus::Editing,
                    original: Some(original.clone()),
                    fields: original,
                });
                self.objects.len() - 1
            }
        };
        let object = &mut self.objects[idx];
        match object.status {
            ObjectStatus::Deleting | ObjectStatus::Dropping => Err(TxnError::ObjectDeleted(invid)),
            ObjectStatus::Editing | ObjectStatus::Creating => Ok(&mut object.fields),
        }
    }

    pub fn delete_object(&mut self, invid: Invid) -> Result<(), TxnError> {
        self.edit_object(invid)?;
        if let Some(idx) = self.position(invid) {
            let object = &mut self.objects[idx];
            object.status = match object.status {
                ObjectStatus::Creating => ObjectStatus::Dropping,
                _ => ObjectStatus::Deleting,
            };
        }
        Ok(())
    }

    pub fn set_field(
        &mut self,
        invid: Invid,
        field: FieldId,
        value: FieldValue,
    ) -> Result<(), TxnError> {
        self.edit_object(invid)?.set(field, value);
        Ok(())
    }

    pub fn clear_field(
        &mut self,
        invid: Invid,
        field: FieldId,
    ) -> Result<Option<FieldValue>, TxnError> {
        Ok(self.edit_object(invid)?.remove(field))
    }

    /// Add an element to a vector field, defining the field if absent.
    pub fn add_value(
        &mut self,
        invid: Invid,
        field: FieldId,
        value: VectorValue,
    ) -> Result<(), TxnError> {
        let image = self.edit_object(invid)?;
        match image.remove(field) {
            Some(FieldValue::Vector(mut values)) => {
                if !values.contains(&value) {
                    values.push(value);
                }
                image.set(field, FieldValue::Vector(values));
                Ok(())
            }
            None => {
                image.set(field, FieldValue::Vector(vec![value]));
                Ok(())
            }
            Some(other) => {
                image.set(field, other);
                Err(TxnError::DeltaModeMismatch {
                    field,
                    actual: "scalar",
                    attempted: "vector",
                })
            }
        }
    }

    /// Remove an element from a vector field. An emptied vector field is
    /// undefined.
    pub fn del_value(
        &mut self,
        invid: Invid,
        field: FieldId,
        value: &VectorValue,
    ) -> Result<(), TxnError> {
        let image = self.edit_object(invid)?;
        match image.remove(field) {
            Some(FieldValue::Vector(mut values)) => {
                values.retain(|v| v != value);
                if !values.is_empty() {
                    image.set(field, FieldValue::Vector(values));
                }
                Ok(())
            }
            None => Ok(()),
            Some(other) => {
                image.set(field, other);
                Err(TxnError::DeltaModeMismatch {
                    field,
                    actual: "scalar",
                    attempted: "vector",
                })
            }
        }
    }

    /// Working image of an object in this set.
    pub fn field_values(&self, invid: Invid) -> Option<&FieldImage> {
        self.position(invid).map(|idx| &self.objects[idx].fields)
    }

    /// Replace the working image of an object already in this set.
    pub fn restore_field_values(&mut self, invid: Invid, image: FieldImage) -> Result<(), TxnError> {
        let idx = self.position(invid).ok_or(TxnError::ObjectNotFound(invid))?;
        self.objects[idx].fields = image;
        Ok(())
    }

    /// Queue a log event for emission at commit.
    pub fn log(&mut self, event: LogEvent) {
        self.events.push(Arc::new(event));
    }

    // ── checkpoints ──

    pub fn checkpoint(&mut self, name: impl Into<String>) {
        let checkpoint = Checkpoint::capture(
            name,
            self.txn,
            &self.events,
            &self.objects,
            self.session,
            self.locks.as_ref(),
        );
        tracing::debug!(
            "{}: checkpoint '{}' ({} object(s))",
            self.txn,
            checkpoint.name(),
            checkpoint.objects().len()
        );
        self.checkpoints.push(checkpoint);
    }

    /// Roll back to the most recent checkpoint named `name`, discarding it
    /// and every checkpoint taken after it. Returns false if no such
    /// checkpoint exists.
    pub fn rollback(&mut self, name: &str) -> Result<bool, TxnError> {
        let Some(idx) = self.checkpoints.iter().rposition(|c| c.name() == name) else {
            return Ok(false);
        };
        let discarded = self.checkpoints.split_off(idx);
        let Some(checkpoint) = discarded.into_iter().next() else {
            return Ok(false);
        };
        let restored = checkpoint.restore(self);
        orrery_observability::record_rollback(restored.is_ok());
        restored.map(|_| true)
    }

    /// Remove the most recent checkpoint named `name` without rolling back.
    /// Checkpoints taken after it are dropped with it.
    pub fn pop_checkpoint(&mut self, name: &str) -> Option<Checkpoint> {
        let idx = self.checkpoints.iter().rposition(|c| c.name() == name)?;
        self.checkpoints.split_off(idx).into_iter().next()
    }

    /// Restore a checkpoint held outside the stack. The checkpoint is left
    /// untouched and can be restored again.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), TxnError> {
        checkpoint.restore(self)
    }

    pub fn checkpoint_names(&self) -> Vec<&str> {
        self.checkpoints.iter().map(Checkpoint::name).collect()
    }

    // ── commit support ──

    /// Net field changes of every object in the set, in check-out order.
    pub fn deltas(&self) -> Result<Vec<ObjectDelta>, TxnError> {
        let empty = FieldImage::new();
        let mut book = DeltaBook::new();
        for object in &self.objects {
            let original = object.original.as_ref().unwrap_or(&empty);
            let delta = match object.status {
                ObjectStatus::Dropping => continue,
                ObjectStatus::Deleting => ObjectDelta::diff(object.invid, original, &empty),
                ObjectStatus::Editing | ObjectStatus::Creating => {
                    ObjectDelta::diff(object.invid, original, &object.fields)
                }
            };
            book.absorb(delta)?;
        }
        Ok(book.finalize())
    }

    /// Write every object back to the store and release it.
    pub fn install(mut self) {
        for object in &self.objects {
            match object.status {
                ObjectStatus::Editing | ObjectStatus::Creating => {
                    self.store.install(object.invid, Some(object.fields.clone()));
                }
                ObjectStatus::Deleting => self.store.install(object.invid, None),
                ObjectStatus::Dropping => self.store.release(object.invid, self.txn),
            }
        }
        tracing::debug!("{}: installed {} object(s)", self.txn, self.objects.len());
        self.finished = true;
    }

    /// Release every object without committing and put the session's
    /// deletion locks back to what they were at transaction start.
    pub fn abort(mut self) {
        self.release_all();
        self.finished = true;
    }

    fn release_all(&mut self) {
        for object in self.objects.drain(..) {
            self.store.release(object.invid, self.txn);
        }
        self.events.clear();
        self.checkpoints.clear();
        self.locks.revert_session(self.session, &self.base_locks);
    }
}

impl Drop for EditSet {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("{}: edit set dropped without commit or abort", self.txn);
            self.release_all();
        }
    }
}

impl std::fmt::Debug for EditSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditSet")
            .field("txn", &self.txn)
            .field("session", &self.session)
            .field("objects", &self.objects.len())
            .field("events", &self.events.len())
            .field("checkpoints", &self.checkpoints.len())
            .field("must_abort", &self.must_abort)
            .finish()
    }
}
