use std::collections::{BTreeMap, HashMap};
use std::fmt;

use orrery_common::error::TxnError;
use orrery_common::types::{FieldId, FieldImage, FieldValue, Invid, VectorValue};
use serde::{Deserialize, Serialize};

/// Net change of one field within one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaChange {
    /// Replacement value; `None` means the field was removed. Also used to
    /// carry a newly defined vector field in full.
    Scalar(Option<FieldValue>),
    /// Elements added to and removed from a vector field. The two lists are
    /// duplicate-free and never share an element.
    Vector {
        added: Vec<VectorValue>,
        removed: Vec<VectorValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDelta {
    field_id: FieldId,
    change: DeltaChange,
}

impl FieldDelta {
    pub fn scalar(field_id: FieldId, value: Option<FieldValue>) -> Self {
        Self {
            field_id,
            change: DeltaChange::Scalar(value),
        }
    }

    pub fn vector(field_id: FieldId) -> Self {
        Self {
            field_id,
            change: DeltaChange::Vector {
                added: Vec::new(),
                removed: Vec::new(),
            },
        }
    }

    pub fn field_id(&self) -> FieldId {
        self.field_id
    }

    pub fn change(&self) -> &DeltaChange {
        &self.change
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.change, DeltaChange::Vector { .. })
    }

    /// Last write wins.
    pub fn record_scalar(&mut self, value: Option<FieldValue>) -> Result<(), TxnError> {
        if let DeltaChange::Scalar(current) = &mut self.change {
            *current = value;
            return Ok(());
        }
        Err(self.mode_mismatch("scalar"))
    }

    /// Adding a value pending removal cancels the removal.
    pub fn add_value(&mut self, value: VectorValue) -> Result<(), TxnError> {
        let field = self.field_id;
        match &mut self.change {
            DeltaChange::Vector { added, removed } => {
                if let Some(pos) = removed.iter().position(|v| *v == value) {
                    removed.remove(pos);
                } else if !added.contains(&value) {
                    added.push(value);
                }
                Ok(())
            }
            DeltaChange::Scalar(_) => Err(TxnError::DeltaModeMismatch {
                field,
                actual: "scalar",
                attempted: "vector",
            }),
        }
    }

    /// Removing a value pending addition cancels the addition.
    pub fn del_value(&mut self, value: VectorValue) -> Result<(), TxnError> {
        let field = self.field_id;
        match &mut self.change {
            DeltaChange::Vector { added, removed } => {
                if let Some(pos) = added.iter().position(|v| *v == value) {
                    added.remove(pos);
                } else if !removed.contains(&value) {
                    removed.push(value);
                }
                Ok(())
            }
            DeltaChange::Scalar(_) => Err(TxnError::DeltaModeMismatch {
                field,
                actual: "scalar",
                attempted: "vector",
            }),
        }
    }

    pub fn added(&self) -> &[VectorValue] {
        match &self.change {
            DeltaChange::Vector { added, .. } => added,
            DeltaChange::Scalar(_) => &[],
        }
    }

    pub fn removed(&self) -> &[VectorValue] {
        match &self.change {
            DeltaChange::Vector { removed, .. } => removed,
            DeltaChange::Scalar(_) => &[],
        }
    }

    /// True when the record has no net effect. A scalar record always
    /// describes a change.
    pub fn is_empty(&self) -> bool {
        match &self.change {
            DeltaChange::Scalar(_) => false,
            DeltaChange::Vector { added, removed } => added.is_empty() && removed.is_empty(),
        }
    }

    /// Fold a later change to the same field into this one.
    pub fn merge(&mut self, later: FieldDelta) -> Result<(), TxnError> {
        match later.change {
            DeltaChange::Scalar(value) => {
                // a full replacement supersedes anything recorded so far
                self.change = DeltaChange::Scalar(value);
                Ok(())
            }
            DeltaChange::Vector { added, removed } => {
                if let DeltaChange::Scalar(Some(FieldValue::Vector(values))) = &mut self.change {
                    values.retain(|v| !removed.contains(v));
                    for v in added {
                        if !values.contains(&v) {
                            values.push(v);
                        }
                    }
                    return Ok(());
                }
                for v in added {
                    self.add_value(v)?;
                }
                for v in removed {
                    self.del_value(v)?;
                }
                Ok(())
            }
        }
    }

    fn mode_mismatch(&self, attempted: &'static str) -> TxnError {
        TxnError::DeltaModeMismatch {
            field: self.field_id,
            actual: if self.is_vector() { "vector" } else { "scalar" },
            attempted,
        }
    }
}

fn join_values(values: &[VectorValue]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    parts.join(", ")
}

impl fmt::Display for FieldDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.change {
            DeltaChange::Scalar(Some(value)) => write!(f, "field {}: set {}", self.field_id, value),
            DeltaChange::Scalar(None) => write!(f, "field {}: cleared", self.field_id),
            DeltaChange::Vector { added, removed } => write!(
                f,
                "field {}: added [{}] removed [{}]",
                self.field_id,
                join_values(added),
                join_values(removed)
            ),
        }
    }
}

/// Field-level changes of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDelta {
    pub invid: Invid,
    fields: BTreeMap<FieldId, FieldDelta>,
}

impl ObjectDelta {
    pub fn new(invid: Invid) -> Self {
        Self {
            invid,
            fields: BTreeMap::new(),
        }
    }

    /// Compute the delta that turns `old` into `new`.
    pub fn diff(invid: Invid, old: &FieldImage, new: &FieldImage) -> Self {
        let mut delta = Self::new(invid);
        let mut ids: Vec<FieldId> = old.field_ids().chain(new.field_ids()).collect();
        ids.sort();
        ids.dedup();

        for id in ids {
            let record = match (old.get(id), new.get(id)) {
                (None, None) => continue,
                (Some(_), None) => FieldDelta::scalar(id, None),
                (None, Some(value)) => FieldDelta::scalar(id, Some(value.clone())),
                (Some(a), Some(b)) if a == b => continue,
                (Some(FieldValue::Vector(a)), Some(FieldValue::Vector(b))) => {
                    let mut record = FieldDelta::vector(id);
                    if let DeltaChange::Vector { added, removed } = &mut record.change {
                        *added = b.iter().filter(|v| !a.contains(v)).cloned().collect();
                        *removed = a.iter().filter(|v| !b.contains(v)).cloned().collect();
                    }
                    record
                }
                (Some(_), Some(value)) => FieldDelta::scalar(id, Some(value.clone())),
            };
            delta.fields.insert(id, record);
        }
        delta
    }

    /// Record a change, merging with an earlier change to the same field.
    pub fn record(&mut self, change: FieldDelta) -> Result<(), TxnError> {
        match self.fields.get_mut(&change.field_id) {
            Some(existing) => existing.merge(change),
            None => {
                self.fields.insert(change.field_id, change);
                Ok(())
            }
        }
    }

    /// Apply to `original`, the image of `target`, returning the new image.
    pub fn apply(&self, target: Invid, original: &FieldImage) -> Result<FieldImage, TxnError> {
        if target != self.invid {
            return Err(TxnError::DeltaIdentityMismatch {
                expected: self.invid,
                actual: target,
            });
        }
        let mut image = original.clone();
        for record in self.fields.values() {
            match &record.change {
                DeltaChange::Scalar(None) => {
                    image.remove(record.field_id);
                }
                DeltaChange::Scalar(Some(value)) => {
                    image.set(record.field_id, value.clone());
                }
                DeltaChange::Vector { added, removed } => {
                    let mut values = match image.remove(record.field_id) {
                        Some(FieldValue::Vector(values)) => values,
                        None => Vec::new(),
                        Some(_) => {
                            return Err(TxnError::DeltaModeMismatch {
                                field: record.field_id,
                                actual: "scalar",
                                attempted: "vector",
                            });
                        }
                    };
                    values.retain(|v| !removed.contains(v));
                    for v in added {
                        if !values.contains(v) {
                            values.push(v.clone());
                        }
                    }
                    if !values.is_empty() {
                        image.set(record.field_id, FieldValue::Vector(values));
                    }
                }
            }
        }
        Ok(image)
    }

    pub fn field(&self, id: FieldId) -> Option<&FieldDelta> {
        self.fields.get(&id)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDelta> {
        self.fields.values()
    }

    pub fn changed_fields(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.fields.values().filter(|r| !r.is_empty()).map(|r| r.field_id)
    }

    /// Drop records with no net effect.
    pub fn prune(&mut self) {
        self.fields.retain(|_, r| !r.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(FieldDelta::is_empty)
    }
}

impl fmt::Display for ObjectDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ObjectDelta: invid {}", self.invid)?;
        for record in self.fields.values() {
            writeln!(f, "  {}", record)?;
        }
        Ok(())
    }
}

/// Accumulates the deltas of one transaction, per object and field, in
/// first-touched object order.
#[derive(Debug, Default)]
pub struct DeltaBook {
    order: Vec<Invid>,
    objects: HashMap<Invid, ObjectDelta>,
}

impl DeltaBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, invid: Invid) -> &mut ObjectDelta {
        if !self.objects.contains_key(&invid) {
            self.order.push(invid);
        }
        self.objects
            .entry(invid)
            .or_insert_with(|| ObjectDelta::new(invid))
    }

    pub fn record_scalar(
        &mut self,
        invid: Invid,
        field: FieldId,
        value: Option<FieldValue>,
    ) -> Result<(), TxnError> {
        self.entry(invid).record(FieldDelta::scalar(field, value))
    }

    pub fn record_add(
        &mut self,
        invid: Invid,
        field: FieldId,
        value: VectorValue,
    ) -> Result<(), TxnError> {
        let object = self.entry(invid);
        match object.fields.get_mut(&field) {
            Some(existing) => existing.add_value(value),
            None => {
                let mut record = FieldDelta::vector(field);
                record.add_value(value)?;
                object.fields.insert(field, record);
                Ok(())
            }
        }
    }

    pub fn record_remove(
        &mut self,
        invid: Invid,
        field: FieldId,
        value: VectorValue,
    ) -> Result<(), TxnError> {
        let object = self.entry(invid);
        match object.fields.get_mut(&field) {
            Some(existing) => existing.del_value(value),
            None => {
                let mut record = FieldDelta::vector(field);
                record.del_value(value)?;
                object.fields.insert(field, record);
                Ok(())
            }
        }
    }

    /// Merge a whole object delta, e.g. one produced by `ObjectDelta::diff`.
    pub fn absorb(&mut self, delta: ObjectDelta) -> Result<(), TxnError> {
        let object = self.entry(delta.invid);
        for (_, record) in delta.fields {
            object.record(record)?;
        }
        Ok(())
    }

    pub fn get(&self, invid: Invid) -> Option<&ObjectDelta> {
        self.objects.get(&invid)
    }

    /// Prune empty records and objects; the rest in first-touched order.
    pub fn finalize(mut self) -> Vec<ObjectDelta> {
        let mut out = Vec::with_capacity(self.order.len());
        for invid in self.order {
            if let Some(mut delta) = self.objects.remove(&invid) {
                delta.prune();
                if !delta.fields.is_empty() {
                    out.push(delta);
                }
            }
        }
        out
    }
}
